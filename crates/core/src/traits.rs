//! Core trait definitions
//!
//! `Indexable` is the narrow contract between stores and the items they
//! hold: a store never inspects an item except through this trait.

use crate::value::Value;

/// An item whose properties can be used as index keys
///
/// Implementations decide how a property name is resolved; there is no
/// reflection behind it. Returning `None` means the property has no value,
/// which stores treat as `Value::Null` unless the index never tracks nulls.
///
/// # Example
///
/// ```
/// use objtrack_core::{Indexable, Value};
///
/// struct Person { ssn: String }
///
/// impl Indexable for Person {
///     fn get_value(&self, property: &str, _unwrap: bool) -> Option<Value> {
///         match property {
///             "SSN" => Some(Value::from(self.ssn.as_str())),
///             _ => None,
///         }
///     }
/// }
///
/// let p = Person { ssn: "123".into() };
/// assert_eq!(p.get_value("SSN", false), Some(Value::from("123")));
/// ```
pub trait Indexable: Send + Sync {
    /// Current value of `property`
    ///
    /// `unwrap` asks wrapping implementations to resolve the property on the
    /// underlying instance instead of the wrapper.
    fn get_value(&self, property: &str, unwrap: bool) -> Option<Value>;

    /// Whether the item still refers to a live object
    ///
    /// Items that report `false` are skipped by enumerations and evicted
    /// opportunistically.
    fn is_alive(&self) -> bool {
        true
    }
}

impl<T: Indexable + ?Sized> Indexable for std::sync::Arc<T> {
    fn get_value(&self, property: &str, unwrap: bool) -> Option<Value> {
        (**self).get_value(property, unwrap)
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }
}
