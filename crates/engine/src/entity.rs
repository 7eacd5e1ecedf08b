//! Domain object contract
//!
//! The tracker never reflects over domain types. Anything it tracks
//! implements [`Entity`]; a [`PropertyAccessor`] can sit in front of it to
//! give uniform property access across types.

use objtrack_core::{Result, Value};

/// A domain object that can participate in a unit of work
///
/// Setters take `&self`: entities are shared through `Arc` and use
/// interior mutability for their fields.
pub trait Entity: Send + Sync + 'static {
    /// Declared type name, used for display and diagnostics
    fn type_name(&self) -> &str;

    /// Current value of a property, `None` if it has no value
    fn get_property(&self, name: &str) -> Option<Value>;

    /// Overwrite a property
    fn set_property(&self, name: &str, value: Value) -> Result<()>;
}

/// Uniform property access layered over entities
pub trait PropertyAccessor: Send + Sync {
    /// Read `name` from `target`
    fn get(&self, target: &dyn Entity, name: &str) -> Option<Value>;

    /// Write `name` on `target`
    fn set(&self, target: &dyn Entity, name: &str, value: Value) -> Result<()>;
}

/// Address identifying an entity allocation
pub(crate) fn address_of(entity: &dyn Entity) -> usize {
    (entity as *const dyn Entity).cast::<()>() as usize
}

/// Index key for an entity address
pub(crate) fn address_value(address: usize) -> Value {
    Value::Int(address as i64)
}
