//! Tracked object records
//!
//! A [`TrackedObject`] is the store's view of one domain object:
//! - Weak references to the instance and its optional wrapper
//! - The lifecycle state
//! - First-seen values of changed properties
//! - Services bound to the object, keyed by type
//!
//! The record never keeps its object alive. Every access re-checks the weak
//! references; once both are gone the record is dead and only its cached
//! addresses remain readable.

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Weak};

use objtrack_core::{Error, Indexable, Result, Value};

use crate::entity::{address_of, address_value, Entity, PropertyAccessor};
use crate::state::EntityState;

/// Index holding each record's instance address
pub const INSTANCE_PROPERTY: &str = "Instance";

/// Index holding each record's wrapper address
pub const WRAPPER_PROPERTY: &str = "Wrapper";

/// One domain object participating in a unit of work
pub struct TrackedObject {
    base_type: String,
    base_name: String,
    instance: Weak<dyn Entity>,
    wrapper: Option<Weak<dyn Entity>>,
    instance_address: usize,
    wrapper_address: Option<usize>,
    accessor: Option<Arc<dyn PropertyAccessor>>,
    state: Mutex<EntityState>,
    originals: Mutex<FxHashMap<String, Value>>,
    services: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TrackedObject {
    /// Record for `instance`, optionally seen through `wrapper`
    pub fn new(
        instance: &Arc<dyn Entity>,
        wrapper: Option<&Arc<dyn Entity>>,
        state: EntityState,
    ) -> Self {
        let base_type = instance.type_name().to_string();
        let instance_address = address_of(&**instance);
        Self {
            base_name: format!("{}@{:x}", base_type, instance_address),
            base_type,
            instance: Arc::downgrade(instance),
            wrapper: wrapper.map(Arc::downgrade),
            instance_address,
            wrapper_address: wrapper.map(|w| address_of(&**w)),
            accessor: None,
            state: Mutex::new(state),
            originals: Mutex::new(FxHashMap::default()),
            services: DashMap::new(),
        }
    }

    /// Route property access through `accessor`
    pub fn with_accessor(mut self, accessor: Arc<dyn PropertyAccessor>) -> Self {
        self.accessor = Some(accessor);
        self
    }

    /// Declared type of the instance
    pub fn base_type(&self) -> &str {
        &self.base_type
    }

    /// Display name, unique per instance allocation
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Address of the instance allocation
    pub fn instance_address(&self) -> usize {
        self.instance_address
    }

    /// Address of the wrapper allocation, if wrapped
    pub fn wrapper_address(&self) -> Option<usize> {
        self.wrapper_address
    }

    /// Whether the instance or the wrapper still exists
    pub fn is_alive(&self) -> bool {
        self.instance.strong_count() > 0
            || self.wrapper.as_ref().is_some_and(|w| w.strong_count() > 0)
    }

    /// The instance, if it still exists
    pub fn instance(&self) -> Option<Arc<dyn Entity>> {
        self.instance.upgrade()
    }

    /// The wrapper, if there is one and it still exists
    pub fn wrapper(&self) -> Option<Arc<dyn Entity>> {
        self.wrapper.as_ref().and_then(Weak::upgrade)
    }

    /// Object property reads go to: the wrapper unless `unwrap`, else the instance
    fn target(&self, unwrap: bool) -> Option<Arc<dyn Entity>> {
        if unwrap {
            self.instance()
        } else {
            self.wrapper().or_else(|| self.instance())
        }
    }

    /// Whether this record tracks exactly `entity` as instance or wrapper
    pub fn refers_to(&self, entity: &dyn Entity) -> bool {
        let address = address_of(entity);
        address == self.instance_address || Some(address) == self.wrapper_address
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Current value of a domain property
    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.read_property(name, false)
    }

    fn read_property(&self, name: &str, unwrap: bool) -> Option<Value> {
        let target = self.target(unwrap)?;
        match &self.accessor {
            Some(accessor) => accessor.get(&*target, name),
            None => target.get_property(name),
        }
    }

    /// Write a domain property, returning its previous value
    ///
    /// Lifecycle state is left alone; the tracker handles that.
    pub fn set_property(&self, name: &str, value: Value) -> Result<Option<Value>> {
        let target = self
            .target(false)
            .ok_or_else(|| Error::invalid_argument(format!("{} is no longer alive", self.base_name)))?;
        let old = match &self.accessor {
            Some(accessor) => {
                let old = accessor.get(&*target, name);
                accessor.set(&*target, name, value)?;
                old
            }
            None => {
                let old = target.get_property(name);
                target.set_property(name, value)?;
                old
            }
        };
        Ok(old)
    }

    /// Remember `old` as the original value of `name` unless one is recorded
    pub fn record_original(&self, name: &str, old: Option<Value>) {
        self.originals
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| old.unwrap_or(Value::Null));
    }

    /// Value `name` had before its first tracked change
    pub fn original_value(&self, name: &str) -> Option<Value> {
        self.originals.lock().get(name).cloned()
    }

    /// Names of every property changed since the last accept
    pub fn changed_properties(&self) -> Vec<String> {
        let mut names: Vec<String> = self.originals.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn clear_originals(&self) {
        self.originals.lock().clear();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Current lifecycle state
    pub fn state(&self) -> EntityState {
        *self.state.lock()
    }

    /// Move to `to` along an allowed edge, returning the previous state
    pub fn transition(&self, to: EntityState) -> Result<EntityState> {
        let mut state = self.state.lock();
        let previous = *state;
        *state = previous.transition(to)?;
        Ok(previous)
    }

    /// Apply `f` to the state atomically
    pub(crate) fn update_state<F>(&self, f: F) -> Result<EntityState>
    where
        F: FnOnce(EntityState) -> Result<EntityState>,
    {
        let mut state = self.state.lock();
        *state = f(*state)?;
        Ok(*state)
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Service of type `S` bound to this object, created on first use
    pub fn bind_service<S: Any + Send + Sync + Default>(&self) -> Result<Arc<S>> {
        let type_id = TypeId::of::<S>();
        let entry = self
            .services
            .entry(type_id)
            .or_insert_with(|| Arc::new(S::default()) as Arc<dyn Any + Send + Sync>);
        entry.value().clone().downcast::<S>().map_err(|_| {
            Error::corrupt(format!("service type mismatch for TypeId {:?}", type_id))
        })
    }

    /// Bind an existing service, replacing any of the same type
    pub fn insert_service<S: Any + Send + Sync>(&self, service: Arc<S>) {
        self.services.insert(TypeId::of::<S>(), service);
    }

    /// Service of type `S`, if bound
    pub fn service<S: Any + Send + Sync>(&self) -> Option<Arc<S>> {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.value().clone().downcast::<S>().ok())
    }

    /// Number of bound services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Indexable for TrackedObject {
    fn get_value(&self, property: &str, unwrap: bool) -> Option<Value> {
        match property {
            INSTANCE_PROPERTY => Some(address_value(self.instance_address)),
            WRAPPER_PROPERTY => self.wrapper_address.map(address_value),
            _ => self.read_property(property, unwrap),
        }
    }

    fn is_alive(&self) -> bool {
        TrackedObject::is_alive(self)
    }
}

impl fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedObject")
            .field("name", &self.base_name)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .field("wrapped", &self.wrapper_address.is_some())
            .finish()
    }
}
