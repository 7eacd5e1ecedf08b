//! Shared test utilities for the integration suites.
//!
//! Import with `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Barrier, Once, Weak};
use std::thread;

pub use objtrack::{
    ChildLink, DeletePolicy, Entity, EntityState, IndexConfig, Indexable, ObjectTracker,
    RelationshipProvider, Result, StoreConfig, Value,
};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness writer
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Domain fixtures
// ============================================================================

/// Property-bag row with a type name
pub struct Row {
    type_name: &'static str,
    props: Mutex<HashMap<String, Value>>,
}

impl Row {
    pub fn new(type_name: &'static str, props: &[(&str, Value)]) -> Arc<Self> {
        Arc::new(Self {
            type_name,
            props: Mutex::new(
                props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
        })
    }

    pub fn customer(id: i64, ssn: &str) -> Arc<Self> {
        Self::new(
            "Customer",
            &[("Id", Value::Int(id)), ("SSN", Value::from(ssn))],
        )
    }

    pub fn order(id: i64, customer: i64) -> Arc<Self> {
        Self::new(
            "Order",
            &[("Id", Value::Int(id)), ("CustomerId", Value::Int(customer))],
        )
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.props.lock().get(name).cloned()
    }
}

impl Entity for Row {
    fn type_name(&self) -> &str {
        self.type_name
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        self.get(name)
    }

    fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.props.lock().insert(name.to_string(), value);
        Ok(())
    }
}

impl Indexable for Row {
    fn get_value(&self, property: &str, _unwrap: bool) -> Option<Value> {
        self.get(property)
    }
}

/// Orders reference customers through `CustomerId`
///
/// Children are found by scanning registered orders, the way a key
/// collaborator would query foreign keys.
#[derive(Default)]
pub struct CustomerOrders {
    orders: Mutex<Vec<Weak<Row>>>,
}

impl CustomerOrders {
    pub fn register(&self, order: &Arc<Row>) {
        self.orders.lock().push(Arc::downgrade(order));
    }
}

impl RelationshipProvider for CustomerOrders {
    fn children_of(&self, parent: &dyn Entity) -> Vec<ChildLink> {
        if parent.type_name() != "Customer" {
            return Vec::new();
        }
        let Some(id) = parent.get_property("Id") else {
            return Vec::new();
        };
        self.orders
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|order| order.get("CustomerId").as_ref() == Some(&id))
            .map(|order| {
                let child: Arc<dyn Entity> = order;
                ChildLink::new(child, ["CustomerId"])
            })
            .collect()
    }
}

// ============================================================================
// Threads
// ============================================================================

/// Run `work(thread_index)` on `threads` threads released together
pub fn run_parallel<F>(threads: usize, work: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let work = Arc::clone(&work);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                work(t);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
