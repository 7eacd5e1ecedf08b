//! Entities shared by the unit tests

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

use objtrack_core::{Result, Value};

use crate::entity::Entity;
use crate::relationships::{ChildLink, RelationshipProvider};

/// Property-bag entity
pub struct Node {
    type_name: &'static str,
    props: Mutex<FxHashMap<String, Value>>,
}

impl Node {
    pub fn new(name: &str) -> Arc<Self> {
        Self::typed("Node", &[("Name", Value::from(name))])
    }

    pub fn typed(type_name: &'static str, props: &[(&str, Value)]) -> Arc<Self> {
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
}

impl Entity for Node {
    fn type_name(&self) -> &str {
        self.type_name
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        self.props.lock().get(name).cloned()
    }

    fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.props.lock().insert(name.to_string(), value);
        Ok(())
    }
}

/// Parent → children table keyed by entity address
#[derive(Default)]
pub struct Graph {
    links: RwLock<FxHashMap<usize, Vec<ChildLink>>>,
}

impl Graph {
    pub fn link(&self, parent: &Arc<Node>, child: &Arc<Node>, foreign_key: &str) {
        let child: Arc<dyn Entity> = child.clone();
        self.links
            .write()
            .entry(crate::entity::address_of(&**parent))
            .or_default()
            .push(ChildLink::new(child, [foreign_key]));
    }
}

impl RelationshipProvider for Graph {
    fn children_of(&self, parent: &dyn Entity) -> Vec<ChildLink> {
        self.links
            .read()
            .get(&crate::entity::address_of(parent))
            .cloned()
            .unwrap_or_default()
    }
}
