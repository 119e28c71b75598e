use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use shared::protocol::{METHOD_ADD_ACTIVE_NODE, METHOD_DEL_ACTIVE_NODE, METHOD_HAS_ACTIVE_NODE};
use crate::plugmgr::{kwargs_str, Kwargs, ManagerError, ManagerResult, ModuleManager};
use super::{Node, NodeState};

/// Active nodes keyed by element id.
///
/// Mutation goes through the manager's custom methods (see [`install`]);
/// everything else only reads.
///
/// [`install`]: NodeRegistry::install
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, element: &str, node: Node) -> ManagerResult<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(element) {
            return Err(ManagerError::DuplicateNode(element.to_string()));
        }
        nodes.insert(element.to_string(), node);
        drop(nodes);

        tracing::info!("Node {} is active", element);
        Ok(())
    }

    fn remove(&self, element: &str) -> Option<Node> {
        let removed = self.nodes.write().remove(element);
        match removed {
            Some(mut node) => {
                node.state = NodeState::Removed;
                tracing::info!("Node {} removed", element);
                Some(node)
            }
            None => {
                tracing::warn!("Cannot remove node {}: not active", element);
                None
            }
        }
    }

    pub fn contains(&self, element: &str) -> bool {
        self.nodes.read().contains_key(element)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn get(&self, element: &str) -> Option<Node> {
        self.nodes.read().get(element).cloned()
    }

    /// Serializable view of every active node; `simple` keeps only the summary
    pub fn list(&self, simple: bool) -> BTreeMap<String, Value> {
        self.nodes
            .read()
            .iter()
            .map(|(element, node)| {
                let view = if simple {
                    node.summary()
                } else {
                    serde_json::to_value(node).unwrap_or(Value::Null)
                };
                (element.clone(), view)
            })
            .collect()
    }

    /// Install the registry's custom methods on `manager`
    pub fn install(&self, manager: &ModuleManager) {
        let registry = self.clone();
        manager.install_custom_method(METHOD_ADD_ACTIVE_NODE, move |args: &Kwargs| {
            let element = kwargs_str(args, "element")?;
            let node = args
                .get("node")
                .cloned()
                .ok_or_else(|| ManagerError::InvalidArguments("node is required".into()))?;
            let node: Node = serde_json::from_value(node)
                .map_err(|e| ManagerError::InvalidArguments(format!("node: {}", e)))?;
            registry.add(element, node)?;
            Ok(Value::Null)
        });

        let registry = self.clone();
        manager.install_custom_method(METHOD_DEL_ACTIVE_NODE, move |args: &Kwargs| {
            let element = kwargs_str(args, "element")?;
            Ok(json!(registry.remove(element).is_some()))
        });

        let registry = self.clone();
        manager.install_custom_method(METHOD_HAS_ACTIVE_NODE, move |args: &Kwargs| {
            let element = kwargs_str(args, "element")?;
            Ok(json!(registry.contains(element)))
        });
    }
}
