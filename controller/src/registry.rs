//! Node id -> IP registry. Node inventory/SSH install/agent registration are
//! external collaborators (§1); the controller only needs a narrow lookup
//! from node id to a dialable address, which is exactly the `NodeResolver`
//! capability the planner consumes (§9 "callbacks via capability").

use komari_forward_core::planner::NodeResolver;
use komari_forward_core::CoreError;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct NodeRegistry {
	nodes: RwLock<HashMap<String, String>>,
}

impl NodeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, node_id: impl Into<String>, addr: impl Into<String>) {
		self.nodes.write().insert(node_id.into(), addr.into());
	}

	pub fn get(&self, node_id: &str) -> Option<String> {
		self.nodes.read().get(node_id).cloned()
	}
}

impl NodeResolver for NodeRegistry {
	fn resolve(&self, node_id: &str) -> Result<String, CoreError> {
		self.get(node_id).ok_or_else(|| CoreError::InvalidConfig(format!("unknown node {node_id}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_a_registered_node() {
		let registry = NodeRegistry::new();
		registry.set("A", "10.0.0.1");
		assert_eq!(registry.resolve("A").unwrap(), "10.0.0.1");
	}

	#[test]
	fn unknown_node_is_invalid_config() {
		let registry = NodeRegistry::new();
		assert!(registry.resolve("ghost").is_err());
	}
}
