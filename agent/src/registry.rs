//! Instance Registry (§4.9/§4.10): the agent's view of which instances it
//! currently runs, populated as the Task Router processes `upsert`/`delete`
//! ops so the Instance Stats Reporter knows what to poll without asking the
//! forwarder daemon to enumerate for it.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct InstanceMeta {
	pub rule_id: u32,
	pub listen: String,
	pub listen_port: u16,
	/// Parsed `(host, port)` targets the Stats Programmer's OUT jump rule
	/// matches on; empty when nothing in `remote`/`extraRemotes` parsed.
	pub remotes: Vec<(String, u16)>,
	/// The endpoint config's `(noTcp, useUdp)` pair (§3 Rule Config
	/// `protocol`), used to derive which firewall/counter protocols apply.
	pub protos: (bool, bool),
}

#[derive(Default)]
pub struct InstanceRegistry {
	instances: RwLock<HashMap<String, InstanceMeta>>,
}

impl InstanceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn upsert(&self, instance_id: &str, meta: InstanceMeta) {
		self.instances.write().insert(instance_id.to_string(), meta);
	}

	pub fn remove(&self, instance_id: &str) -> Option<InstanceMeta> {
		self.instances.write().remove(instance_id)
	}

	pub fn get(&self, instance_id: &str) -> Option<InstanceMeta> {
		self.instances.read().get(instance_id).cloned()
	}

	pub fn snapshot(&self) -> Vec<(String, InstanceMeta)> {
		self.instances.read().iter().map(|(id, meta)| (id.clone(), meta.clone())).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn upsert_then_remove_round_trips() {
		let registry = InstanceRegistry::new();
		registry.upsert(
			"komari-r1-nA-entry",
			InstanceMeta {
				rule_id: 1,
				listen: "0.0.0.0:8080".into(),
				listen_port: 8080,
				remotes: vec![],
				protos: (false, false),
			},
		);
		assert!(registry.get("komari-r1-nA-entry").is_some());
		assert_eq!(registry.snapshot().len(), 1);
		registry.remove("komari-r1-nA-entry");
		assert!(registry.get("komari-r1-nA-entry").is_none());
	}
}
