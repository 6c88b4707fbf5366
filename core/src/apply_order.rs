//! `BuildApplyNodeOrder` (§4.3): the node order the Apply Engine issues
//! `RealmInstanceApply` batches in. Traffic flows entry -> ... -> target, so
//! apply runs in reverse: downstream nodes go live before anything upstream
//! can route to them, and the entry node — the only node that can draw
//! client traffic in — is always started last.

use crate::model::{HopKind, NodeId, RuleConfig};
use crate::sort::{stable_sort_hops, stable_sort_relays};
use std::collections::HashSet;

/// Builds the apply order for a single planning run of `config`.
/// Invariants (§8): the entry node is always last, no node repeats, and
/// every node that `plan()` would generate instances for appears exactly
/// once.
pub fn build_apply_node_order(config: &RuleConfig) -> Vec<NodeId> {
	let entry = config.entry_node_id().clone();
	let mut raw: Vec<NodeId> = Vec::new();

	match config {
		RuleConfig::Direct { .. } => {},
		RuleConfig::RelayGroup { relays, .. } => {
			for r in stable_sort_relays(relays) {
				raw.push(r.node_id);
			}
		},
		RuleConfig::Chain { hops, .. } => {
			// Downstream-first: hops closest to the target (highest sort_order)
			// go live before hops closer to the entry.
			for hop in stable_sort_hops(hops).into_iter().rev() {
				match hop.kind {
					HopKind::Direct { node_id, .. } => raw.push(node_id),
					HopKind::RelayGroup { relays, .. } => {
						for r in stable_sort_relays(&relays) {
							raw.push(r.node_id);
						}
					},
				}
			}
		},
	}

	raw.push(entry.clone());
	dedup_keep_first(raw)
}

/// The hot-update variant (§4.3 example 3): nodes the old config applied to
/// but the new config no longer names (e.g. a removed chain hop) must still
/// be visited — to tear their instances down — before the new order runs.
/// They're prepended in their old relative order, entry excluded (the entry
/// is never torn down mid-update; it is simply re-applied last as usual).
pub fn build_hot_update_node_order(old_config: &RuleConfig, new_config: &RuleConfig) -> Vec<NodeId> {
	let new_order = build_apply_node_order(new_config);
	let new_set: HashSet<&NodeId> = new_order.iter().collect();
	let entry = new_config.entry_node_id();

	let old_order = build_apply_node_order(old_config);
	let removed: Vec<NodeId> = old_order
		.into_iter()
		.filter(|n| n != entry && !new_set.contains(n))
		.collect();

	let mut out = removed;
	out.extend(new_order);
	dedup_keep_first(out)
}

fn dedup_keep_first(nodes: Vec<NodeId>) -> Vec<NodeId> {
	let mut seen = HashSet::new();
	let mut out = Vec::with_capacity(nodes.len());
	for n in nodes {
		if seen.insert(n.clone()) {
			out.push(n);
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Hop, Protocol, Relay, Strategy, Target};

	fn relay(node_id: &str, sort_order: i64) -> Relay {
		Relay {
			node_id: node_id.to_string(),
			port_spec: "7000".to_string(),
			current_port: 7000,
			sort_order,
		}
	}

	fn direct_hop(node_id: &str, sort_order: i64) -> Hop {
		Hop {
			sort_order,
			kind: HopKind::Direct {
				node_id: node_id.to_string(),
				port_spec: "6000".to_string(),
				current_port: 6000,
			},
			network: None,
		}
	}

	fn base_chain(hops: Vec<Hop>) -> RuleConfig {
		RuleConfig::Chain {
			entry_node_id: "entry".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Literal {
				host: "1.2.3.4".into(),
				port: 443,
			},
			hops,
			network: None,
		}
	}

	// Scenario 1 (§8): direct start -> order is just [A].
	#[test]
	fn direct_order_is_entry_only() {
		let cfg = RuleConfig::Direct {
			entry_node_id: "A".into(),
			entry_port_spec: "8080".into(),
			entry_current_port: 8080,
			protocol: Protocol::Tcp,
			target: Target::Literal {
				host: "1.2.3.4".into(),
				port: 443,
			},
			network: None,
		};
		assert_eq!(build_apply_node_order(&cfg), vec!["A".to_string()]);
	}

	// Scenario 2 (§8): relay-group failover -> apply order [B, C, A].
	#[test]
	fn relay_group_order_is_relays_then_entry() {
		let cfg = RuleConfig::RelayGroup {
			entry_node_id: "A".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Literal {
				host: "1.2.3.4".into(),
				port: 443,
			},
			strategy: Strategy::Failover,
			relays: vec![relay("B", 0), relay("C", 1)],
			network: None,
		};
		assert_eq!(
			build_apply_node_order(&cfg),
			vec!["B".to_string(), "C".to_string(), "A".to_string()]
		);
	}

	#[test]
	fn entry_is_always_last_and_nodes_never_repeat() {
		let cfg = base_chain(vec![direct_hop("H1", 0), direct_hop("H2", 1)]);
		let order = build_apply_node_order(&cfg);
		assert_eq!(order.last(), Some(&"entry".to_string()));
		let unique: HashSet<_> = order.iter().collect();
		assert_eq!(unique.len(), order.len());
		assert_eq!(order, vec!["H2".to_string(), "H1".to_string(), "entry".to_string()]);
	}

	// Scenario 3 (§8): chain hot update, H1 removed and H3 added ->
	// ops order H1, H3, H2, entry.
	#[test]
	fn chain_hot_update_prepends_removed_hop_before_new_order() {
		let old = base_chain(vec![direct_hop("H1", 0), direct_hop("H2", 1)]);
		let new = base_chain(vec![direct_hop("H2", 1), direct_hop("H3", 2)]);
		let order = build_hot_update_node_order(&old, &new);
		assert_eq!(
			order,
			vec!["H1".to_string(), "H3".to_string(), "H2".to_string(), "entry".to_string()]
		);
	}

	#[test]
	fn hot_update_with_no_removed_nodes_matches_new_order() {
		let old = base_chain(vec![direct_hop("H1", 0)]);
		let new = base_chain(vec![direct_hop("H1", 0), direct_hop("H2", 1)]);
		let order = build_hot_update_node_order(&old, &new);
		assert_eq!(order, build_apply_node_order(&new));
	}
}
