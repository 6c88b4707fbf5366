//! The rule-to-instances compiler (§4.2). `plan` is a pure function of
//! `(rule_id, config, resolver)` — no I/O, no mutable global state, so it is
//! trivially safe to re-run (`plan(plan(rule)) == plan(rule)`, §8).

use crate::model::{Hop, HopKind, NetworkConfig, PlannedInstance, Protocol, Relay, RuleConfig, RuleId, Strategy, Target};
use crate::sort::{stable_sort_hops, stable_sort_relays};
use crate::CoreError;
use itertools::Itertools;

/// A single-method capability so alternate resolvers (fakes in tests, a real
/// node-table lookup in the controller) are trivial to swap in (§9).
pub trait NodeResolver {
	fn resolve(&self, node_id: &str) -> Result<String, CoreError>;
}

pub fn instance_id_entry(rule_id: RuleId, node_id: &str) -> String {
	format!("komari-r{rule_id}-n{node_id}-entry")
}

pub fn instance_id_relay(rule_id: RuleId, node_id: &str, i: usize) -> String {
	format!("komari-r{rule_id}-n{node_id}-relay-{i}")
}

/// `hop_order` is the hop's own `sort_order`, not its position in the
/// traversal — that keeps a hop's instance id stable across a hot update
/// that adds or removes *other* hops, which a positional index would not
/// (§9 hot-update diffing relies on this).
pub fn instance_id_hop_direct(rule_id: RuleId, node_id: &str, hop_order: i64) -> String {
	format!("komari-r{rule_id}-n{node_id}-hop{hop_order}")
}

pub fn instance_id_hop_relay(rule_id: RuleId, node_id: &str, hop_order: i64, j: usize) -> String {
	format!("komari-r{rule_id}-n{node_id}-hop{hop_order}-relay{j}")
}

/// Recovers the node id from any of the four instance id schemes by finding
/// the earliest of `-hop`/`-relay-`/`-entry` after the `-n` marker.
pub fn parse_node_id(instance_id: &str) -> Option<String> {
	let n_idx = instance_id.find("-n")?;
	let rest = &instance_id[n_idx + 2..];
	["-hop", "-relay-", "-entry"]
		.iter()
		.filter_map(|marker| rest.find(marker))
		.min()
		.map(|end| rest[..end].to_string())
}

fn node_addr(resolver: &dyn NodeResolver, node_id: &str, port: u16) -> Result<String, CoreError> {
	if port == 0 {
		return Err(CoreError::InvalidConfig(format!(
			"node {node_id} has no allocated listen port"
		)));
	}
	Ok(format!("{}:{port}", resolver.resolve(node_id)?))
}

fn resolve_target(target: &Target, resolver: &dyn NodeResolver) -> Result<String, CoreError> {
	match target {
		Target::Node { node_id, port } => node_addr(resolver, node_id, *port),
		Target::Literal { host, port } => Ok(format!("{host}:{port}")),
	}
}

fn balance_string(strategy: Strategy, sorted_relays: &[Relay]) -> String {
	match strategy {
		Strategy::Failover => "failover".to_string(),
		Strategy::Iphash => "iphash".to_string(),
		Strategy::Roundrobin => {
			let weights: Vec<i64> = sorted_relays.iter().map(|r| r.sort_order).collect();
			if !weights.iter().any(|&w| w > 0) {
				return "roundrobin".to_string();
			}
			let bumped = weights.iter().map(|&w| if w <= 0 { 1 } else { w }).join(", ");
			format!("roundrobin: {bumped}")
		},
	}
}

/// The first address of a hop, plus what an upstream instance pointing at it
/// must carry: the rest of the addresses and the balance string if this hop
/// is itself a relay group.
fn hop_first_addresses(hop: &Hop, resolver: &dyn NodeResolver) -> Result<(String, Vec<String>, Option<String>), CoreError> {
	match &hop.kind {
		HopKind::Direct { node_id, current_port, .. } => Ok((node_addr(resolver, node_id, *current_port)?, vec![], None)),
		HopKind::RelayGroup { strategy, relays } => {
			let sorted = stable_sort_relays(relays);
			if sorted.is_empty() {
				return Err(CoreError::InvalidConfig("hop relay_group has no relays".into()));
			}
			let addrs: Vec<String> = sorted
				.iter()
				.map(|r| node_addr(resolver, &r.node_id, r.current_port))
				.collect::<Result<_, _>>()?;
			let balance = balance_string(*strategy, &sorted);
			Ok((addrs[0].clone(), addrs[1..].to_vec(), Some(balance)))
		},
	}
}

fn endpoint_config(
	listen_port: u16,
	remote: &str,
	extra_remotes: &[String],
	balance: Option<&str>,
	network: Option<&NetworkConfig>,
	protocol: Protocol,
) -> serde_json::Value {
	let mut obj = serde_json::Map::new();
	obj.insert("listen".into(), serde_json::json!(format!("0.0.0.0:{listen_port}")));
	obj.insert("remote".into(), serde_json::json!(remote));
	if !extra_remotes.is_empty() {
		obj.insert("extraRemotes".into(), serde_json::json!(extra_remotes));
	}
	if let Some(b) = balance {
		obj.insert("balance".into(), serde_json::json!(b));
	}
	let (no_tcp, use_udp) = protocol.forwarder_flags();
	let mut net_obj = match network.map(serde_json::to_value) {
		Some(Ok(serde_json::Value::Object(m))) => m,
		_ => serde_json::Map::new(),
	};
	if no_tcp || use_udp {
		net_obj.insert("noTcp".into(), serde_json::json!(no_tcp));
		net_obj.insert("useUdp".into(), serde_json::json!(use_udp));
	}
	if !net_obj.is_empty() {
		obj.insert("network".into(), serde_json::Value::Object(net_obj));
	}
	serde_json::Value::Object(obj)
}

fn instance(
	instance_id: String,
	node_id: String,
	listen_port: u16,
	remote: String,
	extra_remotes: Vec<String>,
	balance: Option<String>,
	network: Option<&NetworkConfig>,
	protocol: Protocol,
) -> PlannedInstance {
	let endpoint_config = endpoint_config(listen_port, &remote, &extra_remotes, balance.as_deref(), network, protocol);
	PlannedInstance {
		instance_id,
		node_id,
		listen_addr: format!("0.0.0.0:{listen_port}"),
		listen_port,
		remote_addr: remote,
		extra_remotes,
		balance,
		endpoint_config,
	}
}

/// Compiles a rule's config into its ordered set of planned instances.
/// Assumes port allocation already ran — every participating
/// `current_port` is expected to be non-zero; a zero is an `InvalidConfig`
/// failure, per the "listen_port > 0 at apply time" invariant (§3).
pub fn plan(rule_id: RuleId, config: &RuleConfig, resolver: &dyn NodeResolver) -> Result<Vec<PlannedInstance>, CoreError> {
	let mut instances = match config {
		RuleConfig::Direct {
			entry_node_id,
			entry_current_port,
			protocol,
			target,
			network,
			..
		} => {
			let remote = resolve_target(target, resolver)?;
			vec![instance(
				instance_id_entry(rule_id, entry_node_id),
				entry_node_id.clone(),
				*entry_current_port,
				remote,
				vec![],
				None,
				network.as_ref(),
				*protocol,
			)]
		},

		RuleConfig::RelayGroup {
			entry_node_id,
			entry_current_port,
			protocol,
			target,
			strategy,
			relays,
			network,
		} => {
			if relays.is_empty() {
				return Err(CoreError::InvalidConfig("relay_group has no relays".into()));
			}
			let sorted = stable_sort_relays(relays);
			let addrs: Vec<String> = sorted
				.iter()
				.map(|r| node_addr(resolver, &r.node_id, r.current_port))
				.collect::<Result<_, _>>()?;
			let balance = balance_string(*strategy, &sorted);
			let target_addr = resolve_target(target, resolver)?;

			let mut out = vec![instance(
				instance_id_entry(rule_id, entry_node_id),
				entry_node_id.clone(),
				*entry_current_port,
				addrs[0].clone(),
				addrs[1..].to_vec(),
				Some(balance),
				network.as_ref(),
				*protocol,
			)];
			for (i, r) in sorted.iter().enumerate() {
				out.push(instance(
					instance_id_relay(rule_id, &r.node_id, i),
					r.node_id.clone(),
					r.current_port,
					target_addr.clone(),
					vec![],
					None,
					network.as_ref(),
					*protocol,
				));
			}
			out
		},

		RuleConfig::Chain {
			entry_node_id,
			entry_current_port,
			protocol,
			target,
			hops,
			network,
		} => {
			if hops.is_empty() {
				return Err(CoreError::InvalidConfig("chain has no hops".into()));
			}
			let sorted_hops = stable_sort_hops(hops);
			let target_addr = resolve_target(target, resolver)?;

			let (entry_remote, entry_extra, entry_balance) = hop_first_addresses(&sorted_hops[0], resolver)?;
			let mut out = vec![instance(
				instance_id_entry(rule_id, entry_node_id),
				entry_node_id.clone(),
				*entry_current_port,
				entry_remote,
				entry_extra,
				entry_balance,
				network.as_ref(),
				*protocol,
			)];

			for (h, hop) in sorted_hops.iter().enumerate() {
				let (next_remote, next_extra, next_balance) = if h + 1 < sorted_hops.len() {
					hop_first_addresses(&sorted_hops[h + 1], resolver)?
				} else {
					(target_addr.clone(), vec![], None)
				};
				let merged_network = NetworkConfig::merge(network.as_ref(), hop.network.as_ref());

				match &hop.kind {
					HopKind::Direct { node_id, current_port, .. } => {
						out.push(instance(
							instance_id_hop_direct(rule_id, node_id, hop.sort_order),
							node_id.clone(),
							*current_port,
							next_remote.clone(),
							next_extra.clone(),
							next_balance.clone(),
							merged_network.as_ref(),
							*protocol,
						));
					},
					HopKind::RelayGroup { relays, .. } => {
						if relays.is_empty() {
							return Err(CoreError::InvalidConfig(format!("hop {h} relay_group has no relays")));
						}
						let sorted_relays = stable_sort_relays(relays);
						for (j, r) in sorted_relays.iter().enumerate() {
							out.push(instance(
								instance_id_hop_relay(rule_id, &r.node_id, hop.sort_order, j),
								r.node_id.clone(),
								r.current_port,
								next_remote.clone(),
								next_extra.clone(),
								next_balance.clone(),
								merged_network.as_ref(),
								*protocol,
							));
						}
					},
				}
			}
			out
		},
	};

	instances.sort_by(|a, b| a.node_id.cmp(&b.node_id).then_with(|| a.instance_id.cmp(&b.instance_id)));
	Ok(instances)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Hop, HopKind, Relay};
	use std::collections::HashMap;

	struct FakeResolver(HashMap<&'static str, &'static str>);

	impl NodeResolver for FakeResolver {
		fn resolve(&self, node_id: &str) -> Result<String, CoreError> {
			self.0
				.get(node_id)
				.map(|s| s.to_string())
				.ok_or_else(|| CoreError::InvalidConfig(format!("unknown node {node_id}")))
		}
	}

	fn resolver() -> FakeResolver {
		FakeResolver(HashMap::from([
			("A", "10.0.0.1"),
			("B", "10.0.0.2"),
			("C", "10.0.0.3"),
			("T", "10.0.0.9"),
		]))
	}

	#[test]
	fn instance_id_round_trips_node_for_all_four_schemes() {
		assert_eq!(parse_node_id(&instance_id_entry(7, "A")).as_deref(), Some("A"));
		assert_eq!(parse_node_id(&instance_id_relay(9, "B", 0)).as_deref(), Some("B"));
		assert_eq!(parse_node_id(&instance_id_hop_direct(3, "H1", 2)).as_deref(), Some("H1"));
		assert_eq!(parse_node_id(&instance_id_hop_relay(3, "H2", 1, 0)).as_deref(), Some("H2"));
	}

	// Scenario 1 (§8): direct start.
	#[test]
	fn direct_start_scenario() {
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
		let planned = plan(7, &cfg, &resolver()).unwrap();
		assert_eq!(planned.len(), 1);
		assert_eq!(planned[0].instance_id, "komari-r7-nA-entry");
		assert_eq!(planned[0].listen_addr, "0.0.0.0:8080");
		assert_eq!(planned[0].remote_addr, "1.2.3.4:443");
	}

	// Scenario 2 (§8): relay group failover.
	#[test]
	fn relay_group_failover_scenario() {
		let cfg = RuleConfig::RelayGroup {
			entry_node_id: "A".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Node { node_id: "T".into(), port: 22 },
			strategy: Strategy::Failover,
			relays: vec![
				Relay {
					node_id: "B".into(),
					port_spec: "7000".into(),
					current_port: 7000,
					sort_order: 0,
				},
				Relay {
					node_id: "C".into(),
					port_spec: "7000".into(),
					current_port: 7000,
					sort_order: 1,
				},
			],
			network: None,
		};
		let planned = plan(9, &cfg, &resolver()).unwrap();
		assert_eq!(planned.len(), 3);
		let entry = planned.iter().find(|p| p.node_id == "A").unwrap();
		assert_eq!(entry.remote_addr, "10.0.0.2:7000");
		assert_eq!(entry.extra_remotes, vec!["10.0.0.3:7000".to_string()]);
		assert_eq!(entry.balance.as_deref(), Some("failover"));
		let relay_b = planned.iter().find(|p| p.node_id == "B").unwrap();
		assert_eq!(relay_b.remote_addr, "10.0.0.9:22");
		assert!(relay_b.balance.is_none());
	}

	#[test]
	fn roundrobin_balance_bumps_zero_weights_and_falls_back_to_bare() {
		let relays = vec![
			Relay {
				node_id: "B".into(),
				port_spec: "7000".into(),
				current_port: 7000,
				sort_order: 0,
			},
			Relay {
				node_id: "C".into(),
				port_spec: "7000".into(),
				current_port: 7000,
				sort_order: 2,
			},
		];
		let sorted = stable_sort_relays(&relays);
		assert_eq!(balance_string(Strategy::Roundrobin, &sorted), "roundrobin: 1, 2");

		let all_zero = vec![Relay {
			node_id: "B".into(),
			port_spec: "7000".into(),
			current_port: 7000,
			sort_order: 0,
		}];
		assert_eq!(balance_string(Strategy::Roundrobin, &all_zero), "roundrobin");
	}

	#[test]
	fn plan_is_deterministic() {
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
		let first = plan(7, &cfg, &resolver()).unwrap();
		let second = plan(7, &cfg, &resolver()).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn zero_listen_port_fails_planning() {
		let cfg = RuleConfig::Direct {
			entry_node_id: "A".into(),
			entry_port_spec: "8080".into(),
			entry_current_port: 0,
			protocol: Protocol::Tcp,
			target: Target::Literal {
				host: "1.2.3.4".into(),
				port: 443,
			},
			network: None,
		};
		assert!(plan(7, &cfg, &resolver()).is_err());
	}

	#[test]
	fn chain_points_each_hop_at_the_next() {
		let cfg = RuleConfig::Chain {
			entry_node_id: "A".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Node { node_id: "T".into(), port: 22 },
			hops: vec![
				Hop {
					sort_order: 0,
					kind: HopKind::Direct {
						node_id: "B".into(),
						port_spec: "5000".into(),
						current_port: 5000,
					},
					network: None,
				},
				Hop {
					sort_order: 1,
					kind: HopKind::Direct {
						node_id: "C".into(),
						port_spec: "6000".into(),
						current_port: 6000,
					},
					network: None,
				},
			],
			network: None,
		};
		let planned = plan(5, &cfg, &resolver()).unwrap();
		let entry = planned.iter().find(|p| p.node_id == "A").unwrap();
		assert_eq!(entry.remote_addr, "10.0.0.2:5000");
		let hop0 = planned.iter().find(|p| p.instance_id.contains("hop0")).unwrap();
		assert_eq!(hop0.remote_addr, "10.0.0.3:6000");
		let hop1 = planned.iter().find(|p| p.instance_id.contains("hop1")).unwrap();
		assert_eq!(hop1.remote_addr, "10.0.0.9:22");
	}

	// A hop's instance id is keyed by its own `sort_order`, not its position
	// after sorting, so removing/adding a neighboring hop can't shift it —
	// which is what lets the hot-update diff recognize H2 as unchanged.
	#[test]
	fn hop_instance_id_survives_a_neighboring_hop_being_removed() {
		let old_cfg = RuleConfig::Chain {
			entry_node_id: "A".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Node { node_id: "T".into(), port: 22 },
			hops: vec![
				Hop {
					sort_order: 0,
					kind: HopKind::Direct {
						node_id: "H1".into(),
						port_spec: "5000".into(),
						current_port: 5000,
					},
					network: None,
				},
				Hop {
					sort_order: 1,
					kind: HopKind::Direct {
						node_id: "H2".into(),
						port_spec: "6000".into(),
						current_port: 6000,
					},
					network: None,
				},
			],
			network: None,
		};
		let new_cfg = RuleConfig::Chain {
			entry_node_id: "A".into(),
			entry_port_spec: "9000".into(),
			entry_current_port: 9000,
			protocol: Protocol::Tcp,
			target: Target::Node { node_id: "T".into(), port: 22 },
			hops: vec![
				Hop {
					sort_order: 1,
					kind: HopKind::Direct {
						node_id: "H2".into(),
						port_spec: "6000".into(),
						current_port: 6000,
					},
					network: None,
				},
				Hop {
					sort_order: 2,
					kind: HopKind::Direct {
						node_id: "H3".into(),
						port_spec: "7000".into(),
						current_port: 7000,
					},
					network: None,
				},
			],
			network: None,
		};

		let old_planned = plan(5, &old_cfg, &resolver()).unwrap();
		let new_planned = plan(5, &new_cfg, &resolver()).unwrap();
		let old_h2 = old_planned.iter().find(|p| p.node_id == "H2").unwrap();
		let new_h2 = new_planned.iter().find(|p| p.node_id == "H2").unwrap();
		assert_eq!(old_h2.instance_id, new_h2.instance_id);
		assert_eq!(old_h2.listen_port, new_h2.listen_port);
	}
}
