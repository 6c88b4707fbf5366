//! Logical data model (§3). Persistence itself is an external collaborator
//! (relational/KV store) — these are the row shapes that store describes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type RuleId = u32;
pub type NodeId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Tcp,
	Udp,
	Both,
}

impl Default for Protocol {
	fn default() -> Self {
		Protocol::Tcp
	}
}

impl Protocol {
	/// Derives the forwarder's `(no_tcp, use_udp)` knobs.
	pub fn forwarder_flags(self) -> (bool, bool) {
		match self {
			Protocol::Tcp => (false, false),
			Protocol::Udp => (true, true),
			Protocol::Both => (false, true),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
	Stopped,
	Running,
	Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
	Roundrobin,
	Iphash,
	Failover,
}

impl Strategy {
	/// `priority` is rejected on validation (migrate to `failover`); `random`
	/// was never supported. Everything else is unknown.
	pub fn parse(raw: &str) -> Result<Strategy, crate::CoreError> {
		match raw {
			"roundrobin" => Ok(Strategy::Roundrobin),
			"iphash" => Ok(Strategy::Iphash),
			"failover" => Ok(Strategy::Failover),
			"priority" => Err(crate::CoreError::InvalidConfig(
				"strategy \"priority\" was removed; migrate to \"failover\"".into(),
			)),
			other => Err(crate::CoreError::InvalidConfig(format!(
				"unknown relay strategy {other:?}"
			))),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
	Node { node_id: NodeId, port: u16 },
	Literal { host: String, port: u16 },
}

/// One non-negative millisecond knob the forwarder understands, plus the
/// legacy-switcher opt-in (§9 Open Question #1). Every field round-trips an
/// explicit `0` — callers must not mistake absence for zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failover_probe_interval_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failover_timeout_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failover_retry_window_ms: Option<u64>,
	#[serde(default)]
	pub legacy_switcher: bool,
}

impl NetworkConfig {
	/// Field-wise merge: `overlay` wins wherever it is `Some`/non-default.
	pub fn merge(base: Option<&NetworkConfig>, overlay: Option<&NetworkConfig>) -> Option<NetworkConfig> {
		match (base, overlay) {
			(None, None) => None,
			(Some(b), None) => Some(b.clone()),
			(None, Some(o)) => Some(o.clone()),
			(Some(b), Some(o)) => Some(NetworkConfig {
				failover_probe_interval_ms: o.failover_probe_interval_ms.or(b.failover_probe_interval_ms),
				failover_timeout_ms: o.failover_timeout_ms.or(b.failover_timeout_ms),
				failover_retry_window_ms: o.failover_retry_window_ms.or(b.failover_retry_window_ms),
				legacy_switcher: o.legacy_switcher || b.legacy_switcher,
			}),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
	pub node_id: NodeId,
	pub port_spec: String,
	#[serde(default)]
	pub current_port: u16,
	pub sort_order: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HopKind {
	Direct {
		node_id: NodeId,
		port_spec: String,
		#[serde(default)]
		current_port: u16,
	},
	RelayGroup {
		strategy: Strategy,
		relays: Vec<Relay>,
	},
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hop {
	pub sort_order: i64,
	#[serde(flatten)]
	pub kind: HopKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub network: Option<NetworkConfig>,
}

/// A rule's type-specific configuration. Modeled as a tagged variant per the
/// "polymorphism over rule shape" design note (§9) rather than a flat struct
/// with unused fields per type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConfig {
	Direct {
		entry_node_id: NodeId,
		entry_port_spec: String,
		#[serde(default)]
		entry_current_port: u16,
		#[serde(default)]
		protocol: Protocol,
		target: Target,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		network: Option<NetworkConfig>,
	},
	RelayGroup {
		entry_node_id: NodeId,
		entry_port_spec: String,
		#[serde(default)]
		entry_current_port: u16,
		#[serde(default)]
		protocol: Protocol,
		target: Target,
		strategy: Strategy,
		relays: Vec<Relay>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		network: Option<NetworkConfig>,
	},
	Chain {
		entry_node_id: NodeId,
		entry_port_spec: String,
		#[serde(default)]
		entry_current_port: u16,
		#[serde(default)]
		protocol: Protocol,
		target: Target,
		hops: Vec<Hop>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		network: Option<NetworkConfig>,
	},
}

impl RuleConfig {
	pub fn entry_node_id(&self) -> &NodeId {
		match self {
			RuleConfig::Direct { entry_node_id, .. }
			| RuleConfig::RelayGroup { entry_node_id, .. }
			| RuleConfig::Chain { entry_node_id, .. } => entry_node_id,
		}
	}

	pub fn entry_port_spec(&self) -> &str {
		match self {
			RuleConfig::Direct { entry_port_spec, .. }
			| RuleConfig::RelayGroup { entry_port_spec, .. }
			| RuleConfig::Chain { entry_port_spec, .. } => entry_port_spec,
		}
	}

	pub fn entry_current_port(&self) -> u16 {
		match self {
			RuleConfig::Direct { entry_current_port, .. }
			| RuleConfig::RelayGroup { entry_current_port, .. }
			| RuleConfig::Chain { entry_current_port, .. } => *entry_current_port,
		}
	}

	pub fn network(&self) -> Option<&NetworkConfig> {
		match self {
			RuleConfig::Direct { network, .. }
			| RuleConfig::RelayGroup { network, .. }
			| RuleConfig::Chain { network, .. } => network.as_ref(),
		}
	}

	/// Every `(node_id, port_spec, &mut current_port)` slot the port
	/// allocator may need to backfill, in a stable but otherwise
	/// unspecified order. Mutations are visible through the borrow, so
	/// callers persist the owning config after allocation.
	pub fn port_bindings(&mut self) -> Vec<PortBinding<'_>> {
		let mut out = Vec::new();
		match self {
			RuleConfig::Direct {
				entry_node_id,
				entry_port_spec,
				entry_current_port,
				..
			} => {
				out.push(PortBinding {
					node_id: entry_node_id.clone(),
					spec: entry_port_spec.clone(),
					current: entry_current_port,
				});
			},
			RuleConfig::RelayGroup {
				entry_node_id,
				entry_port_spec,
				entry_current_port,
				relays,
				..
			} => {
				out.push(PortBinding {
					node_id: entry_node_id.clone(),
					spec: entry_port_spec.clone(),
					current: entry_current_port,
				});
				for r in relays.iter_mut() {
					out.push(PortBinding {
						node_id: r.node_id.clone(),
						spec: r.port_spec.clone(),
						current: &mut r.current_port,
					});
				}
			},
			RuleConfig::Chain {
				entry_node_id,
				entry_port_spec,
				entry_current_port,
				hops,
				..
			} => {
				out.push(PortBinding {
					node_id: entry_node_id.clone(),
					spec: entry_port_spec.clone(),
					current: entry_current_port,
				});
				for hop in hops.iter_mut() {
					match &mut hop.kind {
						HopKind::Direct {
							node_id,
							port_spec,
							current_port,
						} => out.push(PortBinding {
							node_id: node_id.clone(),
							spec: port_spec.clone(),
							current: current_port,
						}),
						HopKind::RelayGroup { relays, .. } => {
							for r in relays.iter_mut() {
								out.push(PortBinding {
									node_id: r.node_id.clone(),
									spec: r.port_spec.clone(),
									current: &mut r.current_port,
								});
							}
						},
					}
				}
			},
		}
		out
	}
}

/// A mutable view into one `current_port` slot inside a [`RuleConfig`],
/// standing in for the "pointer into config" of the original design (§9).
pub struct PortBinding<'a> {
	pub node_id: NodeId,
	pub spec: String,
	pub current: &'a mut u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTotals {
	pub conns: u64,
	pub in_bytes: u64,
	pub out_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
	pub id: RuleId,
	pub enabled: bool,
	pub status: RuleStatus,
	pub config: RuleConfig,
	#[serde(default)]
	pub totals: RuleTotals,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedInstance {
	pub instance_id: String,
	pub node_id: NodeId,
	pub listen_addr: String,
	pub listen_port: u16,
	pub remote_addr: String,
	#[serde(default)]
	pub extra_remotes: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub balance: Option<String>,
	pub endpoint_config: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
	Healthy,
	Degraded,
	Faulty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardStat {
	pub rule_id: RuleId,
	pub node_id: NodeId,
	pub link_status: LinkStatus,
	pub active_conns: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub bps_in: u64,
	pub bps_out: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub active_relay_node_id: Option<NodeId>,
	#[serde(default)]
	pub nodes_latency: HashMap<NodeId, u64>,
	pub last_updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardInstanceStat {
	pub rule_id: RuleId,
	pub node_id: NodeId,
	pub instance_id: String,
	pub listen: String,
	pub listen_port: u16,
	pub stats_json: serde_json::Value,
	#[serde(default)]
	pub route_json: Option<serde_json::Value>,
	pub last_updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardTrafficHistory {
	pub rule_id: RuleId,
	pub node_id: NodeId,
	pub timestamp_bucket: chrono::DateTime<chrono::Utc>,
	pub connections: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub avg_latency_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
	Warning,
	Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
	NodeDown,
	LinkDegraded,
	LinkFaulty,
	HighLatency,
	TrafficSpike,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertConfig {
	pub rule_id: RuleId,
	pub node_down: bool,
	pub link_degraded: bool,
	pub link_faulty: bool,
	pub high_latency: bool,
	pub high_latency_threshold_ms: u64,
	pub traffic_spike: bool,
	#[serde(default = "default_traffic_spike_factor")]
	pub traffic_spike_factor: f64,
}

fn default_traffic_spike_factor() -> f64 {
	2.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertHistoryRow {
	pub rule_id: RuleId,
	pub alert_type: AlertType,
	pub severity: AlertSeverity,
	pub message: String,
	#[serde(default)]
	pub details_json: serde_json::Value,
	pub created_at: chrono::DateTime<chrono::Utc>,
	#[serde(default)]
	pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn network_config_zero_round_trips() {
		let cfg = NetworkConfig {
			failover_retry_window_ms: Some(0),
			..Default::default()
		};
		let json = serde_json::to_string(&cfg).unwrap();
		assert!(json.contains("\"failoverRetryWindowMs\":0"));
		let back: NetworkConfig = serde_json::from_str(&json).unwrap();
		assert_eq!(back.failover_retry_window_ms, Some(0));
	}

	#[test]
	fn network_config_absent_stays_absent() {
		let cfg = NetworkConfig::default();
		let json = serde_json::to_string(&cfg).unwrap();
		assert!(!json.contains("failoverRetryWindowMs"));
	}

	#[test]
	fn strategy_rejects_priority_and_random() {
		assert!(Strategy::parse("priority").is_err());
		assert!(Strategy::parse("random").is_err());
		assert!(Strategy::parse("roundrobin").is_ok());
		assert!(Strategy::parse("iphash").is_ok());
		assert!(Strategy::parse("failover").is_ok());
	}

	#[test]
	fn protocol_flags_match_spec() {
		assert_eq!(Protocol::Tcp.forwarder_flags(), (false, false));
		assert_eq!(Protocol::Udp.forwarder_flags(), (true, true));
		assert_eq!(Protocol::Both.forwarder_flags(), (false, true));
	}
}
