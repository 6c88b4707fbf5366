//! The Stats Aggregator (§4.10): turns incoming `forward_instance_stats` and
//! legacy `forward_stats` bus pushes into updated Forward Stat rows, history
//! appends, and alert evaluations. Broadcasting to subscribed UI clients is
//! an external collaborator (§1 "admin REST/HTTP surface beyond what the
//! core consumes") — modeled here as a narrow `StatsBroadcaster` trait so
//! the aggregation logic itself stays unit-testable without a WS layer.

use crate::alerts;
use crate::history::{self, HistoryPeriod};
use crate::repository::{AlertRepository, HistoryRepository, StatsRepository};
use chrono::{DateTime, Duration, Utc};
use komari_forward_core::model::{AlertConfig, ForwardInstanceStat, ForwardStat, LinkStatus, NodeId, RuleId};
use serde::{Deserialize, Serialize};

/// Bus message from the agent's Instance Stats Reporter (§4.9/§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardInstanceStatsMessage {
	pub rule_id: RuleId,
	pub node_id: NodeId,
	pub instance_id: String,
	pub listen: String,
	pub listen_port: u16,
	pub stats: serde_json::Value,
	#[serde(default)]
	pub route: Option<serde_json::Value>,
	pub last_updated_at: DateTime<Utc>,
}

/// Bus message for the legacy per-node push (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardStatsMessage {
	pub rule_id: RuleId,
	pub node_id: NodeId,
	pub link_status: LinkStatus,
	pub active_connections: u64,
	pub traffic_in_bytes: u64,
	pub traffic_out_bytes: u64,
	pub realtime_bps_in: u64,
	pub realtime_bps_out: u64,
	#[serde(default)]
	pub active_relay_node_id: Option<NodeId>,
	#[serde(default)]
	pub nodes_latency: std::collections::HashMap<NodeId, u64>,
	pub last_updated_at: DateTime<Utc>,
	#[serde(default)]
	pub port: u16,
}

pub trait StatsBroadcaster: Send + Sync {
	fn broadcast_forward_stats_update(&self, rule_id: RuleId, stat: &ForwardStat);
}

pub struct NoopBroadcaster;
impl StatsBroadcaster for NoopBroadcaster {
	fn broadcast_forward_stats_update(&self, _rule_id: RuleId, _stat: &ForwardStat) {}
}

/// Node role lookup the aggregator needs to tell an entry node's stats from
/// a relay/hop node's, for both the legacy rollup and the alert evaluator.
pub trait RuleNodeRoles: Send + Sync {
	fn entry_node_id(&self, rule_id: RuleId) -> Option<NodeId>;
	/// Every non-entry node id this rule currently targets (relays/hops).
	fn non_entry_node_ids(&self, rule_id: RuleId) -> Vec<NodeId>;
	fn add_rule_totals(&self, rule_id: RuleId, in_bytes: u64, out_bytes: u64, conns: u64);
}

pub struct StatsAggregator<S: StatsRepository, H: HistoryRepository, A: AlertRepository, B: StatsBroadcaster, N: RuleNodeRoles> {
	pub stats: std::sync::Arc<S>,
	pub history: std::sync::Arc<H>,
	pub alerts: std::sync::Arc<A>,
	pub broadcaster: std::sync::Arc<B>,
	pub roles: std::sync::Arc<N>,
	pub history_period: HistoryPeriod,
	pub stat_freshness: Duration,
}

impl<S: StatsRepository, H: HistoryRepository, A: AlertRepository, B: StatsBroadcaster, N: RuleNodeRoles> StatsAggregator<S, H, A, B, N> {
	/// §4.10 step 1-3 for `forward_instance_stats`: upsert the instance row,
	/// re-aggregate the node-level row from every instance row for this
	/// `(rule_id, node_id)`, then run the same update/broadcast path as the
	/// legacy push.
	pub fn handle_instance_stats(&self, msg: ForwardInstanceStatsMessage, now: DateTime<Utc>) {
		self.stats.upsert_instance_stat(ForwardInstanceStat {
			rule_id: msg.rule_id,
			node_id: msg.node_id.clone(),
			instance_id: msg.instance_id.clone(),
			listen: msg.listen.clone(),
			listen_port: msg.listen_port,
			stats_json: msg.stats.clone(),
			route_json: msg.route.clone(),
			last_updated_at: msg.last_updated_at,
		});

		let instances = self.stats.instance_stats(msg.rule_id, &msg.node_id);
		let freshness_cutoff = now - self.stat_freshness;
		let link_status = if instances.iter().any(|i| i.last_updated_at >= freshness_cutoff) {
			LinkStatus::Healthy
		} else {
			LinkStatus::Faulty
		};

		let mut active_conns = 0u64;
		let mut bytes_in = 0u64;
		let mut bytes_out = 0u64;
		for instance in &instances {
			active_conns += extract_u64(&instance.stats_json, &["current_connections", "connections", "activeConnections"]);
			bytes_in += extract_u64(&instance.stats_json, &["bytes_in", "bytesIn", "in_bytes"]);
			bytes_out += extract_u64(&instance.stats_json, &["bytes_out", "bytesOut", "out_bytes"]);
		}

		let existing = self.stats.node_stat(msg.rule_id, &msg.node_id);
		let stat = ForwardStat {
			rule_id: msg.rule_id,
			node_id: msg.node_id.clone(),
			link_status,
			active_conns,
			bytes_in,
			bytes_out,
			bps_in: existing.as_ref().map(|s| s.bps_in).unwrap_or(0),
			bps_out: existing.as_ref().map(|s| s.bps_out).unwrap_or(0),
			active_relay_node_id: existing.as_ref().and_then(|s| s.active_relay_node_id.clone()),
			nodes_latency: existing.map(|s| s.nodes_latency).unwrap_or_default(),
			last_updated_at: now,
		};

		self.update_stats_and_broadcast(stat, now);
	}

	/// §4.10 step 1: legacy per-node push, rolling into rule-wide overall
	/// status, rule totals (entry only, to avoid double counting multi-hop
	/// traffic), history, and alerts.
	pub fn handle_legacy_stats(&self, msg: ForwardStatsMessage, now: DateTime<Utc>) {
		let stat = ForwardStat {
			rule_id: msg.rule_id,
			node_id: msg.node_id.clone(),
			link_status: msg.link_status,
			active_conns: msg.active_connections,
			bytes_in: msg.traffic_in_bytes,
			bytes_out: msg.traffic_out_bytes,
			bps_in: msg.realtime_bps_in,
			bps_out: msg.realtime_bps_out,
			active_relay_node_id: msg.active_relay_node_id.clone(),
			nodes_latency: msg.nodes_latency.clone(),
			last_updated_at: msg.last_updated_at,
		};

		let is_entry = self.roles.entry_node_id(msg.rule_id).as_deref() == Some(msg.node_id.as_str());
		if is_entry {
			self.roles.add_rule_totals(msg.rule_id, msg.traffic_in_bytes, msg.traffic_out_bytes, msg.active_connections);

			let prev = self.history.rows_for_node(msg.rule_id, &msg.node_id).last().cloned();
			let (prev_in, prev_out) = prev.as_ref().map(|r| (r.bytes_in, r.bytes_out)).unwrap_or((0, 0));
			history::record_tick(
				self.history.as_ref(),
				self.history_period,
				msg.rule_id,
				&msg.node_id,
				now,
				msg.traffic_in_bytes,
				msg.traffic_out_bytes,
				prev_in,
				prev_out,
				msg.active_connections,
				avg_latency(&msg.nodes_latency),
			);
		}

		self.update_stats_and_broadcast(stat, now);
	}

	/// `UpdateStatsAndBroadcast` (§4.10): upserts the node stat row,
	/// recomputes the rule-wide overall status, evaluates alerts for this
	/// node, and broadcasts to subscribers.
	fn update_stats_and_broadcast(&self, stat: ForwardStat, now: DateTime<Utc>) {
		self.stats.upsert_node_stat(stat.clone());

		let entry_node_id = self.roles.entry_node_id(stat.rule_id);
		let is_entry = entry_node_id.as_deref() == Some(stat.node_id.as_str());

		if let Some(config) = self.alerts.config(stat.rule_id) {
			let history_rows = self.history.rows_for_node(stat.rule_id, &stat.node_id);
			alerts::evaluate(self.alerts.as_ref(), &config, &stat, is_entry, &history_rows, now);
		}

		self.broadcaster.broadcast_forward_stats_update(stat.rule_id, &stat);
	}

	/// Rule-wide overall status (§4.10 step 1 of the legacy path): starts
	/// from the entry's own status, then any non-entry `faulty`/`degraded`
	/// downgrades a `healthy` overall to `degraded`; an entry `faulty`
	/// forces the overall status to `faulty` regardless of anything else.
	pub fn rule_overall_status(&self, rule_id: RuleId) -> Option<LinkStatus> {
		let entry_node_id = self.roles.entry_node_id(rule_id)?;
		let entry = self.stats.node_stat(rule_id, &entry_node_id)?;
		if entry.link_status == LinkStatus::Faulty {
			return Some(LinkStatus::Faulty);
		}
		let mut overall = entry.link_status;
		for node_id in self.roles.non_entry_node_ids(rule_id) {
			if let Some(other) = self.stats.node_stat(rule_id, &node_id) {
				if matches!(other.link_status, LinkStatus::Faulty | LinkStatus::Degraded) && overall == LinkStatus::Healthy {
					overall = LinkStatus::Degraded;
				}
			}
		}
		Some(overall)
	}
}

fn extract_u64(value: &serde_json::Value, keys: &[&str]) -> u64 {
	for key in keys {
		if let Some(found) = value.get(key).and_then(|v| v.as_u64()) {
			return found;
		}
	}
	0
}

fn avg_latency(nodes_latency: &std::collections::HashMap<NodeId, u64>) -> f64 {
	if nodes_latency.is_empty() {
		return 0.0;
	}
	let total: u64 = nodes_latency.values().sum();
	total as f64 / nodes_latency.len() as f64
}

#[allow(dead_code)]
pub fn default_alert_config(rule_id: RuleId) -> AlertConfig {
	AlertConfig {
		rule_id,
		node_down: true,
		link_degraded: true,
		link_faulty: true,
		high_latency: false,
		high_latency_threshold_ms: 300,
		traffic_spike: false,
		traffic_spike_factor: 2.0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::{InMemoryAlertRepository, InMemoryHistoryRepository, InMemoryStatsRepository};
	use parking_lot::Mutex;
	use std::collections::BTreeMap;
	use std::sync::Arc;

	#[derive(Default)]
	struct FakeRoles {
		entry: Mutex<BTreeMap<RuleId, NodeId>>,
		totals: Mutex<BTreeMap<RuleId, (u64, u64, u64)>>,
	}

	impl RuleNodeRoles for FakeRoles {
		fn entry_node_id(&self, rule_id: RuleId) -> Option<NodeId> {
			self.entry.lock().get(&rule_id).cloned()
		}
		fn non_entry_node_ids(&self, _rule_id: RuleId) -> Vec<NodeId> {
			vec!["B".into()]
		}
		fn add_rule_totals(&self, rule_id: RuleId, in_bytes: u64, out_bytes: u64, conns: u64) {
			let mut totals = self.totals.lock();
			let entry = totals.entry(rule_id).or_default();
			entry.0 += in_bytes;
			entry.1 += out_bytes;
			entry.2 += conns;
		}
	}

	fn aggregator() -> StatsAggregator<InMemoryStatsRepository, InMemoryHistoryRepository, InMemoryAlertRepository, NoopBroadcaster, FakeRoles> {
		let roles = FakeRoles::default();
		roles.entry.lock().insert(1, "A".into());
		StatsAggregator {
			stats: Arc::new(InMemoryStatsRepository::default()),
			history: Arc::new(InMemoryHistoryRepository::default()),
			alerts: Arc::new(InMemoryAlertRepository::default()),
			broadcaster: Arc::new(NoopBroadcaster),
			roles: Arc::new(roles),
			history_period: HistoryPeriod::OneHour,
			stat_freshness: Duration::seconds(60),
		}
	}

	#[test]
	fn instance_stats_aggregate_into_node_level_row() {
		let agg = aggregator();
		let now = Utc::now();
		agg.handle_instance_stats(
			ForwardInstanceStatsMessage {
				rule_id: 1,
				node_id: "A".into(),
				instance_id: "komari-r1-nA-entry".into(),
				listen: "0.0.0.0:8080".into(),
				listen_port: 8080,
				stats: serde_json::json!({"current_connections": 3, "bytes_in": 100, "bytes_out": 50}),
				route: None,
				last_updated_at: now,
			},
			now,
		);
		let node_stat = agg.stats.node_stat(1, "A").unwrap();
		assert_eq!(node_stat.active_conns, 3);
		assert_eq!(node_stat.bytes_in, 100);
		assert_eq!(node_stat.link_status, LinkStatus::Healthy);
	}

	#[test]
	fn stale_instance_marks_node_faulty() {
		let agg = aggregator();
		let now = Utc::now();
		agg.handle_instance_stats(
			ForwardInstanceStatsMessage {
				rule_id: 1,
				node_id: "A".into(),
				instance_id: "komari-r1-nA-entry".into(),
				listen: "0.0.0.0:8080".into(),
				listen_port: 8080,
				stats: serde_json::json!({}),
				route: None,
				last_updated_at: now - Duration::seconds(120),
			},
			now,
		);
		let node_stat = agg.stats.node_stat(1, "A").unwrap();
		assert_eq!(node_stat.link_status, LinkStatus::Faulty);
	}

	#[test]
	fn legacy_push_updates_totals_only_from_entry() {
		let agg = aggregator();
		let now = Utc::now();
		agg.handle_legacy_stats(
			ForwardStatsMessage {
				rule_id: 1,
				node_id: "A".into(),
				link_status: LinkStatus::Healthy,
				active_connections: 5,
				traffic_in_bytes: 1000,
				traffic_out_bytes: 500,
				realtime_bps_in: 10,
				realtime_bps_out: 5,
				active_relay_node_id: None,
				nodes_latency: Default::default(),
				last_updated_at: now,
				port: 8080,
			},
			now,
		);
		agg.handle_legacy_stats(
			ForwardStatsMessage {
				rule_id: 1,
				node_id: "B".into(),
				link_status: LinkStatus::Healthy,
				active_connections: 99,
				traffic_in_bytes: 99999,
				traffic_out_bytes: 99999,
				realtime_bps_in: 1,
				realtime_bps_out: 1,
				active_relay_node_id: None,
				nodes_latency: Default::default(),
				last_updated_at: now,
				port: 7000,
			},
			now,
		);
		assert_eq!(*agg.roles.totals.lock().get(&1).unwrap(), (1000, 500, 5));
	}

	#[test]
	fn overall_status_downgrades_on_non_entry_fault() {
		let agg = aggregator();
		let now = Utc::now();
		agg.stats.upsert_node_stat(ForwardStat {
			rule_id: 1,
			node_id: "A".into(),
			link_status: LinkStatus::Healthy,
			active_conns: 0,
			bytes_in: 0,
			bytes_out: 0,
			bps_in: 0,
			bps_out: 0,
			active_relay_node_id: None,
			nodes_latency: Default::default(),
			last_updated_at: now,
		});
		agg.stats.upsert_node_stat(ForwardStat {
			rule_id: 1,
			node_id: "B".into(),
			link_status: LinkStatus::Faulty,
			active_conns: 0,
			bytes_in: 0,
			bytes_out: 0,
			bps_in: 0,
			bps_out: 0,
			active_relay_node_id: None,
			nodes_latency: Default::default(),
			last_updated_at: now,
		});
		assert_eq!(agg.rule_overall_status(1), Some(LinkStatus::Degraded));
	}

	#[test]
	fn overall_status_is_faulty_when_entry_is_faulty() {
		let agg = aggregator();
		let now = Utc::now();
		agg.stats.upsert_node_stat(ForwardStat {
			rule_id: 1,
			node_id: "A".into(),
			link_status: LinkStatus::Faulty,
			active_conns: 0,
			bytes_in: 0,
			bytes_out: 0,
			bps_in: 0,
			bps_out: 0,
			active_relay_node_id: None,
			nodes_latency: Default::default(),
			last_updated_at: now,
		});
		assert_eq!(agg.rule_overall_status(1), Some(LinkStatus::Faulty));
	}
}
