//! Repository seams (§3/SPEC_FULL §3). Relational persistence is an
//! external collaborator; these traits are narrow enough that a SQL-backed
//! implementation can replace the in-memory one without touching any
//! workflow code, mirroring the teacher's `XdsStore`-vs-control-plane-client
//! split.

use chrono::{DateTime, Utc};
use komari_forward_core::model::{AlertConfig, AlertHistoryRow, AlertType, ForwardInstanceStat, ForwardStat, ForwardTrafficHistory, NodeId, Rule, RuleId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub trait RuleRepository: Send + Sync {
	fn get(&self, rule_id: RuleId) -> Option<Rule>;
	fn list(&self) -> Vec<Rule>;
	fn upsert(&self, rule: Rule);
}

pub trait StatsRepository: Send + Sync {
	fn upsert_instance_stat(&self, stat: ForwardInstanceStat);
	fn instance_stats(&self, rule_id: RuleId, node_id: &str) -> Vec<ForwardInstanceStat>;
	fn upsert_node_stat(&self, stat: ForwardStat);
	fn node_stat(&self, rule_id: RuleId, node_id: &str) -> Option<ForwardStat>;
	/// All node-level stats for a rule, for rule-wide overall-status rollup.
	fn node_stats(&self, rule_id: RuleId) -> Vec<ForwardStat>;
}

pub trait HistoryRepository: Send + Sync {
	/// Upserts `(rule_id, node_id, bucket)`: bytes are added to whatever is
	/// already there, connections/latency are replaced (§4.11).
	fn accumulate(&self, rule_id: RuleId, node_id: &str, bucket: DateTime<Utc>, delta_bytes_in: u64, delta_bytes_out: u64, connections: u64, avg_latency_ms: f64);
	/// All rows for `(rule_id, node_id)`, ascending by bucket timestamp.
	fn rows_for_node(&self, rule_id: RuleId, node_id: &str) -> Vec<ForwardTrafficHistory>;
	/// Every row strictly older than `cutoff` (used by daily maintenance).
	fn rows_older_than(&self, cutoff: DateTime<Utc>) -> Vec<ForwardTrafficHistory>;
	/// Replaces every row at `old_timestamps` for `(rule_id, node_id)` with a
	/// single row at `bucket_start`.
	fn replace_with_bucket(&self, rule_id: RuleId, node_id: &str, old_timestamps: &[DateTime<Utc>], bucket: ForwardTrafficHistory);
	fn delete_older_than(&self, cutoff: DateTime<Utc>);
}

pub trait AlertRepository: Send + Sync {
	fn config(&self, rule_id: RuleId) -> Option<AlertConfig>;
	fn set_config(&self, config: AlertConfig);
	fn last_alert(&self, rule_id: RuleId, alert_type: AlertType) -> Option<AlertHistoryRow>;
	fn record_alert(&self, row: AlertHistoryRow);
	fn cleared_at(&self, rule_id: RuleId, alert_type: AlertType) -> Option<DateTime<Utc>>;
	fn set_cleared_at(&self, rule_id: RuleId, alert_type: AlertType, at: DateTime<Utc>);
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
	rules: Mutex<BTreeMap<RuleId, Rule>>,
}

impl RuleRepository for InMemoryRuleRepository {
	fn get(&self, rule_id: RuleId) -> Option<Rule> {
		self.rules.lock().get(&rule_id).cloned()
	}

	fn list(&self) -> Vec<Rule> {
		self.rules.lock().values().cloned().collect()
	}

	fn upsert(&self, rule: Rule) {
		self.rules.lock().insert(rule.id, rule);
	}
}

#[derive(Default)]
pub struct InMemoryStatsRepository {
	instance: Mutex<BTreeMap<(RuleId, NodeId, String), ForwardInstanceStat>>,
	node: Mutex<BTreeMap<(RuleId, NodeId), ForwardStat>>,
}

impl StatsRepository for InMemoryStatsRepository {
	fn upsert_instance_stat(&self, stat: ForwardInstanceStat) {
		let key = (stat.rule_id, stat.node_id.clone(), stat.instance_id.clone());
		self.instance.lock().insert(key, stat);
	}

	fn instance_stats(&self, rule_id: RuleId, node_id: &str) -> Vec<ForwardInstanceStat> {
		self.instance
			.lock()
			.iter()
			.filter(|((r, n, _), _)| *r == rule_id && n == node_id)
			.map(|(_, v)| v.clone())
			.collect()
	}

	fn upsert_node_stat(&self, stat: ForwardStat) {
		let key = (stat.rule_id, stat.node_id.clone());
		self.node.lock().insert(key, stat);
	}

	fn node_stat(&self, rule_id: RuleId, node_id: &str) -> Option<ForwardStat> {
		self.node.lock().get(&(rule_id, node_id.to_string())).cloned()
	}

	fn node_stats(&self, rule_id: RuleId) -> Vec<ForwardStat> {
		self.node
			.lock()
			.iter()
			.filter(|((r, _), _)| *r == rule_id)
			.map(|(_, v)| v.clone())
			.collect()
	}
}

#[derive(Default)]
pub struct InMemoryHistoryRepository {
	rows: Mutex<BTreeMap<(RuleId, NodeId, DateTime<Utc>), ForwardTrafficHistory>>,
}

impl HistoryRepository for InMemoryHistoryRepository {
	fn accumulate(&self, rule_id: RuleId, node_id: &str, bucket: DateTime<Utc>, delta_bytes_in: u64, delta_bytes_out: u64, connections: u64, avg_latency_ms: f64) {
		let mut rows = self.rows.lock();
		let key = (rule_id, node_id.to_string(), bucket);
		rows.entry(key)
			.and_modify(|row| {
				row.bytes_in += delta_bytes_in;
				row.bytes_out += delta_bytes_out;
				row.connections = connections;
				row.avg_latency_ms = avg_latency_ms;
			})
			.or_insert(ForwardTrafficHistory {
				rule_id,
				node_id: node_id.to_string(),
				timestamp_bucket: bucket,
				bytes_in: delta_bytes_in,
				bytes_out: delta_bytes_out,
				connections,
				avg_latency_ms,
			});
	}

	fn rows_for_node(&self, rule_id: RuleId, node_id: &str) -> Vec<ForwardTrafficHistory> {
		self.rows
			.lock()
			.iter()
			.filter(|((r, n, _), _)| *r == rule_id && n == node_id)
			.map(|(_, v)| v.clone())
			.collect()
	}

	fn rows_older_than(&self, cutoff: DateTime<Utc>) -> Vec<ForwardTrafficHistory> {
		self.rows.lock().values().filter(|row| row.timestamp_bucket < cutoff).cloned().collect()
	}

	fn replace_with_bucket(&self, rule_id: RuleId, node_id: &str, old_timestamps: &[DateTime<Utc>], bucket: ForwardTrafficHistory) {
		let mut rows = self.rows.lock();
		for ts in old_timestamps {
			if *ts != bucket.timestamp_bucket {
				rows.remove(&(rule_id, node_id.to_string(), *ts));
			}
		}
		rows.insert((rule_id, node_id.to_string(), bucket.timestamp_bucket), bucket);
	}

	fn delete_older_than(&self, cutoff: DateTime<Utc>) {
		self.rows.lock().retain(|_, row| row.timestamp_bucket >= cutoff);
	}
}

#[derive(Default)]
pub struct InMemoryAlertRepository {
	configs: Mutex<BTreeMap<RuleId, AlertConfig>>,
	last_alerts: Mutex<BTreeMap<(RuleId, AlertType), AlertHistoryRow>>,
	cleared: Mutex<BTreeMap<(RuleId, AlertType), DateTime<Utc>>>,
}

impl AlertRepository for InMemoryAlertRepository {
	fn config(&self, rule_id: RuleId) -> Option<AlertConfig> {
		self.configs.lock().get(&rule_id).cloned()
	}

	fn set_config(&self, config: AlertConfig) {
		self.configs.lock().insert(config.rule_id, config);
	}

	fn last_alert(&self, rule_id: RuleId, alert_type: AlertType) -> Option<AlertHistoryRow> {
		self.last_alerts.lock().get(&(rule_id, alert_type)).cloned()
	}

	fn record_alert(&self, row: AlertHistoryRow) {
		self.last_alerts.lock().insert((row.rule_id, row.alert_type), row);
	}

	fn cleared_at(&self, rule_id: RuleId, alert_type: AlertType) -> Option<DateTime<Utc>> {
		self.cleared.lock().get(&(rule_id, alert_type)).copied()
	}

	fn set_cleared_at(&self, rule_id: RuleId, alert_type: AlertType, at: DateTime<Utc>) {
		self.cleared.lock().insert((rule_id, alert_type), at);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn history_accumulate_adds_bytes_and_replaces_connections() {
		let repo = InMemoryHistoryRepository::default();
		let bucket = Utc::now();
		repo.accumulate(1, "A", bucket, 100, 200, 3, 5.0);
		repo.accumulate(1, "A", bucket, 50, 25, 4, 6.0);
		let rows = repo.rows_for_node(1, "A");
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].bytes_in, 150);
		assert_eq!(rows[0].bytes_out, 225);
		assert_eq!(rows[0].connections, 4);
		assert_eq!(rows[0].avg_latency_ms, 6.0);
	}

	#[test]
	fn rule_repository_round_trips() {
		use komari_forward_core::model::{Protocol, RuleConfig, RuleStatus, RuleTotals, Target};
		let repo = InMemoryRuleRepository::default();
		let rule = Rule {
			id: 1,
			enabled: true,
			status: RuleStatus::Stopped,
			config: RuleConfig::Direct {
				entry_node_id: "A".into(),
				entry_port_spec: "8080".into(),
				entry_current_port: 8080,
				protocol: Protocol::Tcp,
				target: Target::Literal {
					host: "1.2.3.4".into(),
					port: 443,
				},
				network: None,
			},
			totals: RuleTotals::default(),
		};
		repo.upsert(rule.clone());
		assert_eq!(repo.get(1).unwrap().id, 1);
		assert_eq!(repo.list().len(), 1);
	}
}
