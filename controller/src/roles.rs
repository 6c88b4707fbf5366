//! Bridges `RuleRepository` into the `RuleNodeRoles` capability the Stats
//! Aggregator needs (entry-vs-non-entry node lookups, rule totals), without
//! making `stats.rs` depend on the full repository trait.

use crate::repository::RuleRepository;
use komari_forward_core::model::{HopKind, NodeId, RuleConfig, RuleId};
use komari_forward_core::sort::{stable_sort_hops, stable_sort_relays};
use std::sync::Arc;

pub struct RepositoryRoles<R: RuleRepository> {
	rules: Arc<R>,
}

impl<R: RuleRepository> RepositoryRoles<R> {
	pub fn new(rules: Arc<R>) -> Self {
		Self { rules }
	}
}

impl<R: RuleRepository> crate::stats::RuleNodeRoles for RepositoryRoles<R> {
	fn entry_node_id(&self, rule_id: RuleId) -> Option<NodeId> {
		self.rules.get(rule_id).map(|r| r.config.entry_node_id().clone())
	}

	fn non_entry_node_ids(&self, rule_id: RuleId) -> Vec<NodeId> {
		let Some(rule) = self.rules.get(rule_id) else { return vec![] };
		non_entry_nodes(&rule.config)
	}

	fn add_rule_totals(&self, rule_id: RuleId, in_bytes: u64, out_bytes: u64, conns: u64) {
		if let Some(mut rule) = self.rules.get(rule_id) {
			rule.totals.in_bytes += in_bytes;
			rule.totals.out_bytes += out_bytes;
			rule.totals.conns += conns;
			self.rules.upsert(rule);
		}
	}
}

fn non_entry_nodes(config: &RuleConfig) -> Vec<NodeId> {
	match config {
		RuleConfig::Direct { .. } => vec![],
		RuleConfig::RelayGroup { relays, .. } => stable_sort_relays(relays).into_iter().map(|r| r.node_id).collect(),
		RuleConfig::Chain { hops, .. } => stable_sort_hops(hops)
			.into_iter()
			.flat_map(|hop| match hop.kind {
				HopKind::Direct { node_id, .. } => vec![node_id],
				HopKind::RelayGroup { relays, .. } => stable_sort_relays(&relays).into_iter().map(|r| r.node_id).collect(),
			})
			.collect(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::InMemoryRuleRepository;
	use crate::stats::RuleNodeRoles;
	use komari_forward_core::model::{Protocol, Relay, Rule, RuleStatus, RuleTotals, Strategy, Target};

	#[test]
	fn non_entry_nodes_lists_relays() {
		let rules = Arc::new(InMemoryRuleRepository::default());
		rules.upsert(Rule {
			id: 1,
			enabled: true,
			status: RuleStatus::Running,
			config: RuleConfig::RelayGroup {
				entry_node_id: "A".into(),
				entry_port_spec: "9000".into(),
				entry_current_port: 9000,
				protocol: Protocol::Tcp,
				target: Target::Literal { host: "1.2.3.4".into(), port: 443 },
				strategy: Strategy::Failover,
				relays: vec![Relay {
					node_id: "B".into(),
					port_spec: "7000".into(),
					current_port: 7000,
					sort_order: 0,
				}],
				network: None,
			},
			totals: RuleTotals::default(),
		});
		let roles = RepositoryRoles::new(rules);
		assert_eq!(roles.entry_node_id(1).as_deref(), Some("A"));
		assert_eq!(roles.non_entry_node_ids(1), vec!["B".to_string()]);
	}
}
