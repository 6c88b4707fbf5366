//! The Apply Engine (§4.4): start/stop/hot-update/resync for a single rule.
//! Per-rule serialization (§5 "the Apply Engine serializes start/stop/update
//! per rule") is the caller's job — it holds one `ApplyEngine` behind
//! whatever per-rule lock its request router uses; nothing here assumes
//! exclusivity for itself.

use crate::allocator::{ensure_current_ports, EnsureOpts};
use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use crate::error::ApplyError;
use crate::repository::RuleRepository;
use komari_forward_core::apply_order::{build_apply_node_order, build_hot_update_node_order};
use komari_forward_core::model::{HopKind, NodeId, PlannedInstance, Rule, RuleConfig, RuleId, RuleStatus};
use komari_forward_core::planner::{self, plan, NodeResolver};
use komari_forward_core::portspec;
use komari_forward_core::sort::{stable_sort_hops, stable_sort_relays};
use komari_forward_core::task::{
	InstanceOp, InstanceOpRequest, RealmApiEnsureRequest, RealmApiEnsureResponse, RealmInstanceApplyRequest, RealmInstanceApplyResponse, TaskType,
};
use komari_forward_core::CoreError;
use std::collections::BTreeSet;
use std::sync::Arc;

const MAX_NODE_ATTEMPTS: u32 = 3;
const BIND_CONFLICT_MARKERS: [&str; 4] = ["address already in use", "already in use", "bind", "listen"];

pub struct ApplyEngine<B: MessageBus, R: RuleRepository> {
	dispatcher: Arc<Dispatcher<B>>,
	rules: Arc<R>,
	resolver: Arc<dyn NodeResolver + Send + Sync>,
}

impl<B: MessageBus, R: RuleRepository> ApplyEngine<B, R> {
	pub fn new(dispatcher: Arc<Dispatcher<B>>, rules: Arc<R>, resolver: Arc<dyn NodeResolver + Send + Sync>) -> Self {
		Self { dispatcher, rules, resolver }
	}

	fn get_rule(&self, rule_id: RuleId) -> Result<Rule, ApplyError> {
		self.rules.get(rule_id).ok_or(ApplyError::RuleNotFound(rule_id))
	}

	fn reserved_ports(&self, exclude_rule_id: RuleId, node_id: &str) -> BTreeSet<u16> {
		let mut reserved = BTreeSet::new();
		for rule in self.rules.list() {
			if rule.id == exclude_rule_id {
				continue;
			}
			let mut cfg = rule.config;
			for binding in cfg.port_bindings() {
				if binding.node_id != node_id {
					continue;
				}
				if *binding.current > 0 {
					reserved.insert(*binding.current);
				} else if let Ok(ports) = portspec::parse(&binding.spec) {
					if ports.len() == 1 {
						reserved.insert(*ports.iter().next().unwrap());
					}
				}
			}
		}
		reserved
	}

	async fn ensure_daemon(&self, node_id: &str) -> Result<(), ApplyError> {
		let payload = serde_json::to_value(RealmApiEnsureRequest {
			force_reinstall: false,
			binary_url: None,
		})
		.expect("RealmApiEnsureRequest always serializes");
		let result = self.dispatcher.dispatch(node_id, TaskType::RealmApiEnsure, payload).await?;
		let response: RealmApiEnsureResponse = serde_json::from_value(result.payload_json)
			.map_err(|_| ApplyError::NodeFailed { node_id: node_id.to_string(), message: "malformed REALM_API_ENSURE response".into() })?;
		if !response.success {
			return Err(ApplyError::NodeFailed {
				node_id: node_id.to_string(),
				message: response.message,
			});
		}
		Ok(())
	}

	/// Applies `ops` for `node_id`'s instances, retrying up to
	/// `MAX_NODE_ATTEMPTS` times if the failure looks like a bind conflict —
	/// re-probing a free port for that node and re-planning before retrying
	/// the whole node (§4.4, §8 scenario 4).
	async fn apply_node_ops(&self, rule: &mut Rule, node_id: &str, ops_for: impl Fn(&[PlannedInstance]) -> Vec<InstanceOpRequest>) -> Result<(), ApplyError> {
		for attempt in 1..=MAX_NODE_ATTEMPTS {
			let planned = plan(rule.id, &rule.config, self.resolver.as_ref())?;
			let node_instances: Vec<PlannedInstance> = planned.into_iter().filter(|i| i.node_id == node_id).collect();
			let ops = ops_for(&node_instances);
			if ops.is_empty() {
				return Ok(());
			}

			let request = RealmInstanceApplyRequest { ops };
			let payload = serde_json::to_value(&request).expect("RealmInstanceApplyRequest always serializes");
			let result = self.dispatcher.dispatch(node_id, TaskType::RealmInstanceApply, payload).await?;
			let response: RealmInstanceApplyResponse = serde_json::from_value(result.payload_json)
				.map_err(|_| ApplyError::NodeFailed { node_id: node_id.to_string(), message: "malformed REALM_INSTANCE_APPLY response".into() })?;

			let bind_conflict = response.results.iter().any(|r| {
				!r.success && matches!(r.op, InstanceOp::Upsert | InstanceOp::Start) && r.message.as_deref().is_some_and(is_bind_conflict)
			});

			if !bind_conflict {
				if response.results.iter().all(|r| r.success) {
					return Ok(());
				}
				return Err(ApplyError::NodeFailed {
					node_id: node_id.to_string(),
					message: response.message,
				});
			}

			if attempt == MAX_NODE_ATTEMPTS {
				return Err(ApplyError::NodeFailed {
					node_id: node_id.to_string(),
					message: "bind conflict persisted after retries".into(),
				});
			}
			tracing::warn!(node_id, attempt, "bind conflict detected, reallocating port and retrying node");
			self.reallocate_node_port(rule, node_id).await?;
		}
		unreachable!("loop always returns by MAX_NODE_ATTEMPTS")
	}

	/// Re-probes a fresh port for every binding this rule has on `node_id`,
	/// excluding the port that just failed to bind, and persists the result.
	async fn reallocate_node_port(&self, rule: &mut Rule, node_id: &str) -> Result<(), ApplyError> {
		let reserved = self.reserved_ports(rule.id, node_id);
		for binding in rule.config.port_bindings() {
			if binding.node_id != node_id {
				continue;
			}
			let mut excluded = reserved.clone();
			excluded.insert(*binding.current);
			let decision = komari_forward_core::allocator::decide_port(&binding.spec, 0, &excluded)?;
			let chosen = match decision {
				komari_forward_core::allocator::PortDecision::Keep(p) => p,
				komari_forward_core::allocator::PortDecision::Probe { spec, excluded } => {
					let request = komari_forward_core::task::CheckPortRequest {
						spec,
						excluded_ports: excluded.iter().copied().collect(),
					};
					let payload = serde_json::to_value(&request).expect("CheckPortRequest always serializes");
					let result = self
						.dispatcher
						.dispatch(node_id, TaskType::CheckPort, payload)
						.await
						.map_err(|_| CoreError::AgentUnreachable { node_id: node_id.to_string() })?;
					let response: komari_forward_core::task::CheckPortResponse = serde_json::from_value(result.payload_json)
						.map_err(|_| CoreError::AgentUnreachable { node_id: node_id.to_string() })?;
					response.available_port.ok_or_else(|| CoreError::PortAllocation {
						node_id: node_id.to_string(),
						spec: binding.spec.clone(),
					})?
				},
			};
			*binding.current = chosen;
		}
		self.rules.upsert(rule.clone());
		Ok(())
	}

	/// Start (§4.4). Validates strategies, re-probes pre-existing port picks,
	/// then brings every node up in reverse-traffic order, entry last.
	pub async fn start(&self, rule_id: RuleId) -> Result<(), ApplyError> {
		let mut rule = self.get_rule(rule_id)?;
		validate_strategies(&rule.config)?;

		ensure_current_ports(
			&mut rule.config,
			|node_id| self.reserved_ports(rule_id, node_id),
			&self.dispatcher,
			EnsureOpts { verify_current: true },
		)
		.await?;
		self.rules.upsert(rule.clone());

		let order = build_apply_node_order(&rule.config);
		for node_id in &order {
			self.ensure_daemon(node_id).await?;
			let result = self
				.apply_node_ops(&mut rule, node_id, |instances| {
					instances.iter().flat_map(upsert_then_start).collect()
				})
				.await;
			if let Err(err) = result {
				rule.status = RuleStatus::Error;
				self.rules.upsert(rule);
				return Err(err);
			}
		}

		rule.status = RuleStatus::Running;
		self.rules.upsert(rule);
		Ok(())
	}

	/// Stop (§4.4). No planner diffing needed — every instance the current
	/// config would produce gets torn down, entry last so it stops accepting
	/// traffic only once everything downstream is already gone.
	pub async fn stop(&self, rule_id: RuleId) -> Result<(), ApplyError> {
		let mut rule = self.get_rule(rule_id)?;
		let order = build_apply_node_order(&rule.config);
		let ids_by_node = instance_ids_by_node(rule_id, &rule.config);

		let mut had_failure = false;
		for node_id in &order {
			let Some(ids) = ids_by_node.get(node_id) else { continue };
			let ops: Vec<InstanceOpRequest> = ids.iter().flat_map(|id| stop_then_delete(id)).collect();
			let request = RealmInstanceApplyRequest { ops };
			let payload = serde_json::to_value(&request).expect("RealmInstanceApplyRequest always serializes");
			match self.dispatcher.dispatch(node_id, TaskType::RealmInstanceApply, payload).await {
				Ok(result) => {
					let response: Result<RealmInstanceApplyResponse, _> = serde_json::from_value(result.payload_json);
					if !matches!(response, Ok(r) if r.results.iter().all(|op| op.success)) {
						had_failure = true;
					}
				},
				Err(_) => had_failure = true,
			}
		}

		rule.status = if had_failure { RuleStatus::Error } else { RuleStatus::Stopped };
		self.rules.upsert(rule);
		if had_failure {
			return Err(ApplyError::NodeFailed {
				node_id: "multiple".into(),
				message: "one or more nodes failed to stop cleanly".into(),
			});
		}
		Ok(())
	}

	/// Hot update (§4.4). Ensures ports on the *new* config without
	/// re-verifying the rule's own already-running picks, diffs old vs new
	/// planned instances by instance id, and applies per node in the
	/// hot-update order (old-only nodes torn down first).
	pub async fn hot_update(&self, rule_id: RuleId, mut new_config: RuleConfig) -> Result<(), ApplyError> {
		let mut rule = self.get_rule(rule_id)?;
		let old_config = rule.config.clone();
		validate_strategies(&new_config)?;

		ensure_current_ports(
			&mut new_config,
			|node_id| self.reserved_ports(rule_id, node_id),
			&self.dispatcher,
			EnsureOpts { verify_current: false },
		)
		.await?;

		let old_planned = plan(rule_id, &old_config, self.resolver.as_ref())?;
		rule.config = new_config;
		self.rules.upsert(rule.clone());

		let order = build_hot_update_node_order(&old_config, &rule.config);
		for node_id in &order {
			self.ensure_daemon(node_id).await?;
			let old_planned = old_planned.clone();
			let result = self
				.apply_node_ops(&mut rule, node_id, move |new_instances| diff_ops(&old_planned, new_instances, node_id))
				.await;
			if let Err(err) = result {
				rule.status = RuleStatus::Error;
				self.rules.upsert(rule);
				return Err(err);
			}
		}

		rule.status = RuleStatus::Running;
		self.rules.upsert(rule);
		Ok(())
	}

	/// Resync (§4.4): a reconnecting agent's instances are reconciled
	/// best-effort against every rule's desired state, without touching rule
	/// status.
	pub async fn resync(&self, node_id: &str) -> Result<(), ApplyError> {
		for rule in self.rules.list() {
			let planned = match plan(rule.id, &rule.config, self.resolver.as_ref()) {
				Ok(p) => p,
				Err(_) => continue,
			};
			let node_instances: Vec<PlannedInstance> = planned.into_iter().filter(|i| i.node_id == node_id).collect();
			if node_instances.is_empty() {
				continue;
			}
			let ops: Vec<InstanceOpRequest> = if rule.enabled && matches!(rule.status, RuleStatus::Running) {
				node_instances.iter().flat_map(upsert_then_start).collect()
			} else {
				node_instances.iter().flat_map(|i| stop_then_delete(&i.instance_id)).collect()
			};
			let request = RealmInstanceApplyRequest { ops };
			let payload = serde_json::to_value(&request).expect("RealmInstanceApplyRequest always serializes");
			let _ = self.dispatcher.dispatch(node_id, TaskType::RealmInstanceApply, payload).await;
		}
		Ok(())
	}
}

fn validate_strategies(config: &RuleConfig) -> Result<(), CoreError> {
	match config {
		RuleConfig::Direct { .. } => Ok(()),
		RuleConfig::RelayGroup { relays, .. } => {
			if relays.is_empty() {
				Err(CoreError::InvalidConfig("relay_group has no relays".into()))
			} else {
				Ok(())
			}
		},
		RuleConfig::Chain { hops, .. } => {
			if hops.is_empty() {
				return Err(CoreError::InvalidConfig("chain has no hops".into()));
			}
			for hop in hops {
				if let HopKind::RelayGroup { relays, .. } = &hop.kind {
					if relays.is_empty() {
						return Err(CoreError::InvalidConfig("hop relay_group has no relays".into()));
					}
				}
			}
			Ok(())
		},
	}
}

fn upsert_then_start(instance: &PlannedInstance) -> Vec<InstanceOpRequest> {
	vec![
		InstanceOpRequest {
			op: InstanceOp::Upsert,
			instance_id: instance.instance_id.clone(),
			config: Some(instance.endpoint_config.clone()),
		},
		InstanceOpRequest {
			op: InstanceOp::Start,
			instance_id: instance.instance_id.clone(),
			config: None,
		},
	]
}

fn stop_then_delete(instance_id: &str) -> Vec<InstanceOpRequest> {
	vec![
		InstanceOpRequest {
			op: InstanceOp::Stop,
			instance_id: instance_id.to_string(),
			config: None,
		},
		InstanceOpRequest {
			op: InstanceOp::Delete,
			instance_id: instance_id.to_string(),
			config: None,
		},
	]
}

fn is_bind_conflict(message: &str) -> bool {
	let lower = message.to_lowercase();
	BIND_CONFLICT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Instance ids `plan()` would produce for `config`, grouped by node,
/// without needing a resolver — used by `stop`, which only needs ids, not
/// remotes (§4.4 "no planner needed").
fn instance_ids_by_node(rule_id: RuleId, config: &RuleConfig) -> std::collections::BTreeMap<NodeId, Vec<String>> {
	let mut out: std::collections::BTreeMap<NodeId, Vec<String>> = std::collections::BTreeMap::new();
	match config {
		RuleConfig::Direct { entry_node_id, .. } => {
			out.entry(entry_node_id.clone()).or_default().push(planner::instance_id_entry(rule_id, entry_node_id));
		},
		RuleConfig::RelayGroup { entry_node_id, relays, .. } => {
			out.entry(entry_node_id.clone()).or_default().push(planner::instance_id_entry(rule_id, entry_node_id));
			for (i, r) in stable_sort_relays(relays).iter().enumerate() {
				out.entry(r.node_id.clone()).or_default().push(planner::instance_id_relay(rule_id, &r.node_id, i));
			}
		},
		RuleConfig::Chain { entry_node_id, hops, .. } => {
			out.entry(entry_node_id.clone()).or_default().push(planner::instance_id_entry(rule_id, entry_node_id));
			for hop in stable_sort_hops(hops) {
				match hop.kind {
					HopKind::Direct { node_id, .. } => {
						out.entry(node_id.clone()).or_default().push(planner::instance_id_hop_direct(rule_id, &node_id, hop.sort_order));
					},
					HopKind::RelayGroup { relays, .. } => {
						for (j, r) in stable_sort_relays(&relays).iter().enumerate() {
							out.entry(r.node_id.clone())
								.or_default()
								.push(planner::instance_id_hop_relay(rule_id, &r.node_id, hop.sort_order, j));
						}
					},
				}
			}
		},
	}
	out
}

/// Diffs `old_planned` against `new_instances` (already filtered to
/// `node_id`) by instance id (§4.4 hot update):
/// - an old id absent from the new set → `[stop, delete]`;
/// - a kept id whose `listen_port` changed → `[stop, upsert, start]`;
/// - anything else present in the new set → `[upsert, start]`.
fn diff_ops(old_planned: &[PlannedInstance], new_instances: &[PlannedInstance], node_id: &str) -> Vec<InstanceOpRequest> {
	let new_ids: std::collections::HashSet<&str> = new_instances.iter().map(|i| i.instance_id.as_str()).collect();
	let mut ops = Vec::new();

	for old in old_planned.iter().filter(|i| i.node_id == node_id) {
		if !new_ids.contains(old.instance_id.as_str()) {
			ops.extend(stop_then_delete(&old.instance_id));
		}
	}

	for new in new_instances {
		let old_match = old_planned.iter().find(|i| i.instance_id == new.instance_id);
		let needs_stop = old_match.is_some_and(|old| old.listen_port != new.listen_port);
		if needs_stop {
			ops.push(InstanceOpRequest {
				op: InstanceOp::Stop,
				instance_id: new.instance_id.clone(),
				config: None,
			});
		}
		ops.extend(upsert_then_start(new));
	}
	ops
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::InMemoryRuleRepository;
	use komari_forward_core::model::{Protocol, RuleTotals, Target};
	use komari_forward_core::task::{InstanceOpResult, TaskEnvelope, TaskResult};
	use std::collections::HashMap;

	struct FakeResolver(HashMap<&'static str, &'static str>);
	impl NodeResolver for FakeResolver {
		fn resolve(&self, node_id: &str) -> Result<String, CoreError> {
			self.0.get(node_id).map(|s| s.to_string()).ok_or_else(|| CoreError::InvalidConfig(node_id.to_string()))
		}
	}

	fn direct_rule(id: RuleId, port: u16) -> Rule {
		Rule {
			id,
			enabled: true,
			status: RuleStatus::Stopped,
			config: RuleConfig::Direct {
				entry_node_id: "A".into(),
				entry_port_spec: "8000-8010".into(),
				entry_current_port: port,
				protocol: Protocol::Tcp,
				target: Target::Literal {
					host: "1.2.3.4".into(),
					port: 443,
				},
				network: None,
			},
			totals: RuleTotals::default(),
		}
	}

	fn resolver() -> Arc<dyn NodeResolver + Send + Sync> {
		Arc::new(FakeResolver(HashMap::from([("A", "10.0.0.1")])))
	}

	#[tokio::test]
	async fn stop_tears_down_all_instances_and_marks_rule_stopped() {
		struct AlwaysOk;
		#[async_trait::async_trait]
		impl MessageBus for AlwaysOk {
			async fn send_task(&self, _node_id: &str, _envelope: &TaskEnvelope) -> anyhow::Result<()> {
				Ok(())
			}
		}
		let dispatcher = Arc::new(Dispatcher::new(Arc::new(AlwaysOk)));
		let rules = Arc::new(InMemoryRuleRepository::default());
		rules.upsert(direct_rule(1, 8080));
		let engine = ApplyEngine::new(dispatcher.clone(), rules.clone(), resolver());

		let responder = {
			let dispatcher = dispatcher.clone();
			tokio::spawn(async move {
				loop {
					if let Some(task_id) = dispatcher.pending_task_id_for_test() {
						dispatcher.complete(TaskResult {
							task_id,
							task_type: TaskType::RealmInstanceApply,
							success: true,
							message: None,
							payload_json: serde_json::to_value(RealmInstanceApplyResponse {
								success: true,
								results: vec![
									InstanceOpResult {
										op: InstanceOp::Stop,
										instance_id: "komari-r1-nA-entry".into(),
										success: true,
										message: None,
									},
									InstanceOpResult {
										op: InstanceOp::Delete,
										instance_id: "komari-r1-nA-entry".into(),
										success: true,
										message: None,
									},
								],
								message: "ok".into(),
							})
							.unwrap(),
						});
						break;
					}
					tokio::time::sleep(std::time::Duration::from_millis(2)).await;
				}
			})
		};

		engine.stop(1).await.unwrap();
		responder.await.unwrap();
		assert_eq!(rules.get(1).unwrap().status, RuleStatus::Stopped);
	}

	#[test]
	fn diff_ops_stops_removed_and_skips_stop_for_unchanged_port() {
		let old = vec![
			PlannedInstance {
				instance_id: "komari-r5-nH1-hop0".into(),
				node_id: "H1".into(),
				listen_addr: "0.0.0.0:5000".into(),
				listen_port: 5000,
				remote_addr: "x".into(),
				extra_remotes: vec![],
				balance: None,
				endpoint_config: serde_json::json!({}),
			},
			PlannedInstance {
				instance_id: "komari-r5-nH2-hop1".into(),
				node_id: "H2".into(),
				listen_addr: "0.0.0.0:6000".into(),
				listen_port: 6000,
				remote_addr: "x".into(),
				extra_remotes: vec![],
				balance: None,
				endpoint_config: serde_json::json!({}),
			},
		];
		let new_h2 = vec![PlannedInstance {
			instance_id: "komari-r5-nH2-hop1".into(),
			node_id: "H2".into(),
			listen_addr: "0.0.0.0:6000".into(),
			listen_port: 6000,
			remote_addr: "y".into(),
			extra_remotes: vec![],
			balance: None,
			endpoint_config: serde_json::json!({}),
		}];

		let ops_h1 = diff_ops(&old, &[], "H1");
		assert_eq!(ops_h1.len(), 2);
		assert_eq!(ops_h1[0].op, InstanceOp::Stop);
		assert_eq!(ops_h1[1].op, InstanceOp::Delete);

		let ops_h2 = diff_ops(&old, &new_h2, "H2");
		assert_eq!(ops_h2.len(), 2);
		assert_eq!(ops_h2[0].op, InstanceOp::Upsert);
		assert_eq!(ops_h2[1].op, InstanceOp::Start);
	}

	#[test]
	fn is_bind_conflict_matches_all_four_markers() {
		assert!(is_bind_conflict("Address already in use"));
		assert!(is_bind_conflict("port already in use"));
		assert!(is_bind_conflict("failed to bind socket"));
		assert!(is_bind_conflict("cannot listen on port"));
		assert!(!is_bind_conflict("permission denied"));
	}
}
