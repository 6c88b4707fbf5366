//! Wires the Apply Engine, Dispatcher, and a scripted fake agent bus
//! together end to end, the way a real agent connection would drive them,
//! instead of unit-testing each piece against a trivial stub.

use komari_forward_controller::apply::ApplyEngine;
use komari_forward_controller::dispatcher::Dispatcher;
use komari_forward_controller::registry::NodeRegistry;
use komari_forward_controller::repository::{InMemoryRuleRepository, RuleRepository};
use komari_forward_core::model::{Protocol, Relay, Rule, RuleConfig, RuleStatus, RuleTotals, Strategy, Target};
use komari_forward_core::task::{
	CheckPortResponse, InstanceOp, InstanceOpResult, RealmApiEnsureResponse, RealmInstanceApplyResponse, TaskEnvelope, TaskResult, TaskType,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Responds to whatever the Apply Engine dispatches, based on task type and
/// a per-node attempt counter, standing in for the agent side of the bus.
struct ScriptedBus {
	tx: mpsc::UnboundedSender<(String, TaskEnvelope)>,
}

#[async_trait::async_trait]
impl komari_forward_controller::bus::MessageBus for ScriptedBus {
	async fn send_task(&self, node_id: &str, envelope: &TaskEnvelope) -> anyhow::Result<()> {
		self.tx.send((node_id.to_string(), envelope.clone()))?;
		Ok(())
	}
}

fn relay_group_rule(id: u32) -> Rule {
	Rule {
		id,
		enabled: true,
		status: RuleStatus::Stopped,
		config: RuleConfig::RelayGroup {
			entry_node_id: "A".into(),
			entry_port_spec: "8000-8010".into(),
			entry_current_port: 0,
			protocol: Protocol::Tcp,
			target: Target::Literal { host: "1.2.3.4".into(), port: 443 },
			strategy: Strategy::Failover,
			relays: vec![Relay {
				node_id: "B".into(),
				port_spec: "9000-9010".into(),
				current_port: 0,
				sort_order: 0,
			}],
			network: None,
		},
		totals: RuleTotals::default(),
	}
}

/// Drives every envelope the Apply Engine sends through a small script:
/// `CHECK_PORT`/`REALM_API_ENSURE` always succeed, and the first
/// `REALM_INSTANCE_APPLY` for node `B` fails with a bind-conflict message so
/// the retry-with-reallocated-port path (§8 scenario 4) gets exercised.
async fn run_responder(mut rx: mpsc::UnboundedReceiver<(String, TaskEnvelope)>, dispatcher: Arc<Dispatcher<ScriptedBus>>) {
	let node_b_attempts = AtomicU32::new(0);
	while let Some((node_id, envelope)) = rx.recv().await {
		let result = match envelope.task_type {
			TaskType::CheckPort => TaskResult {
				task_id: envelope.task_id,
				task_type: envelope.task_type,
				success: true,
				message: None,
				payload_json: serde_json::to_value(CheckPortResponse {
					success: true,
					available_port: Some(9005),
					message: "ok".into(),
				})
				.unwrap(),
			},
			TaskType::RealmApiEnsure => TaskResult {
				task_id: envelope.task_id,
				task_type: envelope.task_type,
				success: true,
				message: None,
				payload_json: serde_json::to_value(RealmApiEnsureResponse {
					success: true,
					pid: 100,
					port: 9900,
					realm_version: "1.0.0-fake".into(),
					message: "ok".into(),
				})
				.unwrap(),
			},
			TaskType::RealmInstanceApply => {
				let ops: komari_forward_core::task::RealmInstanceApplyRequest = serde_json::from_value(envelope.payload_json).unwrap();
				let fail_this_attempt = node_id == "B" && node_b_attempts.fetch_add(1, Ordering::SeqCst) == 0;
				let results: Vec<InstanceOpResult> = ops
					.ops
					.into_iter()
					.map(|op| {
						let is_start_like = matches!(op.op, InstanceOp::Upsert | InstanceOp::Start);
						let success = !(fail_this_attempt && is_start_like);
						InstanceOpResult {
							op: op.op,
							instance_id: op.instance_id,
							success,
							message: if success { None } else { Some("bind: address already in use".into()) },
						}
					})
					.collect();
				let success = results.iter().all(|r| r.success);
				TaskResult {
					task_id: envelope.task_id,
					task_type: envelope.task_type,
					success,
					message: None,
					payload_json: serde_json::to_value(RealmInstanceApplyResponse {
						success,
						results,
						message: if success { "ok".into() } else { "bind conflict".into() },
					})
					.unwrap(),
				}
			},
			other => panic!("unexpected task type dispatched in this scenario: {other:?}"),
		};
		dispatcher.complete(result);
	}
}

#[tokio::test]
async fn relay_group_start_recovers_from_a_bind_conflict_on_the_relay() {
	let (tx, rx) = mpsc::unbounded_channel();
	let dispatcher = Arc::new(Dispatcher::new(Arc::new(ScriptedBus { tx })));
	let responder_dispatcher = dispatcher.clone();
	let responder = tokio::spawn(run_responder(rx, responder_dispatcher));

	let rules = Arc::new(InMemoryRuleRepository::default());
	rules.upsert(relay_group_rule(1));

	let registry = Arc::new(NodeRegistry::new());
	registry.set("A", "10.0.0.1");
	registry.set("B", "10.0.0.2");

	let engine = ApplyEngine::new(dispatcher.clone(), rules.clone(), registry);
	engine.start(1).await.expect("start should recover from the first bind conflict and succeed on retry");

	let rule = rules.get(1).unwrap();
	assert_eq!(rule.status, RuleStatus::Running);

	drop(engine);
	drop(dispatcher);
	let _ = tokio::time::timeout(std::time::Duration::from_millis(500), responder).await;
}

#[tokio::test]
async fn stop_tears_down_relay_then_entry_and_marks_rule_stopped() {
	let (tx, rx) = mpsc::unbounded_channel();
	let dispatcher = Arc::new(Dispatcher::new(Arc::new(ScriptedBus { tx })));
	let responder_dispatcher = dispatcher.clone();
	let responder = tokio::spawn(run_responder(rx, responder_dispatcher));

	let rules = Arc::new(InMemoryRuleRepository::default());
	let mut rule = relay_group_rule(2);
	rule.status = RuleStatus::Running;
	rules.upsert(rule);

	let registry = Arc::new(NodeRegistry::new());
	registry.set("A", "10.0.0.1");
	registry.set("B", "10.0.0.2");

	let engine = ApplyEngine::new(dispatcher.clone(), rules.clone(), registry);
	engine.stop(2).await.unwrap();

	assert_eq!(rules.get(2).unwrap().status, RuleStatus::Stopped);

	drop(engine);
	drop(dispatcher);
	let _ = tokio::time::timeout(std::time::Duration::from_millis(500), responder).await;
}
