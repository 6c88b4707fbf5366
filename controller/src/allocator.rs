//! `EnsureCurrentPorts` (§4.1): drives `komari_forward_core::allocator`'s
//! pure decision function with the one collaborator it can't have —
//! dispatching a `CHECK_PORT` probe to the node that owns the binding.

use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use komari_forward_core::allocator::{decide_port, PortDecision};
use komari_forward_core::model::RuleConfig;
use komari_forward_core::task::{CheckPortRequest, CheckPortResponse, TaskType};
use komari_forward_core::CoreError;
use std::collections::BTreeSet;

/// For `start`, pre-existing picks are re-probed (`verify_current = true`);
/// for a hot update on an already-running rule, they must not be, since the
/// rule's own current ports would otherwise look like conflicts.
#[derive(Clone, Copy, Debug)]
pub struct EnsureOpts {
	pub verify_current: bool,
}

/// Walks every `(node_id, spec, &mut current_port)` binding in `config`,
/// keeping acceptable picks and probing the owning agent for a replacement
/// otherwise. `reserved_by_node(node_id)` must return the union of every
/// *other* rule's ports on that node — this rule never blocks itself.
#[tracing::instrument(skip_all, fields(verify_current = opts.verify_current))]
pub async fn ensure_current_ports<B: MessageBus>(
	config: &mut RuleConfig,
	reserved_by_node: impl Fn(&str) -> BTreeSet<u16>,
	dispatcher: &Dispatcher<B>,
	opts: EnsureOpts,
) -> Result<(), CoreError> {
	let mut picked_this_run: BTreeSet<u16> = BTreeSet::new();
	let bindings = config.port_bindings();

	for binding in bindings {
		let mut reserved = reserved_by_node(&binding.node_id);
		reserved.extend(picked_this_run.iter().copied());

		let decision = decide_port(&binding.spec, *binding.current, &reserved)?;
		let chosen = match decision {
			PortDecision::Keep(port) if !opts.verify_current => port,
			PortDecision::Keep(port) => probe(dispatcher, &binding.node_id, &port.to_string(), &reserved)
				.await?
				.ok_or_else(|| CoreError::PortAllocation {
					node_id: binding.node_id.clone(),
					spec: binding.spec.clone(),
				})?,
			PortDecision::Probe { spec, excluded } => {
				probe(dispatcher, &binding.node_id, &spec, &excluded).await?.ok_or_else(|| CoreError::PortAllocation {
					node_id: binding.node_id.clone(),
					spec: binding.spec.clone(),
				})?
			},
		};

		tracing::debug!(node_id = %binding.node_id, port = chosen, "port bound");
		*binding.current = chosen;
		picked_this_run.insert(chosen);
	}
	Ok(())
}

async fn probe<B: MessageBus>(dispatcher: &Dispatcher<B>, node_id: &str, spec: &str, excluded: &BTreeSet<u16>) -> Result<Option<u16>, CoreError> {
	let request = CheckPortRequest {
		spec: spec.to_string(),
		excluded_ports: excluded.iter().copied().collect(),
	};
	let payload = serde_json::to_value(&request).expect("CheckPortRequest always serializes");
	let result = dispatcher
		.dispatch(node_id, TaskType::CheckPort, payload)
		.await
		.map_err(|_| CoreError::AgentUnreachable { node_id: node_id.to_string() })?;
	if !result.success {
		return Ok(None);
	}
	let response: CheckPortResponse = serde_json::from_value(result.payload_json)
		.map_err(|_| CoreError::AgentUnreachable { node_id: node_id.to_string() })?;
	Ok(response.available_port)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::MessageBus;
	use komari_forward_core::model::{Protocol, Target};
	use komari_forward_core::task::{TaskEnvelope, TaskResult};
	use std::sync::Arc;

	struct FakeAgent;

	#[async_trait::async_trait]
	impl MessageBus for FakeAgent {
		async fn send_task(&self, _node_id: &str, _envelope: &TaskEnvelope) -> anyhow::Result<()> {
			Ok(())
		}
	}

	/// Captures the task id it was asked to deliver so the test can reply to
	/// it, without reaching into the `Dispatcher`'s private pending map.
	struct CapturingAgent {
		last_task_id: Arc<parking_lot::Mutex<Option<String>>>,
	}

	#[async_trait::async_trait]
	impl MessageBus for CapturingAgent {
		async fn send_task(&self, _node_id: &str, envelope: &TaskEnvelope) -> anyhow::Result<()> {
			*self.last_task_id.lock() = Some(envelope.task_id.clone());
			Ok(())
		}
	}

	fn direct_config(current_port: u16) -> RuleConfig {
		RuleConfig::Direct {
			entry_node_id: "A".into(),
			entry_port_spec: "8000-9000".into(),
			entry_current_port: current_port,
			protocol: Protocol::Tcp,
			target: Target::Literal {
				host: "1.2.3.4".into(),
				port: 443,
			},
			network: None,
		}
	}

	#[tokio::test]
	async fn keeps_current_without_dispatch_when_not_verifying() {
		let dispatcher = Arc::new(Dispatcher::new(Arc::new(FakeAgent)));
		let mut config = direct_config(8421);
		ensure_current_ports(&mut config, |_| BTreeSet::new(), &dispatcher, EnsureOpts { verify_current: false })
			.await
			.unwrap();
		assert_eq!(config.entry_current_port(), 8421);
	}

	#[tokio::test]
	async fn probes_and_writes_back_when_no_current_pick() {
		let last_task_id = Arc::new(parking_lot::Mutex::new(None));
		let dispatcher = Arc::new(Dispatcher::new(Arc::new(CapturingAgent {
			last_task_id: last_task_id.clone(),
		})));
		let d2 = dispatcher.clone();
		let mut config = direct_config(0);

		let responder = tokio::spawn(async move {
			loop {
				if let Some(task_id) = last_task_id.lock().take() {
					d2.complete(TaskResult {
						task_id,
						task_type: TaskType::CheckPort,
						success: true,
						message: None,
						payload_json: serde_json::json!({"success": true, "available_port": 8421, "message": "ok"}),
					});
					return;
				}
				tokio::time::sleep(std::time::Duration::from_millis(2)).await;
			}
		});

		ensure_current_ports(&mut config, |_| BTreeSet::new(), &dispatcher, EnsureOpts { verify_current: true })
			.await
			.unwrap();
		responder.await.unwrap();
		assert_eq!(config.entry_current_port(), 8421);
	}
}
