//! The concrete `MessageBus` (§4.5/§6): one WebSocket connection per
//! connected agent, framed as the `{ message: "...", ... }` JSON envelopes
//! of §6. The WS transport framing itself — reconnect/backoff, heartbeats —
//! is explicitly out of scope (§1); this module only needs "deliver this
//! envelope to that node's socket" and "hand an inbound frame to the right
//! handler", which is the minimum real implementation the Dispatcher trait
//! requires to be more than a mock.

use crate::apply::ApplyEngine;
use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use crate::repository::RuleRepository;
use crate::stats::{ForwardInstanceStatsMessage, ForwardStatsMessage, RuleNodeRoles, StatsAggregator};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use komari_forward_core::task::TaskEnvelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Default)]
pub struct WsBus {
	conns: RwLock<HashMap<String, UnboundedSender<Message>>>,
}

impl WsBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn register(&self, node_id: &str) -> mpsc::UnboundedReceiver<Message> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.conns.write().insert(node_id.to_string(), tx);
		rx
	}

	fn deregister(&self, node_id: &str) {
		self.conns.write().remove(node_id);
	}
}

#[async_trait]
impl MessageBus for WsBus {
	async fn send_task(&self, node_id: &str, envelope: &TaskEnvelope) -> anyhow::Result<()> {
		let tx = self
			.conns
			.read()
			.get(node_id)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("agent {node_id} is not connected"))?;
		let frame = serde_json::json!({ "message": "forward_task", "task": envelope });
		tx.send(Message::Text(frame.to_string())).map_err(|err| anyhow::anyhow!(err.to_string()))?;
		Ok(())
	}
}

/// Drives one agent's WS connection for its lifetime: forwards outbound
/// frames queued by `send_task`, and routes inbound frames (§6 "from agent")
/// to the Dispatcher/StatsAggregator/ApplyEngine as appropriate. Runs until
/// the socket closes, then deregisters the node so `send_task` starts
/// failing fast instead of queuing into a dead connection.
pub async fn serve_agent_connection<S, H, A, B, N, R>(
	socket: WebSocket,
	node_id: String,
	bus: Arc<WsBus>,
	dispatcher: Arc<Dispatcher<WsBus>>,
	aggregator: Arc<StatsAggregator<S, H, A, B, N>>,
	apply_engine: Arc<ApplyEngine<WsBus, R>>,
) where
	S: crate::repository::StatsRepository + 'static,
	H: crate::repository::HistoryRepository + 'static,
	A: crate::repository::AlertRepository + 'static,
	B: crate::stats::StatsBroadcaster + 'static,
	N: RuleNodeRoles + 'static,
	R: RuleRepository + 'static,
{
	use futures::{SinkExt, StreamExt};

	let mut rx = bus.register(&node_id);
	let (mut sink, mut stream) = socket.split();

	let writer = tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			if sink.send(msg).await.is_err() {
				break;
			}
		}
	});

	while let Some(Ok(msg)) = stream.next().await {
		let Message::Text(text) = msg else { continue };
		let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
			tracing::warn!(%node_id, "dropping malformed agent frame");
			continue;
		};
		let Some(kind) = value.get("message").and_then(|v| v.as_str()) else { continue };

		match kind {
			"forward_task_result" => {
				if let Ok(result) = serde_json::from_value(value) {
					dispatcher.complete(result);
				}
			},
			"forward_resync_request" => {
				let engine = apply_engine.clone();
				let node_id = node_id.clone();
				tokio::spawn(async move {
					if let Err(err) = engine.resync(&node_id).await {
						tracing::warn!(%node_id, %err, "resync failed");
					}
				});
			},
			"forward_instance_stats" => {
				if let Ok(stats_msg) = serde_json::from_value::<ForwardInstanceStatsMessage>(value) {
					aggregator.handle_instance_stats(stats_msg, chrono::Utc::now());
				}
			},
			"forward_stats" => {
				if let Ok(stats_msg) = serde_json::from_value::<ForwardStatsMessage>(value) {
					aggregator.handle_legacy_stats(stats_msg, chrono::Utc::now());
				}
			},
			"forward_config_sync" => {
				tracing::info!(%node_id, frame = %value, "agent-initiated config sync (e.g. failover switch) received");
			},
			other => {
				tracing::debug!(%node_id, kind = other, "unhandled agent frame kind");
			},
		}
	}

	writer.abort();
	bus.deregister(&node_id);
}
