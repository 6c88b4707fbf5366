//! The agent's end of the message bus (§4.5/§6): a WebSocket client to the
//! controller. Framing/reconnect is the minimum real transport the rest of
//! the agent needs — `OutboundSender` is the narrow capability the Reporter
//! and Switcher use to push unsolicited frames without depending on the
//! connection's own reconnect loop.

use crate::router::TaskRouter;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone)]
pub struct OutboundSender(UnboundedSender<serde_json::Value>);

impl OutboundSender {
	pub fn send(&self, frame: serde_json::Value) {
		if self.0.send(frame).is_err() {
			tracing::debug!("dropping outbound frame: connection not established yet");
		}
	}
}

/// Connects to the controller, relays `forward_task` frames to the Task
/// Router (replying with `forward_task_result`), and drains `outbound` for
/// unsolicited pushes (`forward_resync_request`, `forward_instance_stats`,
/// `forward_config_sync`). Reconnects with a fixed backoff on disconnect;
/// returns only if `stop` fires.
pub async fn run(url: String, node_id: String, router: Arc<TaskRouter>, mut outbound: UnboundedReceiver<serde_json::Value>, stop: Arc<tokio::sync::Notify>) {
	loop {
		tokio::select! {
			_ = stop.notified() => return,
			result = connect_and_serve(&url, &node_id, router.clone(), &mut outbound) => {
				if let Err(err) = result {
					tracing::warn!(%err, "controller connection dropped, reconnecting");
				}
			}
		}
		tokio::time::sleep(std::time::Duration::from_secs(5)).await;
	}
}

pub fn channel() -> (OutboundSender, UnboundedReceiver<serde_json::Value>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(OutboundSender(tx), rx)
}

async fn connect_and_serve(url: &str, node_id: &str, router: Arc<TaskRouter>, outbound: &mut UnboundedReceiver<serde_json::Value>) -> anyhow::Result<()> {
	let (stream, _) = tokio_tungstenite::connect_async(url).await?;
	let (mut sink, mut source) = stream.split();

	sink.send(Message::Text(serde_json::json!({ "message": "forward_resync_request", "node_id": node_id }).to_string())).await?;

	loop {
		tokio::select! {
			frame = outbound.recv() => {
				let Some(frame) = frame else { return Ok(()) };
				if sink.send(Message::Text(frame.to_string())).await.is_err() {
					return Ok(());
				}
			}
			msg = source.next() => {
				let Some(msg) = msg else { return Ok(()) };
				let Message::Text(text) = msg? else { continue };
				let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
					tracing::warn!("dropping malformed controller frame");
					continue;
				};
				if value.get("message").and_then(|v| v.as_str()) != Some("forward_task") {
					continue;
				}
				let Some(task) = value.get("task").cloned() else { continue };
				let Ok(envelope) = serde_json::from_value(task) else {
					tracing::warn!("dropping malformed task envelope");
					continue;
				};
				let result = router.handle(envelope).await;
				let frame = serde_json::json!({ "message": "forward_task_result", "task_id": result.task_id, "task_type": result.task_type, "success": result.success, "message": result.message, "payload": result.payload_json });
				if sink.send(Message::Text(frame.to_string())).await.is_err() {
					return Ok(());
				}
			}
		}
	}
}
