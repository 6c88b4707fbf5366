//! Instance Stats Reporter (§4.9): every `stats_poll_interval`, ensures the
//! forwarder daemon is healthy, then fetches stats (+ route) for every
//! registered instance and pushes them upstream. If the bus write fails,
//! this tick is abandoned — the next tick retries (§4.9).

use crate::bus::OutboundSender;
use crate::registry::InstanceRegistry;
use crate::supervisor::ForwarderSupervisor;
use std::sync::Arc;
use std::time::Duration;

pub struct InstanceReporter {
	pub supervisor: Arc<ForwarderSupervisor>,
	pub registry: Arc<InstanceRegistry>,
	pub outbound: OutboundSender,
	pub node_id: String,
	pub poll_interval: Duration,
}

impl InstanceReporter {
	pub async fn run(self, stop: Arc<tokio::sync::Notify>) {
		let mut ticker = tokio::time::interval(self.poll_interval);
		loop {
			tokio::select! {
				_ = stop.notified() => return,
				_ = ticker.tick() => self.tick().await,
			}
		}
	}

	#[tracing::instrument(skip(self))]
	async fn tick(&self) {
		if self.supervisor.ensure(false, None).await.is_err() {
			tracing::debug!("forwarder daemon unhealthy, skipping this reporter tick");
			return;
		}

		let now = chrono::Utc::now();
		for (instance_id, meta) in self.registry.snapshot() {
			let Ok(stats) = self.supervisor.get_stats(&instance_id).await else { continue };
			let route = self.supervisor.get_route(&instance_id).await.ok();

			let frame = serde_json::json!({
				"message": "forward_instance_stats",
				"rule_id": meta.rule_id,
				"node_id": self.node_id,
				"instance_id": instance_id,
				"listen": meta.listen,
				"listen_port": meta.listen_port,
				"stats": stats,
				"route": route,
				"last_updated_at": now,
			});
			self.outbound.send(frame);
		}
	}
}
