//! The controller's view of the agent message bus (§4.5/§6). Framing and
//! transport (WebSocket, reconnect, heartbeats) are out of scope — this
//! trait is the single seam the Dispatcher needs: "deliver this envelope to
//! that node".

use async_trait::async_trait;
use komari_forward_core::task::TaskEnvelope;

#[async_trait]
pub trait MessageBus: Send + Sync {
	async fn send_task(&self, node_id: &str, envelope: &TaskEnvelope) -> anyhow::Result<()>;
}
