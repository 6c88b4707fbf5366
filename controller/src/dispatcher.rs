//! Task correlation (§4.5). The controller generates `task_id`, publishes
//! the envelope over the bus, and awaits the matching result within the
//! task-type's hard timeout. Result delivery is exactly-once per `task_id`:
//! `complete` is the only way a waiter is woken, and it's a no-op for an
//! unknown or already-delivered id.

use crate::bus::MessageBus;
use crate::error::DispatchError;
use komari_forward_core::task::{TaskEnvelope, TaskResult, TaskType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct Dispatcher<B: MessageBus> {
	bus: Arc<B>,
	pending: Mutex<HashMap<String, oneshot::Sender<TaskResult>>>,
}

impl<B: MessageBus> Dispatcher<B> {
	pub fn new(bus: Arc<B>) -> Self {
		Self {
			bus,
			pending: Mutex::new(HashMap::new()),
		}
	}

	/// Sends `task_type`/`payload` to `node_id` and waits for its result,
	/// bounded by that task type's hard timeout.
	#[tracing::instrument(skip(self, payload), fields(%node_id, ?task_type))]
	pub async fn dispatch(&self, node_id: &str, task_type: TaskType, payload: serde_json::Value) -> Result<TaskResult, DispatchError> {
		let task_id = uuid::Uuid::new_v4().to_string();
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(task_id.clone(), tx);

		let envelope = TaskEnvelope {
			task_id: task_id.clone(),
			task_type,
			payload_json: payload,
		};
		if let Err(err) = self.bus.send_task(node_id, &envelope).await {
			self.pending.lock().remove(&task_id);
			return Err(DispatchError::BusSend(err.to_string()));
		}

		let timeout = task_type.default_timeout();
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => Ok(result),
			Ok(Err(_)) => Err(DispatchError::Timeout { task_id, task_type }),
			Err(_) => {
				self.pending.lock().remove(&task_id);
				Err(DispatchError::Timeout { task_id, task_type })
			},
		}
	}

	#[cfg(test)]
	pub(crate) fn pending_task_id_for_test(&self) -> Option<String> {
		self.pending.lock().keys().next().cloned()
	}

	/// Fed by the agent connection handler when a `forward_task_result`
	/// arrives. Unknown/duplicate `task_id`s are logged and dropped (§4.5).
	pub fn complete(&self, result: TaskResult) {
		match self.pending.lock().remove(&result.task_id) {
			Some(tx) => {
				let _ = tx.send(result);
			},
			None => {
				tracing::warn!(task_id = %result.task_id, "dropping unknown or duplicate task result");
			},
		}
	}
}
