//! Typed errors for the controller's internal components, composed with
//! `anyhow` at the binary/HTTP boundary — the same split the planner crate
//! uses for `CoreError`.

use komari_forward_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("task {task_id} ({task_type:?}) timed out")]
	Timeout { task_id: String, task_type: komari_forward_core::task::TaskType },

	#[error("message bus send failed: {0}")]
	BusSend(String),

	#[error("task {task_id} failed: {message}")]
	TaskFailed { task_id: String, message: String },
}

#[derive(Error, Debug)]
pub enum ApplyError {
	#[error(transparent)]
	Invalid(#[from] CoreError),

	#[error(transparent)]
	Dispatch(#[from] DispatchError),

	#[error("node {node_id} apply failed: {message}")]
	NodeFailed { node_id: String, message: String },

	#[error("rule {0} not found")]
	RuleNotFound(komari_forward_core::model::RuleId),
}

#[derive(Error, Debug)]
pub enum RepositoryError {
	#[error("rule {0} not found")]
	RuleNotFound(komari_forward_core::model::RuleId),
}
