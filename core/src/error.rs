use thiserror::Error;

/// Planner/allocator failures surfaced to callers. Rule status is left
/// unchanged by the caller on any of these (per the propagation policy).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
	#[error("invalid rule config: {0}")]
	InvalidConfig(String),

	#[error("no free port available for spec {spec:?} on node {node_id}")]
	PortAllocation { node_id: String, spec: String },

	#[error("agent {node_id} unreachable while resolving port spec")]
	AgentUnreachable { node_id: String },
}
