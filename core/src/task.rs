//! The controller<->agent task envelope (§4.5). The message bus itself
//! (framing, delivery) is an external collaborator; this module only
//! defines the JSON contract carried over it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
	CheckPort,
	RealmApiEnsure,
	RealmInstanceApply,
	RealmInstanceStatsGet,
	RealmInstanceConnectionsGet,
	RealmInstanceRouteGet,
	TestConnectivity,
}

impl TaskType {
	/// Hard per-task-type timeout (§5 Cancellation & timeouts). Excludes the
	/// request-provided timeout + 2s grace that `TestConnectivity` also
	/// applies on top of its own payload-declared timeout.
	pub fn default_timeout(self) -> Duration {
		match self {
			TaskType::RealmApiEnsure => Duration::from_secs(60),
			TaskType::RealmInstanceApply => Duration::from_secs(30),
			TaskType::CheckPort => Duration::from_secs(10),
			TaskType::TestConnectivity => Duration::from_secs(5),
			TaskType::RealmInstanceStatsGet
			| TaskType::RealmInstanceConnectionsGet
			| TaskType::RealmInstanceRouteGet => Duration::from_secs(20),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
	pub task_id: String,
	pub task_type: TaskType,
	pub payload_json: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
	pub task_id: String,
	pub task_type: TaskType,
	pub success: bool,
	#[serde(default)]
	pub message: Option<String>,
	#[serde(default)]
	pub payload_json: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckPortRequest {
	pub spec: String,
	#[serde(default)]
	pub excluded_ports: Vec<u16>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckPortResponse {
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub available_port: Option<u16>,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmApiEnsureRequest {
	#[serde(default)]
	pub force_reinstall: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub binary_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmApiEnsureResponse {
	pub success: bool,
	#[serde(default)]
	pub pid: u32,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub realm_version: String,
	pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceOp {
	Upsert,
	Start,
	Stop,
	Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceOpRequest {
	pub op: InstanceOp,
	pub instance_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub config: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceApplyRequest {
	pub ops: Vec<InstanceOpRequest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceOpResult {
	pub op: InstanceOp,
	pub instance_id: String,
	pub success: bool,
	#[serde(default)]
	pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceApplyResponse {
	pub success: bool,
	pub results: Vec<InstanceOpResult>,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceStatsGetRequest {
	pub instance_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceStatsGetResponse {
	pub success: bool,
	pub stats_by_instance: BTreeMap<String, serde_json::Value>,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceConnectionsGetRequest {
	pub instance_id: String,
	#[serde(default)]
	pub protocol: Option<crate::model::Protocol>,
	#[serde(default = "default_connections_limit")]
	pub limit: u32,
	#[serde(default)]
	pub offset: u32,
}

fn default_connections_limit() -> u32 {
	100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceConnectionsGetResponse {
	pub success: bool,
	pub connections_json: Vec<serde_json::Value>,
	pub total: u64,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceRouteGetRequest {
	pub instance_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealmInstanceRouteGetResponse {
	pub success: bool,
	pub route_json: serde_json::Value,
	pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestConnectivityRequest {
	pub host: String,
	pub port: u16,
	#[serde(default = "default_connectivity_timeout_ms")]
	pub timeout_ms: u64,
}

fn default_connectivity_timeout_ms() -> u64 {
	5_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestConnectivityResponse {
	pub success: bool,
	pub reachable: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub latency_ms: Option<u64>,
	pub message: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn task_type_timeouts_match_spec() {
		assert_eq!(TaskType::RealmApiEnsure.default_timeout(), Duration::from_secs(60));
		assert_eq!(TaskType::RealmInstanceApply.default_timeout(), Duration::from_secs(30));
		assert_eq!(TaskType::CheckPort.default_timeout(), Duration::from_secs(10));
		assert_eq!(TaskType::RealmInstanceRouteGet.default_timeout(), Duration::from_secs(20));
	}

	#[test]
	fn envelope_round_trips_through_json() {
		let env = TaskEnvelope {
			task_id: "t-1".into(),
			task_type: TaskType::CheckPort,
			payload_json: serde_json::to_value(CheckPortRequest {
				spec: "8000-9000".into(),
				excluded_ports: vec![8421],
			})
			.unwrap(),
		};
		let json = serde_json::to_string(&env).unwrap();
		let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
		assert_eq!(back.task_id, "t-1");
		assert_eq!(back.task_type, TaskType::CheckPort);
	}
}
