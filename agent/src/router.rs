//! Task Router (§4.5/§4.6): dispatches typed tasks received from the
//! controller to the Forwarder Supervisor, Firewall Manager, and Stats
//! Programmer, always replying with a `TaskResult` — failures are reported
//! back, never dropped (per `AgentError`'s doc comment in `error.rs`).

use crate::error::AgentError;
use crate::firewall::{FirewallManager, Proto};
use crate::listen_host;
use crate::registry::{InstanceMeta, InstanceRegistry};
use crate::stats_programmer::{self, StatsProgrammer};
use crate::supervisor::ForwarderSupervisor;
use komari_forward_core::task::{
	CheckPortRequest, CheckPortResponse, InstanceOp, InstanceOpResult, RealmApiEnsureRequest, RealmApiEnsureResponse, RealmInstanceApplyRequest,
	RealmInstanceApplyResponse, RealmInstanceConnectionsGetRequest, RealmInstanceConnectionsGetResponse, RealmInstanceRouteGetRequest,
	RealmInstanceRouteGetResponse, RealmInstanceStatsGetRequest, RealmInstanceStatsGetResponse, TaskEnvelope, TaskResult, TaskType, TestConnectivityRequest,
	TestConnectivityResponse,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct TaskRouter {
	pub supervisor: Arc<ForwarderSupervisor>,
	pub firewall: Arc<FirewallManager>,
	pub stats_programmer: Arc<StatsProgrammer>,
	pub registry: Arc<InstanceRegistry>,
	pub listen_host: &'static str,
}

impl TaskRouter {
	#[tracing::instrument(skip(self, envelope), fields(task_id = %envelope.task_id, ?task_type = envelope.task_type))]
	pub async fn handle(&self, envelope: TaskEnvelope) -> TaskResult {
		let task_type = envelope.task_type;
		let payload = match self.dispatch(task_type, envelope.payload_json).await {
			Ok(payload) => payload,
			Err(err) => {
				tracing::warn!(%err, "task handling failed");
				return TaskResult {
					task_id: envelope.task_id,
					task_type,
					success: false,
					message: Some(err.to_string()),
					payload_json: serde_json::json!({}),
				};
			},
		};
		let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
		let message = payload.get("message").and_then(|v| v.as_str()).map(str::to_string);
		TaskResult {
			task_id: envelope.task_id,
			task_type,
			success,
			message,
			payload_json: payload,
		}
	}

	async fn dispatch(&self, task_type: TaskType, payload: serde_json::Value) -> Result<serde_json::Value, AgentError> {
		match task_type {
			TaskType::CheckPort => self.check_port(parse(payload)?).await,
			TaskType::RealmApiEnsure => self.realm_api_ensure(parse(payload)?).await,
			TaskType::RealmInstanceApply => self.realm_instance_apply(parse(payload)?).await,
			TaskType::RealmInstanceStatsGet => self.realm_instance_stats_get(parse(payload)?).await,
			TaskType::RealmInstanceConnectionsGet => self.realm_instance_connections_get(parse(payload)?).await,
			TaskType::RealmInstanceRouteGet => self.realm_instance_route_get(parse(payload)?).await,
			TaskType::TestConnectivity => self.test_connectivity(parse(payload)?).await,
		}
	}

	async fn check_port(&self, req: CheckPortRequest) -> Result<serde_json::Value, AgentError> {
		let candidates = komari_forward_core::portspec::parse(&req.spec).map_err(|err| AgentError::BadPayload(err.to_string()))?;
		let excluded: std::collections::HashSet<u16> = req.excluded_ports.into_iter().collect();
		for port in candidates {
			if excluded.contains(&port) {
				continue;
			}
			if port_is_free(port).await {
				return Ok(serde_json::to_value(CheckPortResponse {
					success: true,
					available_port: Some(port),
					message: "ok".into(),
				})
				.expect("CheckPortResponse always serializes"));
			}
		}
		Ok(serde_json::to_value(CheckPortResponse {
			success: false,
			available_port: None,
			message: format!("no free port available in spec {:?}", req.spec),
		})
		.expect("CheckPortResponse always serializes"))
	}

	async fn realm_api_ensure(&self, req: RealmApiEnsureRequest) -> Result<serde_json::Value, AgentError> {
		match self.supervisor.ensure(req.force_reinstall, req.binary_url.as_deref()).await {
			Ok(outcome) => Ok(serde_json::to_value(RealmApiEnsureResponse {
				success: true,
				pid: outcome.pid,
				port: outcome.port,
				realm_version: outcome.version,
				message: "ok".into(),
			})
			.expect("RealmApiEnsureResponse always serializes")),
			Err(err) => Ok(serde_json::to_value(RealmApiEnsureResponse {
				success: false,
				pid: 0,
				port: 0,
				realm_version: String::new(),
				message: err.to_string(),
			})
			.expect("RealmApiEnsureResponse always serializes")),
		}
	}

	async fn realm_instance_apply(&self, req: RealmInstanceApplyRequest) -> Result<serde_json::Value, AgentError> {
		let mut results = Vec::with_capacity(req.ops.len());
		for op in req.ops {
			let outcome = self.apply_one(&op.op, &op.instance_id, op.config.as_ref()).await;
			let (success, message) = match outcome {
				Ok(()) => (true, None),
				Err(err) => (false, Some(err.to_string())),
			};
			results.push(InstanceOpResult {
				op: op.op,
				instance_id: op.instance_id,
				success,
				message,
			});
		}
		let success = results.iter().all(|r| r.success);
		Ok(serde_json::to_value(RealmInstanceApplyResponse {
			success,
			message: if success { "ok".into() } else { "one or more instance ops failed".into() },
			results,
		})
		.expect("RealmInstanceApplyResponse always serializes"))
	}

	async fn apply_one(&self, op: &InstanceOp, instance_id: &str, config: Option<&serde_json::Value>) -> Result<(), AgentError> {
		match op {
			InstanceOp::Upsert => {
				let config = config.ok_or_else(|| AgentError::BadPayload("upsert op missing config".into()))?;
				let rewritten = rewrite_listen_host(config, self.listen_host);
				self.supervisor.upsert_instance(instance_id, &rewritten).await?;
				if let Some((rule_id, meta)) = meta_from_config(instance_id, &rewritten) {
					self.registry.upsert(instance_id, meta);
					let _ = rule_id;
				}
				Ok(())
			},
			InstanceOp::Start => {
				self.supervisor.start_instance(instance_id).await?;
				if let Some(meta) = self.registry.get(instance_id) {
					for proto in protos_for(&meta.protos) {
						self.firewall.open_port(meta.listen_port, proto).await;
					}
					self.stats_programmer.install(meta.rule_id, meta.listen_port, proto_str(&meta.protos), &meta.remotes).await.ok();
				}
				Ok(())
			},
			InstanceOp::Stop => {
				let stop_result = self.supervisor.stop_instance(instance_id).await;
				if let Some(meta) = self.registry.get(instance_id) {
					for proto in protos_for(&meta.protos) {
						self.firewall.close_port(meta.listen_port, proto).await;
					}
					self.stats_programmer.cleanup(meta.rule_id, meta.listen_port, proto_str(&meta.protos)).await;
				}
				stop_result.map_err(AgentError::from)
			},
			InstanceOp::Delete => {
				let result = self.supervisor.delete_instance(instance_id).await;
				self.registry.remove(instance_id);
				result.map_err(AgentError::from)
			},
		}
	}

	async fn realm_instance_stats_get(&self, req: RealmInstanceStatsGetRequest) -> Result<serde_json::Value, AgentError> {
		let mut stats_by_instance = BTreeMap::new();
		for instance_id in &req.instance_ids {
			if let Ok(stats) = self.supervisor.get_stats(instance_id).await {
				stats_by_instance.insert(instance_id.clone(), stats);
			}
		}
		Ok(serde_json::to_value(RealmInstanceStatsGetResponse {
			success: true,
			stats_by_instance,
			message: "ok".into(),
		})
		.expect("RealmInstanceStatsGetResponse always serializes"))
	}

	async fn realm_instance_connections_get(&self, req: RealmInstanceConnectionsGetRequest) -> Result<serde_json::Value, AgentError> {
		let protocol = req.protocol.map(|p| format!("{p:?}").to_lowercase());
		let data = self.supervisor.get_connections(&req.instance_id, protocol.as_deref(), req.limit, req.offset).await?;
		let total = data.get("total").and_then(|v| v.as_u64()).unwrap_or(0);
		let connections_json = data.get("connections").and_then(|v| v.as_array()).cloned().unwrap_or_default();
		Ok(serde_json::to_value(RealmInstanceConnectionsGetResponse {
			success: true,
			connections_json,
			total,
			message: "ok".into(),
		})
		.expect("RealmInstanceConnectionsGetResponse always serializes"))
	}

	async fn realm_instance_route_get(&self, req: RealmInstanceRouteGetRequest) -> Result<serde_json::Value, AgentError> {
		let route_json = self.supervisor.get_route(&req.instance_id).await?;
		Ok(serde_json::to_value(RealmInstanceRouteGetResponse {
			success: true,
			route_json,
			message: "ok".into(),
		})
		.expect("RealmInstanceRouteGetResponse always serializes"))
	}

	async fn test_connectivity(&self, req: TestConnectivityRequest) -> Result<serde_json::Value, AgentError> {
		let timeout = Duration::from_millis(req.timeout_ms) + Duration::from_secs(2);
		let start = tokio::time::Instant::now();
		let result = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((req.host.as_str(), req.port))).await;
		let response = match result {
			Ok(Ok(_)) => TestConnectivityResponse {
				success: true,
				reachable: true,
				latency_ms: Some(start.elapsed().as_millis() as u64),
				message: "ok".into(),
			},
			Ok(Err(err)) => TestConnectivityResponse {
				success: true,
				reachable: false,
				latency_ms: None,
				message: err.to_string(),
			},
			Err(_) => TestConnectivityResponse {
				success: true,
				reachable: false,
				latency_ms: None,
				message: "timed out".into(),
			},
		};
		Ok(serde_json::to_value(response).expect("TestConnectivityResponse always serializes"))
	}
}

fn parse<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, AgentError> {
	serde_json::from_value(payload).map_err(|err| AgentError::BadPayload(err.to_string()))
}

async fn port_is_free(port: u16) -> bool {
	tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok()
		&& tokio::net::TcpListener::bind(("::", port)).await.is_ok()
		&& tokio::net::UdpSocket::bind(("0.0.0.0", port)).await.is_ok()
		&& tokio::net::UdpSocket::bind(("::", port)).await.is_ok()
}

fn rewrite_listen_host(config: &serde_json::Value, host: &str) -> serde_json::Value {
	let mut config = config.clone();
	if let Some(listen) = config.get("listen").and_then(|v| v.as_str()).map(String::from) {
		if let serde_json::Value::Object(ref mut map) = config {
			map.insert("listen".into(), serde_json::json!(listen_host::rewrite_listen(&listen, host)));
		}
	}
	config
}

/// Pulls the fields the Firewall Manager / Stats Programmer need out of a
/// freshly upserted instance's config (rule_id is parsed from the instance
/// id, per the scheme in `core::model`).
fn meta_from_config(instance_id: &str, config: &serde_json::Value) -> Option<(u32, InstanceMeta)> {
	let rule_id = parse_rule_id(instance_id)?;
	let listen = config.get("listen")?.as_str()?.to_string();
	let listen_port: u16 = listen.rsplit_once(':')?.1.parse().ok()?;
	let remote = config.get("remote").and_then(|v| v.as_str()).unwrap_or_default();
	let extra_remotes: Vec<String> = config
		.get("extraRemotes")
		.and_then(|v| v.as_array())
		.map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
		.unwrap_or_default();
	let remotes = stats_programmer::parse_remotes(remote, &extra_remotes);
	let no_tcp = config.pointer("/network/noTcp").and_then(|v| v.as_bool()).unwrap_or(false);
	let use_udp = config.pointer("/network/useUdp").and_then(|v| v.as_bool()).unwrap_or(false);
	Some((
		rule_id,
		InstanceMeta {
			rule_id,
			listen,
			listen_port,
			remotes,
			protos: (no_tcp, use_udp),
		},
	))
}

fn parse_rule_id(instance_id: &str) -> Option<u32> {
	let rest = instance_id.strip_prefix("komari-r")?;
	let (digits, _) = rest.split_once('-')?;
	digits.parse().ok()
}

fn protos_for(protos: &(bool, bool)) -> Vec<Proto> {
	let (no_tcp, use_udp) = *protos;
	match (no_tcp, use_udp) {
		(true, _) => vec![Proto::Udp],
		(false, true) => vec![Proto::Tcp, Proto::Udp],
		(false, false) => vec![Proto::Tcp],
	}
}

fn proto_str(protos: &(bool, bool)) -> &'static str {
	let (no_tcp, use_udp) = *protos;
	match (no_tcp, use_udp) {
		(true, _) => "udp",
		_ if use_udp => "tcp",
		_ => "tcp",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_rule_id_from_entry_instance() {
		assert_eq!(parse_rule_id("komari-r7-nA-entry"), Some(7));
		assert_eq!(parse_rule_id("komari-r9-nB-relay-0"), Some(9));
	}

	#[test]
	fn rewrite_listen_host_replaces_host_keeps_port() {
		let config = serde_json::json!({"listen": "0.0.0.0:8080", "remote": "1.2.3.4:443"});
		let rewritten = rewrite_listen_host(&config, "::");
		assert_eq!(rewritten["listen"], "::8080");
	}

	#[test]
	fn meta_from_config_extracts_listen_port_and_remotes() {
		let config = serde_json::json!({
			"listen": "::8080",
			"remote": "1.2.3.4:443",
			"extraRemotes": ["5.6.7.8:443"],
		});
		let (rule_id, meta) = meta_from_config("komari-r3-nA-entry", &config).unwrap();
		assert_eq!(rule_id, 3);
		assert_eq!(meta.listen_port, 8080);
		assert_eq!(meta.remotes.len(), 2);
	}
}
