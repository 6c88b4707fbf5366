//! The core-relevant subset of the controller REST surface (§6): enough of
//! `/api/v1/forwards/...` to drive the Apply Engine, Planner, Dispatcher,
//! and Alert Evaluator end to end. Everything else admin/auth/WebUI-side is
//! out of scope (§1) and lives elsewhere in a real deployment.

use crate::apply::ApplyEngine;
use crate::dispatcher::Dispatcher;
use crate::registry::NodeRegistry;
use crate::repository::{AlertRepository, HistoryRepository, InMemoryAlertRepository, InMemoryHistoryRepository, InMemoryRuleRepository, RuleRepository};
use crate::roles::RepositoryRoles;
use crate::stats::{NoopBroadcaster, StatsAggregator};
use crate::wsbus::{serve_agent_connection, WsBus};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use komari_forward_core::model::{AlertConfig, RuleConfig, RuleId};
use komari_forward_core::planner::plan;
use komari_forward_core::task::{CheckPortRequest, TaskType, TestConnectivityRequest};
use serde::Deserialize;
use std::sync::Arc;

pub type Stats = StatsAggregator<
	crate::repository::InMemoryStatsRepository,
	InMemoryHistoryRepository,
	InMemoryAlertRepository,
	NoopBroadcaster,
	RepositoryRoles<InMemoryRuleRepository>,
>;

#[derive(Clone)]
pub struct AppState {
	pub bus: Arc<WsBus>,
	pub dispatcher: Arc<Dispatcher<WsBus>>,
	pub apply_engine: Arc<ApplyEngine<WsBus, InMemoryRuleRepository>>,
	pub aggregator: Arc<Stats>,
	pub rules: Arc<InMemoryRuleRepository>,
	pub alerts: Arc<InMemoryAlertRepository>,
	pub history: Arc<InMemoryHistoryRepository>,
	pub registry: Arc<NodeRegistry>,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/ws/agent/:node_id", get(ws_handler))
		.route("/api/v1/forwards/:id/start", post(start_handler))
		.route("/api/v1/forwards/:id/stop", post(stop_handler))
		.route("/api/v1/forwards/:id/apply-configs", post(apply_configs_handler))
		.route("/api/v1/forwards/:id/instances", get(instances_handler))
		.route("/api/v1/forwards/:id/stats", get(stats_handler))
		.route("/api/v1/forwards/:id/topology", get(topology_handler))
		.route("/api/v1/forwards/check-port", post(check_port_handler))
		.route("/api/v1/forwards/test-connectivity", post(test_connectivity_handler))
		.route("/api/v1/forwards/:id/alert-config", get(get_alert_config_handler).post(set_alert_config_handler))
		.route("/api/v1/forwards/:id/alert-history", get(alert_history_handler))
		.with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, Path(node_id): Path<String>, State(state): State<AppState>) -> Response {
	ws.on_upgrade(move |socket| async move {
		serve_agent_connection(socket, node_id, state.bus.clone(), state.dispatcher.clone(), state.aggregator.clone(), state.apply_engine.clone()).await;
	})
}

fn map_apply_err(err: crate::error::ApplyError) -> (StatusCode, String) {
	(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
}

async fn start_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<StatusCode, (StatusCode, String)> {
	state.apply_engine.start(id).await.map_err(map_apply_err)?;
	Ok(StatusCode::OK)
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<StatusCode, (StatusCode, String)> {
	state.apply_engine.stop(id).await.map_err(map_apply_err)?;
	Ok(StatusCode::OK)
}

async fn apply_configs_handler(
	State(state): State<AppState>,
	Path(id): Path<RuleId>,
	Json(new_config): Json<RuleConfig>,
) -> Result<StatusCode, (StatusCode, String)> {
	state.apply_engine.hot_update(id, new_config).await.map_err(map_apply_err)?;
	Ok(StatusCode::OK)
}

async fn instances_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<Response, StatusCode> {
	let rule = state.rules.get(id).ok_or(StatusCode::NOT_FOUND)?;
	let planned = plan(rule.id, &rule.config, state.registry.as_ref()).map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
	Ok(Json(planned).into_response())
}

async fn stats_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Response {
	#[derive(serde::Serialize)]
	struct StatsResponse {
		overall_status: Option<komari_forward_core::model::LinkStatus>,
		nodes: Vec<komari_forward_core::model::ForwardStat>,
	}
	let nodes = state.aggregator.stats.node_stats(id);
	let overall_status = state.aggregator.rule_overall_status(id);
	Json(StatsResponse { overall_status, nodes }).into_response()
}

async fn topology_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<Response, StatusCode> {
	let rule = state.rules.get(id).ok_or(StatusCode::NOT_FOUND)?;
	let order = komari_forward_core::apply_order::build_apply_node_order(&rule.config);
	#[derive(serde::Serialize)]
	struct Topology {
		apply_order: Vec<String>,
		entry_node_id: String,
	}
	Ok(Json(Topology {
		apply_order: order,
		entry_node_id: rule.config.entry_node_id().clone(),
	})
	.into_response())
}

#[derive(Deserialize)]
struct CheckPortBody {
	node_id: String,
	spec: String,
	#[serde(default)]
	excluded_ports: Vec<u16>,
}

async fn check_port_handler(State(state): State<AppState>, Json(body): Json<CheckPortBody>) -> Result<Response, (StatusCode, String)> {
	let payload = serde_json::to_value(CheckPortRequest {
		spec: body.spec,
		excluded_ports: body.excluded_ports,
	})
	.expect("CheckPortRequest always serializes");
	let result = state
		.dispatcher
		.dispatch(&body.node_id, TaskType::CheckPort, payload)
		.await
		.map_err(|err| (StatusCode::GATEWAY_TIMEOUT, err.to_string()))?;
	Ok(Json(result.payload_json).into_response())
}

#[derive(Deserialize)]
struct TestConnectivityBody {
	node_id: String,
	host: String,
	port: u16,
	#[serde(default)]
	timeout_ms: Option<u64>,
}

async fn test_connectivity_handler(State(state): State<AppState>, Json(body): Json<TestConnectivityBody>) -> Result<Response, (StatusCode, String)> {
	let mut request = TestConnectivityRequest {
		host: body.host,
		port: body.port,
		timeout_ms: 5_000,
	};
	if let Some(ms) = body.timeout_ms {
		request.timeout_ms = ms;
	}
	let payload = serde_json::to_value(request).expect("TestConnectivityRequest always serializes");
	let result = state
		.dispatcher
		.dispatch(&body.node_id, TaskType::TestConnectivity, payload)
		.await
		.map_err(|err| (StatusCode::GATEWAY_TIMEOUT, err.to_string()))?;
	Ok(Json(result.payload_json).into_response())
}

async fn get_alert_config_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Result<Response, StatusCode> {
	state.alerts.config(id).map(|c| Json(c).into_response()).ok_or(StatusCode::NOT_FOUND)
}

async fn set_alert_config_handler(State(state): State<AppState>, Path(id): Path<RuleId>, Json(mut config): Json<AlertConfig>) -> StatusCode {
	config.rule_id = id;
	state.alerts.set_config(config);
	StatusCode::OK
}

async fn alert_history_handler(State(state): State<AppState>, Path(id): Path<RuleId>) -> Response {
	use komari_forward_core::model::AlertType;
	let types = [
		AlertType::NodeDown,
		AlertType::LinkDegraded,
		AlertType::LinkFaulty,
		AlertType::HighLatency,
		AlertType::TrafficSpike,
	];
	let rows: Vec<_> = types.iter().filter_map(|t| state.alerts.last_alert(id, *t)).collect();
	Json(rows).into_response()
}
