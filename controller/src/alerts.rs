//! The Alert Evaluator (§4.12): per-rule toggled alert types, built from
//! incoming node stats, with dedup against the rule's own alert history and
//! a "cleared since last ack" bookkeeping store distinct from that history
//! (§9 Open Question / SPEC_FULL §2 — cleared timestamps are read on every
//! stat ingestion, so they get their own narrow repository method rather
//! than being derived from history rows each time).

use crate::history::recent_average_bytes;
use crate::repository::AlertRepository;
use chrono::{DateTime, Duration, Utc};
use komari_forward_core::model::{AlertConfig, AlertHistoryRow, AlertSeverity, AlertType, ForwardStat, ForwardTrafficHistory, LinkStatus, RuleId};

const DEDUP_WINDOW: Duration = Duration::minutes(5);
const ACK_SILENCE_WINDOW: Duration = Duration::hours(24);
const SPIKE_HISTORY_WINDOW: usize = 12;

/// One candidate raised by a single stat observation, before dedup.
struct Candidate {
	alert_type: AlertType,
	severity: AlertSeverity,
	message: String,
	details: serde_json::Value,
}

/// Evaluates one node's incoming stat against `config`, emitting zero or
/// more deduped alerts and updating the repository's alert history and
/// cleared-at bookkeeping. `is_entry` distinguishes entry-only alert types
/// (`link_degraded`/`link_faulty`/`traffic_spike`) from non-entry-only ones
/// (`node_down`); `high_latency` applies to any node role.
pub fn evaluate(repo: &dyn AlertRepository, config: &AlertConfig, stat: &ForwardStat, is_entry: bool, history: &[ForwardTrafficHistory], now: DateTime<Utc>) -> Vec<AlertHistoryRow> {
	let applicable = applicable_types(is_entry);
	let mut candidates = Vec::new();

	if is_entry && config.link_faulty && stat.link_status == LinkStatus::Faulty {
		candidates.push(Candidate {
			alert_type: AlertType::LinkFaulty,
			severity: AlertSeverity::Critical,
			message: format!("entry node {} is faulty", stat.node_id),
			details: serde_json::json!({ "link_status": "faulty" }),
		});
	} else if is_entry && config.link_degraded && stat.link_status == LinkStatus::Degraded {
		candidates.push(Candidate {
			alert_type: AlertType::LinkDegraded,
			severity: AlertSeverity::Warning,
			message: format!("entry node {} is degraded", stat.node_id),
			details: serde_json::json!({ "link_status": "degraded" }),
		});
	}

	if !is_entry && config.node_down && stat.link_status == LinkStatus::Faulty {
		candidates.push(Candidate {
			alert_type: AlertType::NodeDown,
			severity: AlertSeverity::Warning,
			message: format!("node {} is down", stat.node_id),
			details: serde_json::json!({ "link_status": "faulty" }),
		});
	}

	if config.high_latency {
		if let Some(latency) = node_latency(stat) {
			if latency >= config.high_latency_threshold_ms {
				candidates.push(Candidate {
					alert_type: AlertType::HighLatency,
					severity: AlertSeverity::Warning,
					message: format!("node {} latency {}ms >= threshold {}ms", stat.node_id, latency, config.high_latency_threshold_ms),
					details: serde_json::json!({ "latency_ms": latency }),
				});
			}
		}
	}

	if is_entry && config.traffic_spike {
		if let Some(current) = current_traffic_bytes(stat, history) {
			if let Some(avg) = recent_average_bytes(history, SPIKE_HISTORY_WINDOW) {
				if avg > 0.0 && current > avg * config.traffic_spike_factor {
					candidates.push(Candidate {
						alert_type: AlertType::TrafficSpike,
						severity: AlertSeverity::Warning,
						message: format!("traffic on rule {} spiked to {current:.0} (avg {avg:.0})", stat.rule_id),
						details: serde_json::json!({ "current": current, "average": avg, "factor": config.traffic_spike_factor }),
					});
				}
			}
		}
	}

	let raised: std::collections::HashSet<AlertType> = candidates.iter().map(|c| c.alert_type).collect();
	let mut emitted = Vec::new();
	for candidate in candidates {
		if let Some(row) = try_emit(repo, stat.rule_id, candidate, now) {
			emitted.push(row);
		}
	}

	// §4.12: "whenever an evaluation finds no candidate for a type that is
	// enabled for this node role, record cleared_at = now".
	for alert_type in applicable {
		if config_enables(config, alert_type) && !raised.contains(&alert_type) {
			repo.set_cleared_at(stat.rule_id, alert_type, now);
		}
	}

	emitted
}

fn applicable_types(is_entry: bool) -> Vec<AlertType> {
	let mut types = vec![AlertType::HighLatency];
	if is_entry {
		types.push(AlertType::LinkDegraded);
		types.push(AlertType::LinkFaulty);
		types.push(AlertType::TrafficSpike);
	} else {
		types.push(AlertType::NodeDown);
	}
	types
}

fn config_enables(config: &AlertConfig, alert_type: AlertType) -> bool {
	match alert_type {
		AlertType::NodeDown => config.node_down,
		AlertType::LinkDegraded => config.link_degraded,
		AlertType::LinkFaulty => config.link_faulty,
		AlertType::HighLatency => config.high_latency,
		AlertType::TrafficSpike => config.traffic_spike,
	}
}

/// `nodes_latency["self"]`, falling back to the first entry in iteration
/// order per §4.12 ("or first entry").
fn node_latency(stat: &ForwardStat) -> Option<u64> {
	stat.nodes_latency.get("self").copied().or_else(|| stat.nodes_latency.values().next().copied())
}

/// Current `bps_in + bps_out`, falling back to the latest history bucket's
/// byte total when the realtime figure is unavailable (both zero).
fn current_traffic_bytes(stat: &ForwardStat, history: &[ForwardTrafficHistory]) -> Option<f64> {
	let bps_total = stat.bps_in + stat.bps_out;
	if bps_total > 0 {
		return Some(bps_total as f64);
	}
	history.last().map(|row| (row.bytes_in + row.bytes_out) as f64)
}

/// Dedup (§4.12): suppress if the last alert of this `(rule_id, alert_type)`
/// fired under 5 minutes ago, or was acknowledged within the last 24h unless
/// a `cleared_at` after that ack proves the condition genuinely recovered
/// and re-fired.
fn try_emit(repo: &dyn AlertRepository, rule_id: RuleId, candidate: Candidate, now: DateTime<Utc>) -> Option<AlertHistoryRow> {
	if let Some(last) = repo.last_alert(rule_id, candidate.alert_type) {
		if now - last.created_at < DEDUP_WINDOW {
			return None;
		}
		if let Some(acked_at) = last.acknowledged_at {
			if now - acked_at < ACK_SILENCE_WINDOW {
				let cleared_after_ack = repo.cleared_at(rule_id, candidate.alert_type).is_some_and(|cleared| cleared > acked_at);
				if !cleared_after_ack {
					return None;
				}
			}
		}
	}

	let row = AlertHistoryRow {
		rule_id,
		alert_type: candidate.alert_type,
		severity: candidate.severity,
		message: candidate.message,
		details_json: candidate.details,
		created_at: now,
		acknowledged_at: None,
	};
	repo.record_alert(row.clone());
	Some(row)
}
