//! Priority/Failover Switcher (§4.14, legacy). Gated per-rule by
//! `network.legacy_switcher` (SPEC_FULL Open Question #1) — coexists with
//! the daemon's own `failover` balance rather than replacing it. Runs only
//! on the entry agent for a relay group using the `failover` strategy.

use komari_forward_core::model::Protocol;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct RelayCandidate {
	pub node_id: String,
	pub host: String,
	pub port: u16,
	pub sort_order: i64,
	pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchReason {
	PriorityFailover,
	PriorityFailback,
}

impl SwitchReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			SwitchReason::PriorityFailover => "priority_failover",
			SwitchReason::PriorityFailback => "priority_failback",
		}
	}
}

#[derive(Clone, Debug)]
pub struct SwitchDecision {
	pub active_node_id: String,
	pub reason: SwitchReason,
}

#[derive(Default)]
pub struct PriorityFailoverSwitcher {
	active: Mutex<HashMap<u32, (String, i64)>>,
}

impl PriorityFailoverSwitcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Probes every candidate's latency, picks the best healthy one by
	/// `sort_order`, and returns a decision only when it differs from the
	/// currently-active node for this rule (§4.14).
	pub async fn evaluate(&self, rule_id: u32, candidates: &[RelayCandidate]) -> Option<SwitchDecision> {
		let sorted = stable_sort_candidates(candidates);
		let mut best: Option<(&RelayCandidate, u64)> = None;
		for candidate in &sorted {
			if let Some(latency_ms) = probe_latency(candidate).await {
				best = Some((candidate, latency_ms));
				break;
			}
		}
		let (winner, _latency_ms) = best?;

		let mut active = self.active.lock();
		let previous = active.get(&rule_id).cloned();
		match previous {
			Some((ref node_id, _)) if *node_id == winner.node_id => None,
			Some((_, prev_sort_order)) => {
				let reason = if winner.sort_order > prev_sort_order { SwitchReason::PriorityFailover } else { SwitchReason::PriorityFailback };
				active.insert(rule_id, (winner.node_id.clone(), winner.sort_order));
				Some(SwitchDecision {
					active_node_id: winner.node_id.clone(),
					reason,
				})
			},
			None => {
				active.insert(rule_id, (winner.node_id.clone(), winner.sort_order));
				None
			},
		}
	}
}

fn stable_sort_candidates(candidates: &[RelayCandidate]) -> Vec<RelayCandidate> {
	let mut indexed: Vec<(usize, &RelayCandidate)> = candidates.iter().enumerate().collect();
	indexed.sort_by(|(ia, a), (ib, b)| a.sort_order.cmp(&b.sort_order).then_with(|| a.node_id.cmp(&b.node_id)).then_with(|| ia.cmp(ib)));
	indexed.into_iter().map(|(_, c)| c.clone()).collect()
}

/// TCP dial for `tcp`/`both`; UDP has no connection handshake to time, so a
/// bound-and-send probe is used as a best-effort reachability signal.
async fn probe_latency(candidate: &RelayCandidate) -> Option<u64> {
	let start = tokio::time::Instant::now();
	let addr = (candidate.host.as_str(), candidate.port);
	match candidate.protocol {
		Protocol::Udp => {
			let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
			tokio::time::timeout(PROBE_TIMEOUT, socket.connect(addr)).await.ok()?.ok()?;
			Some(start.elapsed().as_millis() as u64)
		},
		Protocol::Tcp | Protocol::Both => {
			tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await.ok()?.ok()?;
			Some(start.elapsed().as_millis() as u64)
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn candidate(node_id: &str, sort_order: i64) -> RelayCandidate {
		RelayCandidate {
			node_id: node_id.to_string(),
			host: "127.0.0.1".into(),
			port: 1,
			sort_order,
			protocol: Protocol::Tcp,
		}
	}

	#[test]
	fn stable_sort_orders_by_sort_order_then_node_id() {
		let candidates = vec![candidate("B", 1), candidate("A", 0)];
		let sorted = stable_sort_candidates(&candidates);
		assert_eq!(sorted[0].node_id, "A");
	}

	#[test]
	fn switch_reason_strings_match_spec() {
		assert_eq!(SwitchReason::PriorityFailover.as_str(), "priority_failover");
		assert_eq!(SwitchReason::PriorityFailback.as_str(), "priority_failback");
	}
}
