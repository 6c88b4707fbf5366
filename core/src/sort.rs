//! The one stable-sort rule the planner, apply-order builder, and the
//! priority/failover switcher all share (§3 Invariants): primary key
//! `sort_order` ascending, tie-break `node_id` lexicographic, final
//! tie-break original index.

use crate::model::{Hop, Relay};

pub fn stable_sort_relays(relays: &[Relay]) -> Vec<Relay> {
	let mut indexed: Vec<(usize, &Relay)> = relays.iter().enumerate().collect();
	indexed.sort_by(|(ia, a), (ib, b)| {
		a.sort_order
			.cmp(&b.sort_order)
			.then_with(|| a.node_id.cmp(&b.node_id))
			.then_with(|| ia.cmp(ib))
	});
	indexed.into_iter().map(|(_, r)| r.clone()).collect()
}

/// Hops have no `node_id` tie-break field at the hop level (a relay-group
/// hop has many), so ties break on original index only.
pub fn stable_sort_hops(hops: &[Hop]) -> Vec<Hop> {
	let mut indexed: Vec<(usize, &Hop)> = hops.iter().enumerate().collect();
	indexed.sort_by(|(ia, a), (ib, b)| a.sort_order.cmp(&b.sort_order).then_with(|| ia.cmp(ib)));
	indexed.into_iter().map(|(_, h)| h.clone()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Hop, HopKind};

	fn relay(node_id: &str, sort_order: i64) -> Relay {
		Relay {
			node_id: node_id.to_string(),
			port_spec: "7000".to_string(),
			current_port: 0,
			sort_order,
		}
	}

	#[test]
	fn stable_sort_is_stable_for_equal_keys() {
		let relays = vec![relay("B", 0), relay("B", 0), relay("A", 1)];
		let sorted = stable_sort_relays(&relays);
		// sort_order 0 group ties on node_id "B"=="B", so original index order
		// (0 before 1) must be preserved.
		assert_eq!(sorted[0].node_id, "B");
		assert_eq!(sorted[1].node_id, "B");
		assert_eq!(sorted[2].node_id, "A");
	}

	#[test]
	fn sort_order_beats_node_id() {
		let relays = vec![relay("Z", 1), relay("A", 0)];
		let sorted = stable_sort_relays(&relays);
		assert_eq!(sorted[0].node_id, "A");
		assert_eq!(sorted[1].node_id, "Z");
	}

	#[test]
	fn hops_sort_by_order_then_index() {
		let hops = vec![
			Hop {
				sort_order: 1,
				kind: HopKind::Direct {
					node_id: "H2".into(),
					port_spec: "6000".into(),
					current_port: 0,
				},
				network: None,
			},
			Hop {
				sort_order: 0,
				kind: HopKind::Direct {
					node_id: "H1".into(),
					port_spec: "5000".into(),
					current_port: 0,
				},
				network: None,
			},
		];
		let sorted = stable_sort_hops(&hops);
		let HopKind::Direct { node_id, .. } = &sorted[0].kind else {
			panic!()
		};
		assert_eq!(node_id, "H1");
	}
}
