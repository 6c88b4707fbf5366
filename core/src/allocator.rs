//! The pure half of the Port Allocator (§4.1): given a spec, a current pick,
//! and the ports already spoken for, decide whether the current pick can be
//! kept or whether an agent probe is required. The actual `CheckPort`
//! dispatch is an I/O operation and lives in the controller crate, which
//! drives this decision function from its `EnsureCurrentPorts` workflow.

use crate::portspec;
use crate::CoreError;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortDecision {
	/// The existing `current_port` is acceptable as-is.
	Keep(u16),
	/// An agent-side `CheckPort` probe is required, excluding these ports.
	Probe { spec: String, excluded: BTreeSet<u16> },
}

/// Step 1 of `EnsureCurrentPorts`: is the existing pick still good?
/// `reserved` is the union of every other rule's ports on this node, plus
/// every port already claimed earlier in this planning run.
pub fn decide_port(spec: &str, current: u16, reserved: &BTreeSet<u16>) -> Result<PortDecision, CoreError> {
	let spec_ports = portspec::parse(spec)?;
	if current > 0 && spec_ports.contains(&current) && !reserved.contains(&current) {
		return Ok(PortDecision::Keep(current));
	}
	let mut excluded = reserved.clone();
	if current > 0 {
		excluded.insert(current);
	}
	Ok(PortDecision::Probe {
		spec: spec.to_string(),
		excluded,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keeps_current_when_in_spec_and_unreserved() {
		let decision = decide_port("8000-9000", 8421, &BTreeSet::new()).unwrap();
		assert_eq!(decision, PortDecision::Keep(8421));
	}

	#[test]
	fn probes_when_current_is_reserved() {
		let reserved = BTreeSet::from([8421]);
		let decision = decide_port("8000-9000", 8421, &reserved).unwrap();
		match decision {
			PortDecision::Probe { excluded, .. } => assert!(excluded.contains(&8421)),
			_ => panic!("expected probe"),
		}
	}

	#[test]
	fn probes_when_no_current_pick() {
		let decision = decide_port("8000-9000", 0, &BTreeSet::new()).unwrap();
		assert!(matches!(decision, PortDecision::Probe { .. }));
	}
}
