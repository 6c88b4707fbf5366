//! Port spec parsing (§4.1). A spec is one of a fixed port `"N"`, a comma
//! list `"a,b,c"`, or an inclusive range `"a-b"`.

use crate::CoreError;
use std::collections::BTreeSet;

const MAX_RANGE_WIDTH: u32 = 10_000;
const MIN_PORT: u32 = 1;
const MAX_PORT: u32 = 65_535;

/// Parses a port spec into a sorted, deduplicated, ascending set of valid
/// ports. Ranges wider than 10,000 ports are rejected.
pub fn parse(spec: &str) -> Result<BTreeSet<u16>, CoreError> {
	let spec = spec.trim();
	if spec.is_empty() {
		return Err(CoreError::InvalidConfig("empty port spec".into()));
	}

	if let Some((lo, hi)) = spec.split_once('-') {
		let lo = parse_port_num(lo, spec)?;
		let hi = parse_port_num(hi, spec)?;
		if hi < lo {
			return Err(CoreError::InvalidConfig(format!(
				"port range {spec:?} has high < low"
			)));
		}
		let width = hi - lo + 1;
		if width > MAX_RANGE_WIDTH {
			return Err(CoreError::InvalidConfig(format!(
				"port range {spec:?} spans {width} ports, exceeding the {MAX_RANGE_WIDTH}-port cap"
			)));
		}
		return Ok((lo..=hi).map(|p| p as u16).collect());
	}

	if spec.contains(',') {
		let mut out = BTreeSet::new();
		for part in spec.split(',') {
			out.insert(parse_port_num(part, spec)? as u16);
		}
		return Ok(out);
	}

	let port = parse_port_num(spec, spec)?;
	Ok(BTreeSet::from([port as u16]))
}

fn parse_port_num(raw: &str, whole_spec: &str) -> Result<u32, CoreError> {
	let raw = raw.trim();
	let n: u32 = raw
		.parse()
		.map_err(|_| CoreError::InvalidConfig(format!("invalid port {raw:?} in spec {whole_spec:?}")))?;
	if !(MIN_PORT..=MAX_PORT).contains(&n) {
		return Err(CoreError::InvalidConfig(format!(
			"port {n} in spec {whole_spec:?} is out of range [{MIN_PORT},{MAX_PORT}]"
		)));
	}
	Ok(n)
}

/// `ResolvePortFallback` (§4.1): if `current` is already allocated it is
/// runtime-authoritative; otherwise a single fixed-port spec can be assumed,
/// and anything wider (list/range) returns 0 — callers must not guess.
pub fn resolve_port_fallback(spec: &str, current: u16) -> u16 {
	if current > 0 {
		return current;
	}
	if let Ok(ports) = parse(spec) {
		if ports.len() == 1 {
			return *ports.iter().next().unwrap();
		}
	}
	0
}
