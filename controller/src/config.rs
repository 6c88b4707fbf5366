//! Controller process configuration. A small `serde`-deserialized struct
//! loaded from a YAML file (or overridden piecemeal by env vars through
//! `clap`), mirroring the teacher's own flattened config + `clap::Parser`
//! split between "what's in the file" and "what the operator passed on the
//! command line".

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	#[serde(default = "default_bind_addr")]
	pub bind_addr: String,

	/// How often the Instance Stats Reporter's server-side counterpart polls
	/// for connection freshness and the Priority/Failover Switcher's default
	/// `stats_interval` when a rule doesn't override it (§4.14).
	#[serde(default = "default_stats_interval_secs", with = "duration_secs")]
	pub stats_interval: Duration,

	/// Minimum spacing between daily-maintenance probe ticks (§5 "daily
	/// maintenance (>= 30 min probe)"). The guard itself is idempotent per
	/// UTC date, so a shorter probe interval is harmless, merely wasteful.
	#[serde(default = "default_maintenance_probe_secs", with = "duration_secs")]
	pub maintenance_probe_interval: Duration,

	/// Seconds an instance stat row may age before that instance is
	/// considered unhealthy for link-status purposes (§4.10/§7).
	#[serde(default = "default_stat_freshness_secs")]
	pub stat_freshness_secs: i64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind_addr: default_bind_addr(),
			stats_interval: Duration::from_secs(default_stats_interval_secs()),
			maintenance_probe_interval: Duration::from_secs(default_maintenance_probe_secs()),
			stat_freshness_secs: default_stat_freshness_secs(),
		}
	}
}

impl Config {
	pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(contents)
	}
}

fn default_bind_addr() -> String {
	"0.0.0.0:8090".to_string()
}

fn default_stats_interval_secs() -> u64 {
	10
}

fn default_maintenance_probe_secs() -> u64 {
	1_800
}

fn default_stat_freshness_secs() -> i64 {
	60
}

mod duration_secs {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec_values() {
		let cfg = Config::default();
		assert_eq!(cfg.stats_interval, Duration::from_secs(10));
		assert_eq!(cfg.stat_freshness_secs, 60);
	}

	#[test]
	fn parses_partial_yaml_with_defaults() {
		let cfg = Config::from_yaml("bindAddr: \"127.0.0.1:9000\"\n").unwrap();
		assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
		assert_eq!(cfg.stats_interval, Duration::from_secs(10));
	}
}
