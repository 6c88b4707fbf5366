//! Agent process configuration (node id, controller endpoint, base dirs).
//! Mirrors the controller's small `serde`-deserialized `Config` (loaded from
//! YAML or overridden piecemeal by env vars via `clap`), plus the per-agent
//! base directory so tests can redirect persisted state under a tempdir.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub node_id: String,

	#[serde(default = "default_controller_url")]
	pub controller_url: String,

	/// `/var/lib/komari-agent` (§6 "Persisted agent files"). Tests redirect
	/// this under a tempdir.
	#[serde(default = "default_base_dir")]
	pub base_dir: PathBuf,

	/// `/var/log/komari-agent`.
	#[serde(default = "default_log_dir")]
	pub log_dir: PathBuf,

	#[serde(default = "default_daemon_port_range_start")]
	pub daemon_port_range_start: u16,
	#[serde(default = "default_daemon_port_range_end")]
	pub daemon_port_range_end: u16,

	#[serde(default = "default_health_probe_timeout_ms")]
	pub health_probe_timeout_ms: u64,
	#[serde(default = "default_health_probe_interval_ms")]
	pub health_probe_interval_ms: u64,
	#[serde(default = "default_spawn_attempts")]
	pub spawn_attempts: u32,

	#[serde(default = "default_stats_poll_secs", with = "duration_secs")]
	pub stats_poll_interval: Duration,

	/// Default `stats_interval` for the legacy Priority/Failover Switcher
	/// (§4.14) when a rule's `network` block doesn't override it.
	#[serde(default = "default_switcher_interval_secs", with = "duration_secs")]
	pub switcher_default_interval: Duration,
}

impl Config {
	pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(contents)
	}

	pub fn firewall_state_path(&self) -> PathBuf {
		self.base_dir.join("forward").join("firewall_state.json")
	}

	pub fn realm_api_log_path(&self) -> PathBuf {
		self.log_dir.join("realm-api.log")
	}

	pub fn rule_node_log_path(&self, rule_id: u32, node_id: &str) -> PathBuf {
		self.log_dir.join(format!("realm-rule-{rule_id}-node-{node_id}.log"))
	}

	pub fn realm_binary_candidates(&self) -> Vec<PathBuf> {
		vec![
			Path::new("/usr/local/bin/realm").to_path_buf(),
			Path::new("/usr/bin/realm").to_path_buf(),
		]
	}
}

fn default_controller_url() -> String {
	"ws://127.0.0.1:8090/ws".to_string()
}

fn default_base_dir() -> PathBuf {
	PathBuf::from("/var/lib/komari-agent")
}

fn default_log_dir() -> PathBuf {
	PathBuf::from("/var/log/komari-agent")
}

fn default_daemon_port_range_start() -> u16 {
	20_000
}

fn default_daemon_port_range_end() -> u16 {
	60_000
}

fn default_health_probe_timeout_ms() -> u64 {
	5_000
}

fn default_health_probe_interval_ms() -> u64 {
	150
}

fn default_spawn_attempts() -> u32 {
	10
}

fn default_stats_poll_secs() -> u64 {
	10
}

fn default_switcher_interval_secs() -> u64 {
	10
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
