//! Firewall Manager (§4.7). Detects the host firewall once per process and
//! opens/closes ports with provenance tracking, so closing a port never
//! touches a rule this agent didn't install (§3 Ownership & lifecycle).
//!
//! Two provenance structures, not one (SPEC_FULL §2): a persisted
//! `FirewallState` for firewalld's `port/proto` set (atomic temp-file-then-
//! rename write) and a process-lifetime set for iptables rules installed
//! without a comment tag, because firewalld has no per-rule comment to key
//! off and untagged iptables rules have no other identifying mark.

use crate::error::FirewallError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
	Tcp,
	Udp,
}

impl Proto {
	fn as_str(self) -> &'static str {
		match self {
			Proto::Tcp => "tcp",
			Proto::Udp => "udp",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
	Firewalld,
	Ufw,
	Iptables,
	Nftables,
	None,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FirewallState {
	firewalld_added: HashSet<String>,
}

impl FirewallState {
	fn key(port: u16, proto: Proto) -> String {
		format!("{port}/{}", proto.as_str())
	}

	async fn load(path: &PathBuf) -> Self {
		match tokio::fs::read_to_string(path).await {
			Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
			Err(_) => Self::default(),
		}
	}

	async fn persist(&self, path: &PathBuf) -> Result<(), FirewallError> {
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(FirewallError::Persist)?;
		}
		let json = serde_json::to_string_pretty(self).expect("FirewallState always serializes");
		let tmp = path.with_extension("json.tmp");
		tokio::fs::write(&tmp, json).await.map_err(FirewallError::Persist)?;
		tokio::fs::rename(&tmp, path).await.map_err(FirewallError::Persist)
	}
}

fn comment_tag(port: u16, proto: Proto) -> String {
	format!("komari-forward:{port}:{}", proto.as_str())
}

pub struct FirewallManager {
	state_path: PathBuf,
	backend: Backend,
	state: Mutex<FirewallState>,
	untagged_iptables: Mutex<HashSet<(u16, Proto)>>,
}

impl FirewallManager {
	pub async fn detect(state_path: PathBuf) -> Self {
		let backend = detect_backend().await;
		tracing::info!(?backend, "detected firewall backend");
		let state = FirewallState::load(&state_path).await;
		Self {
			state_path,
			backend,
			state: Mutex::new(state),
			untagged_iptables: Mutex::new(HashSet::new()),
		}
	}

	pub fn backend(&self) -> Backend {
		self.backend
	}

	/// All shell invocations here are best-effort: failures are logged, not
	/// propagated as fatal to instance start (§4.7, §7).
	pub async fn open_port(&self, port: u16, proto: Proto) {
		let result = match self.backend {
			Backend::Firewalld => self.open_firewalld(port, proto).await,
			Backend::Ufw => self.open_ufw(port, proto).await,
			Backend::Iptables => self.open_iptables(port, proto).await,
			Backend::Nftables => self.open_nftables(port, proto).await,
			Backend::None => Ok(()),
		};
		if let Err(err) = result {
			tracing::warn!(port, ?proto, %err, "failed to open firewall port");
		}
	}

	pub async fn close_port(&self, port: u16, proto: Proto) {
		let result = match self.backend {
			Backend::Firewalld => self.close_firewalld(port, proto).await,
			Backend::Ufw => self.close_ufw(port, proto).await,
			Backend::Iptables => self.close_iptables(port, proto).await,
			Backend::Nftables => self.close_nftables(port, proto).await,
			Backend::None => Ok(()),
		};
		if let Err(err) = result {
			tracing::warn!(port, ?proto, %err, "failed to close firewall port (tolerated)");
		}
	}

	async fn open_firewalld(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let spec = format!("{port}/{}", proto.as_str());
		let query = run("firewall-cmd", &["--query-port", &spec]).await;
		if query.map(|s| s.success()).unwrap_or(false) {
			return Ok(());
		}
		run_checked("firewall-cmd", &["--add-port", &spec]).await?;
		let mut state = self.state.lock().await;
		state.firewalld_added.insert(FirewallState::key(port, proto));
		state.persist(&self.state_path).await
	}

	async fn close_firewalld(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let key = FirewallState::key(port, proto);
		let mut state = self.state.lock().await;
		if !state.firewalld_added.remove(&key) {
			return Ok(());
		}
		let spec = format!("{port}/{}", proto.as_str());
		run_checked("firewall-cmd", &["--remove-port", &spec]).await?;
		state.persist(&self.state_path).await
	}

	async fn open_ufw(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let tag = comment_tag(port, proto);
		let status = run("ufw", &["status"]).await.map_err(|err| FirewallError::Command(err.to_string()))?;
		let listing = if status.success() { read_output("ufw", &["status"]).await.unwrap_or_default() } else { String::new() };
		if listing.contains(&port.to_string()) && listing.contains(&tag) {
			return Ok(());
		}
		run_checked("ufw", &["allow", &format!("{port}/{}", proto.as_str()), "comment", &tag]).await
	}

	async fn close_ufw(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		run_checked("ufw", &["delete", "allow", &format!("{port}/{}", proto.as_str())]).await
	}

	async fn open_iptables(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let proto_s = proto.as_str();
		let existing = read_output("iptables", &["-S", "INPUT"]).await.unwrap_or_default();
		let already_open = existing
			.lines()
			.any(|line| line.contains("-j ACCEPT") && line.contains(&format!("--dport {port}")) && line.contains(proto_s));
		if already_open {
			return Ok(());
		}

		let tag = comment_tag(port, proto);
		let tagged = [
			"-I", "INPUT", "-p", proto_s, "--dport", &port.to_string(), "-m", "comment", "--comment", &tag, "-j", "ACCEPT",
		];
		if run_checked("iptables", &tagged).await.is_ok() {
			return Ok(());
		}

		tracing::debug!(port, ?proto, "iptables comment module unavailable, falling back to untagged rule");
		let untagged = ["-I", "INPUT", "-p", proto_s, "--dport", &port.to_string(), "-j", "ACCEPT"];
		run_checked("iptables", &untagged).await?;
		self.untagged_iptables.lock().await.insert((port, proto));
		Ok(())
	}

	async fn close_iptables(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let proto_s = proto.as_str();
		let tag = comment_tag(port, proto);
		let tagged = [
			"-D", "INPUT", "-p", proto_s, "--dport", &port.to_string(), "-m", "comment", "--comment", &tag, "-j", "ACCEPT",
		];
		let _ = run("iptables", &tagged).await;

		if self.untagged_iptables.lock().await.remove(&(port, proto)) {
			let untagged = ["-D", "INPUT", "-p", proto_s, "--dport", &port.to_string(), "-j", "ACCEPT"];
			let _ = run("iptables", &untagged).await;
		}
		Ok(())
	}

	async fn open_nftables(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let Some(chain) = discover_input_chain().await else {
			return Ok(());
		};
		let tag = comment_tag(port, proto);
		let rule = format!(
			"insert rule {} {} {} position 0 {} dport {port} counter accept comment \"{tag}\"",
			chain.family, chain.table, chain.chain, proto.as_str()
		);
		run_checked("nft", &rule.split_whitespace().collect::<Vec<_>>()).await
	}

	async fn close_nftables(&self, port: u16, proto: Proto) -> Result<(), FirewallError> {
		let tag = comment_tag(port, proto);
		let Ok(handles) = nft_handles_matching(&tag).await else {
			return Ok(());
		};
		for handle in handles {
			let _ = run("nft", &["delete", "rule", &handle.family, &handle.table, &handle.chain, "handle", &handle.handle]).await;
		}
		Ok(())
	}
}

async fn run(program: &str, args: &[&str]) -> Result<std::process::ExitStatus, FirewallError> {
	Command::new(program).args(args).stdout(std::process::Stdio::null()).stderr(std::process::Stdio::null()).status().await.map_err(|err| FirewallError::Command(err.to_string()))
}

async fn run_checked(program: &str, args: &[&str]) -> Result<(), FirewallError> {
	let status = run(program, args).await?;
	if status.success() {
		Ok(())
	} else {
		Err(FirewallError::Command(format!("{program} {args:?} exited with {status}")))
	}
}

async fn read_output(program: &str, args: &[&str]) -> Option<String> {
	let output = Command::new(program).args(args).output().await.ok()?;
	Some(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn detect_backend() -> Backend {
	if let Some(status) = run("firewall-cmd", &["--state"]).await.ok() {
		if status.success() {
			return Backend::Firewalld;
		}
	}
	if let Some(out) = read_output("ufw", &["status"]).await {
		if out.to_lowercase().contains("active") {
			return Backend::Ufw;
		}
	}
	if which("iptables").await {
		return Backend::Iptables;
	}
	if which("nft").await {
		return Backend::Nftables;
	}
	Backend::None
}

async fn which(bin: &str) -> bool {
	Command::new("which").arg(bin).stdout(std::process::Stdio::null()).stderr(std::process::Stdio::null()).status().await.map(|s| s.success()).unwrap_or(false)
}

pub(crate) struct NftChain {
	pub family: String,
	pub table: String,
	pub chain: String,
}

/// Preference order inet -> ip -> ip6 (§4.7/§4.8), first family exposing an
/// input-hooked chain wins.
pub(crate) async fn discover_input_chain() -> Option<NftChain> {
	for family in ["inet", "ip", "ip6"] {
		let Some(out) = read_output("nft", &["list", "tables", family]).await else { continue };
		for line in out.lines() {
			let Some(table) = line.split_whitespace().nth(1) else { continue };
			let Some(ruleset) = read_output("nft", &["list", "table", family, table]).await else { continue };
			if let Some(chain) = extract_hooked_chain(&ruleset, "input") {
				return Some(NftChain {
					family: family.to_string(),
					table: table.to_string(),
					chain,
				});
			}
		}
	}
	None
}

fn extract_hooked_chain(ruleset: &str, hook: &str) -> Option<String> {
	let mut current_chain: Option<&str> = None;
	for line in ruleset.lines() {
		let trimmed = line.trim();
		if let Some(rest) = trimmed.strip_prefix("chain ") {
			current_chain = rest.split_whitespace().next();
		}
		if trimmed.starts_with("type filter hook") && trimmed.contains(hook) {
			if let Some(name) = current_chain {
				return Some(name.to_string());
			}
		}
	}
	None
}

struct NftHandle {
	family: String,
	table: String,
	chain: String,
	handle: String,
}

async fn nft_handles_matching(tag: &str) -> Result<Vec<NftHandle>, FirewallError> {
	let mut out = Vec::new();
	for family in ["inet", "ip", "ip6"] {
		let Some(tables) = read_output("nft", &["-a", "list", "tables", family]).await else { continue };
		for line in tables.lines() {
			let Some(table) = line.split_whitespace().nth(1) else { continue };
			let Some(ruleset) = read_output("nft", &["-a", "list", "table", family, table]).await else { continue };
			let mut current_chain: Option<&str> = None;
			for rule_line in ruleset.lines() {
				let trimmed = rule_line.trim();
				if let Some(rest) = trimmed.strip_prefix("chain ") {
					current_chain = rest.split_whitespace().next();
				}
				if trimmed.contains(tag) {
					if let (Some(chain), Some(handle)) = (current_chain, trimmed.rsplit("handle ").next()) {
						out.push(NftHandle {
							family: family.to_string(),
							table: table.to_string(),
							chain: chain.to_string(),
							handle: handle.trim().to_string(),
						});
					}
				}
			}
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn comment_tag_embeds_port_and_proto() {
		assert_eq!(comment_tag(8080, Proto::Tcp), "komari-forward:8080:tcp");
	}

	#[test]
	fn extract_hooked_chain_finds_input_hook() {
		let ruleset = "table inet filter {\n\tchain input {\n\t\ttype filter hook input priority 0;\n\t}\n\tchain forward {\n\t\ttype filter hook forward priority 0;\n\t}\n}\n";
		assert_eq!(extract_hooked_chain(ruleset, "input"), Some("input".to_string()));
		assert_eq!(extract_hooked_chain(ruleset, "output"), None);
	}

	#[tokio::test]
	async fn firewall_state_round_trips_atomically() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("firewall_state.json");
		let mut state = FirewallState::default();
		state.firewalld_added.insert(FirewallState::key(8080, Proto::Tcp));
		state.persist(&path).await.unwrap();

		let loaded = FirewallState::load(&path).await;
		assert!(loaded.firewalld_added.contains("8080/tcp"));
	}
}
