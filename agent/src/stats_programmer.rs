//! Stats Programmer (§4.8): OS-level counter rules for per-instance byte
//! accounting, keyed by `(rule_id, listen_port, direction)`. The chains only
//! count and `RETURN` — they never change firewall disposition.

use crate::error::StatsProgrammerError;
use crate::firewall::discover_input_chain;
use regex::Regex;
use tokio::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
	Nftables,
	Iptables,
	None,
}

pub struct StatsProgrammer {
	backend: Backend,
	has_ip6tables: bool,
}

fn chain_name(rule_id: u32, listen_port: u16, direction: &str) -> String {
	format!("KF_{rule_id:08x}_{listen_port:04x}_{direction}")
}

impl StatsProgrammer {
	pub async fn detect() -> Self {
		let backend = if discover_input_output_chain().await.is_some() {
			Backend::Nftables
		} else if which("iptables").await {
			Backend::Iptables
		} else {
			Backend::None
		};
		let has_ip6tables = which("ip6tables").await;
		tracing::info!(?backend, has_ip6tables, "detected stats counter backend");
		Self { backend, has_ip6tables }
	}

	/// Installs the IN/OUT stats chains and their jump rules for one
	/// instance. `remotes` is the instance's parsed outbound targets
	/// (remote + extra_remotes); when none parse, the OUT rule falls back to
	/// matching on `sport = listen_port` (§4.8).
	pub async fn install(&self, rule_id: u32, listen_port: u16, proto: &str, remotes: &[(String, u16)]) -> Result<(), StatsProgrammerError> {
		match self.backend {
			Backend::Nftables => self.install_nft(rule_id, listen_port, proto, remotes).await,
			Backend::Iptables => {
				self.install_iptables("iptables", rule_id, listen_port, proto, remotes).await?;
				if self.has_ip6tables {
					self.install_iptables("ip6tables", rule_id, listen_port, proto, remotes).await?;
				}
				Ok(())
			},
			Backend::None => Ok(()),
		}
	}

	pub async fn cleanup(&self, rule_id: u32, listen_port: u16, proto: &str) {
		match self.backend {
			Backend::Nftables => self.cleanup_nft(rule_id, listen_port, proto).await,
			Backend::Iptables => {
				self.cleanup_iptables("iptables", rule_id, listen_port, proto).await;
				if self.has_ip6tables {
					self.cleanup_iptables("ip6tables", rule_id, listen_port, proto).await;
				}
			},
			Backend::None => {},
		}
	}

	/// Sums `counter` packets/bytes from the IN and OUT chains.
	pub async fn read_counters(&self, rule_id: u32, listen_port: u16) -> (u64, u64) {
		match self.backend {
			Backend::Nftables => self.read_counters_nft(rule_id, listen_port).await,
			Backend::Iptables => self.read_counters_iptables(rule_id, listen_port).await,
			Backend::None => (0, 0),
		}
	}

	async fn install_nft(&self, rule_id: u32, listen_port: u16, proto: &str, remotes: &[(String, u16)]) -> Result<(), StatsProgrammerError> {
		let Some(chain) = discover_input_output_chain().await else {
			return Ok(());
		};
		let in_chain = chain_name(rule_id, listen_port, "IN");
		let out_chain = chain_name(rule_id, listen_port, "OUT");

		nft_checked(&["add", "chain", &chain.family, &chain.table, &in_chain]).await?;
		nft_checked(&["add", "rule", &chain.family, &chain.table, &in_chain, "counter", "return"]).await?;
		nft_checked(&["add", "chain", &chain.family, &chain.table, &out_chain]).await?;
		nft_checked(&["add", "rule", &chain.family, &chain.table, &out_chain, "counter", "return"]).await?;

		nft_checked(&[
			"insert", "rule", &chain.family, &chain.table, &chain.input, "position", "0", proto, "dport", &listen_port.to_string(), "jump", &in_chain,
		])
		.await?;

		if remotes.is_empty() {
			nft_checked(&["insert", "rule", &chain.family, &chain.table, &chain.output, "position", "0", proto, "sport", &listen_port.to_string(), "jump", &out_chain]).await?;
		} else {
			for (host, port) in remotes {
				nft_checked(&[
					"insert", "rule", &chain.family, &chain.table, &chain.output, "position", "0", proto, "daddr", host, proto, "dport", &port.to_string(), "jump", &out_chain,
				])
				.await?;
			}
		}
		Ok(())
	}

	async fn cleanup_nft(&self, rule_id: u32, listen_port: u16, _proto: &str) {
		let Some(chain) = discover_input_output_chain().await else { return };
		let in_chain = chain_name(rule_id, listen_port, "IN");
		let out_chain = chain_name(rule_id, listen_port, "OUT");
		for target_chain in [&chain.input, &chain.output] {
			if let Some(handles) = nft_rule_handles_jumping_to(&chain.family, &chain.table, target_chain, &in_chain).await {
				for handle in handles {
					let _ = Command::new("nft").args(["delete", "rule", &chain.family, &chain.table, target_chain, "handle", &handle]).status().await;
				}
			}
			if let Some(handles) = nft_rule_handles_jumping_to(&chain.family, &chain.table, target_chain, &out_chain).await {
				for handle in handles {
					let _ = Command::new("nft").args(["delete", "rule", &chain.family, &chain.table, target_chain, "handle", &handle]).status().await;
				}
			}
		}
		let _ = Command::new("nft").args(["flush", "chain", &chain.family, &chain.table, &in_chain]).status().await;
		let _ = Command::new("nft").args(["delete", "chain", &chain.family, &chain.table, &in_chain]).status().await;
		let _ = Command::new("nft").args(["flush", "chain", &chain.family, &chain.table, &out_chain]).status().await;
		let _ = Command::new("nft").args(["delete", "chain", &chain.family, &chain.table, &out_chain]).status().await;
	}

	async fn read_counters_nft(&self, rule_id: u32, listen_port: u16) -> (u64, u64) {
		let Some(chain) = discover_input_output_chain().await else { return (0, 0) };
		let in_bytes = sum_nft_chain_bytes(&chain.family, &chain.table, &chain_name(rule_id, listen_port, "IN")).await;
		let out_bytes = sum_nft_chain_bytes(&chain.family, &chain.table, &chain_name(rule_id, listen_port, "OUT")).await;
		(in_bytes, out_bytes)
	}

	async fn install_iptables(&self, binary: &str, rule_id: u32, listen_port: u16, proto: &str, remotes: &[(String, u16)]) -> Result<(), StatsProgrammerError> {
		let in_chain = chain_name(rule_id, listen_port, "IN");
		let out_chain = chain_name(rule_id, listen_port, "OUT");

		let _ = Command::new(binary).args(["-N", &in_chain]).status().await;
		ipt_checked(binary, &["-A", &in_chain, "-j", "RETURN"]).await?;
		let _ = Command::new(binary).args(["-N", &out_chain]).status().await;
		ipt_checked(binary, &["-A", &out_chain, "-j", "RETURN"]).await?;

		ipt_checked(binary, &["-I", "INPUT", "1", "-p", proto, "--dport", &listen_port.to_string(), "-j", &in_chain]).await?;

		if remotes.is_empty() {
			ipt_checked(binary, &["-I", "OUTPUT", "1", "-p", proto, "--sport", &listen_port.to_string(), "-j", &out_chain]).await?;
		} else {
			for (host, port) in remotes {
				ipt_checked(binary, &["-I", "OUTPUT", "1", "-p", proto, "-d", host, "--dport", &port.to_string(), "-j", &out_chain]).await?;
			}
		}
		Ok(())
	}

	async fn cleanup_iptables(&self, binary: &str, rule_id: u32, listen_port: u16, proto: &str) {
		let in_chain = chain_name(rule_id, listen_port, "IN");
		let out_chain = chain_name(rule_id, listen_port, "OUT");
		let _ = Command::new(binary).args(["-D", "INPUT", "-p", proto, "--dport", &listen_port.to_string(), "-j", &in_chain]).status().await;
		if let Some(rules) = read_output(binary, &["-S", "OUTPUT"]).await {
			for line in rules.lines().filter(|l| l.contains(&out_chain)) {
				let delete_line = line.replacen("-A", "-D", 1);
				let args: Vec<&str> = delete_line.split_whitespace().collect();
				let _ = Command::new(binary).args(&args).status().await;
			}
		}
		let _ = Command::new(binary).args(["-F", &in_chain]).status().await;
		let _ = Command::new(binary).args(["-X", &in_chain]).status().await;
		let _ = Command::new(binary).args(["-F", &out_chain]).status().await;
		let _ = Command::new(binary).args(["-X", &out_chain]).status().await;
	}

	async fn read_counters_iptables(&self, rule_id: u32, listen_port: u16) -> (u64, u64) {
		let in_bytes = sum_iptables_chain_bytes("iptables", &chain_name(rule_id, listen_port, "IN")).await;
		let out_bytes = sum_iptables_chain_bytes("iptables", &chain_name(rule_id, listen_port, "OUT")).await;
		if self.has_ip6tables {
			let in6 = sum_iptables_chain_bytes("ip6tables", &chain_name(rule_id, listen_port, "IN")).await;
			let out6 = sum_iptables_chain_bytes("ip6tables", &chain_name(rule_id, listen_port, "OUT")).await;
			return (in_bytes + in6, out_bytes + out6);
		}
		(in_bytes, out_bytes)
	}
}

struct NftIoChain {
	family: String,
	table: String,
	input: String,
	output: String,
}

/// Prefers a family whose table exposes both input and output hooks (§4.8).
async fn discover_input_output_chain() -> Option<NftIoChain> {
	let input = discover_input_chain().await?;
	let ruleset = read_output("nft", &["list", "table", &input.family, &input.table]).await?;
	super_extract_output(&ruleset).map(|output| NftIoChain {
		family: input.family,
		table: input.table,
		input: input.chain,
		output,
	})
}

fn super_extract_output(ruleset: &str) -> Option<String> {
	let mut current_chain: Option<&str> = None;
	for line in ruleset.lines() {
		let trimmed = line.trim();
		if let Some(rest) = trimmed.strip_prefix("chain ") {
			current_chain = rest.split_whitespace().next();
		}
		if trimmed.starts_with("type filter hook output") {
			return current_chain.map(|s| s.to_string());
		}
	}
	None
}

async fn nft_checked(args: &[&str]) -> Result<(), StatsProgrammerError> {
	let status = Command::new("nft").args(args).status().await.map_err(|err| StatsProgrammerError::Command(err.to_string()))?;
	if status.success() {
		Ok(())
	} else {
		Err(StatsProgrammerError::Command(format!("nft {args:?} exited with {status}")))
	}
}

async fn ipt_checked(binary: &str, args: &[&str]) -> Result<(), StatsProgrammerError> {
	let status = Command::new(binary).args(args).status().await.map_err(|err| StatsProgrammerError::Command(err.to_string()))?;
	if status.success() {
		Ok(())
	} else {
		Err(StatsProgrammerError::Command(format!("{binary} {args:?} exited with {status}")))
	}
}

async fn nft_rule_handles_jumping_to(family: &str, table: &str, chain: &str, target: &str) -> Option<Vec<String>> {
	let ruleset = read_output("nft", &["-a", "list", "chain", family, table, chain]).await?;
	Some(
		ruleset
			.lines()
			.filter(|line| line.contains(&format!("jump {target}")))
			.filter_map(|line| line.rsplit("handle ").next())
			.map(|s| s.trim().to_string())
			.collect(),
	)
}

async fn sum_nft_chain_bytes(family: &str, table: &str, chain: &str) -> u64 {
	let Some(ruleset) = read_output("nft", &["list", "chain", family, table, chain]).await else { return 0 };
	let re = Regex::new(r"bytes (\d+)").expect("static regex compiles");
	re.captures_iter(&ruleset).filter_map(|c| c[1].parse::<u64>().ok()).sum()
}

async fn sum_iptables_chain_bytes(binary: &str, chain: &str) -> u64 {
	let Some(out) = read_output(binary, &["-L", chain, "-n", "-v", "-x"]).await else { return 0 };
	let re = Regex::new(r"^\s*\d+\s+(\d+)\s").expect("static regex compiles");
	out.lines().filter_map(|line| re.captures(line)).filter_map(|c| c[1].parse::<u64>().ok()).sum()
}

async fn read_output(program: &str, args: &[&str]) -> Option<String> {
	let output = Command::new(program).args(args).output().await.ok()?;
	if !output.status.success() {
		return None;
	}
	Some(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn which(bin: &str) -> bool {
	Command::new("which").arg(bin).stdout(std::process::Stdio::null()).stderr(std::process::Stdio::null()).status().await.map(|s| s.success()).unwrap_or(false)
}

/// Parses `"host:port"` pairs out of an instance's `remote`/`extra_remotes`
/// for the OUT jump rule's `daddr`/`dport` match; unparseable entries are
/// simply skipped (§4.8 falls back to `sport` when none parse).
pub fn parse_remotes(remote: &str, extra_remotes: &[String]) -> Vec<(String, u16)> {
	std::iter::once(remote)
		.chain(extra_remotes.iter().map(String::as_str))
		.filter_map(|addr| {
			let (host, port) = addr.rsplit_once(':')?;
			let port: u16 = port.parse().ok()?;
			Some((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chain_name_is_hex_and_bounded() {
		assert_eq!(chain_name(7, 8080, "IN"), "KF_00000007_1f90_IN");
	}

	#[test]
	fn parse_remotes_skips_unparseable_entries() {
		let parsed = parse_remotes("1.2.3.4:443", &["not-an-addr".to_string(), "5.6.7.8:22".to_string()]);
		assert_eq!(parsed, vec![("1.2.3.4".to_string(), 443), ("5.6.7.8".to_string(), 22)]);
	}

	#[test]
	fn parse_remotes_empty_when_nothing_parses() {
		assert!(parse_remotes("garbage", &[]).is_empty());
	}
}
