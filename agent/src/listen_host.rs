//! Listen Host Selection (§4.13). Chosen once per agent process and used to
//! rewrite `listen = "<host>:<port>"` in any raw forwarder config before it
//! is sent to the daemon.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `::` for an IPv6-only or confirmed dual-stack host, `0.0.0.0` otherwise.
pub fn choose_listen_host() -> &'static str {
	let addrs = local_addresses();
	let has_global_v4 = addrs.iter().any(|a| matches!(a, IpAddr::V4(v4) if is_global_v4(*v4)));
	let has_global_v6 = addrs.iter().any(|a| matches!(a, IpAddr::V6(v6) if is_global_v6(*v6)));

	if has_global_v6 && !has_global_v4 {
		return "::";
	}
	if has_global_v6 && has_global_v4 && bindv6only_is_disabled() {
		return "::";
	}
	"0.0.0.0"
}

/// Rewrites `"host:port"` (or a bare `":port"`) with the chosen listen host,
/// leaving the port untouched.
pub fn rewrite_listen(raw: &str, host: &str) -> String {
	let port = raw.rsplit_once(':').map(|(_, p)| p).unwrap_or(raw);
	format!("{host}:{port}")
}

#[cfg(target_os = "linux")]
fn local_addresses() -> Vec<IpAddr> {
	use nix::sys::socket::SockaddrLike;

	match nix::ifaddrs::getifaddrs() {
		Ok(iter) => iter
			.filter_map(|ifaddr| {
				let addr = ifaddr.address?;
				if let Some(v4) = addr.as_sockaddr_in() {
					return Some(IpAddr::V4(Ipv4Addr::from(v4.ip())));
				}
				if let Some(v6) = addr.as_sockaddr_in6() {
					return Some(IpAddr::V6(v6.ip()));
				}
				None
			})
			.collect(),
		Err(err) => {
			tracing::warn!(%err, "getifaddrs failed, defaulting listen host selection to IPv4");
			Vec::new()
		},
	}
}

#[cfg(not(target_os = "linux"))]
fn local_addresses() -> Vec<IpAddr> {
	Vec::new()
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
	!ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local() && !ip.is_private() && !ip.is_broadcast() && !ip.is_documentation()
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
	const UNIQUE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0);
	let is_unique_local = (ip.segments()[0] & 0xfe00) == UNIQUE_LOCAL.segments()[0];
	let is_link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
	!ip.is_loopback() && !ip.is_unspecified() && !is_unique_local && !is_link_local && !ip.is_multicast()
}

#[cfg(target_os = "linux")]
fn bindv6only_is_disabled() -> bool {
	std::fs::read_to_string("/proc/sys/net/ipv6/bindv6only")
		.map(|s| s.trim() == "0")
		.unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn bindv6only_is_disabled() -> bool {
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn global_v4_excludes_private_and_loopback() {
		assert!(is_global_v4(Ipv4Addr::new(1, 2, 3, 4)));
		assert!(!is_global_v4(Ipv4Addr::new(10, 0, 0, 1)));
		assert!(!is_global_v4(Ipv4Addr::new(127, 0, 0, 1)));
		assert!(!is_global_v4(Ipv4Addr::new(169, 254, 1, 1)));
	}

	#[test]
	fn global_v6_excludes_unique_local_and_link_local() {
		assert!(is_global_v6(Ipv6Addr::new(0x2001, 0x4860, 0, 0, 0, 0, 0, 1)));
		assert!(!is_global_v6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)));
		assert!(!is_global_v6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)));
		assert!(!is_global_v6(Ipv6Addr::LOCALHOST));
	}

	#[test]
	fn rewrite_listen_keeps_port() {
		assert_eq!(rewrite_listen("0.0.0.0:8080", "::"), "::8080");
		assert_eq!(rewrite_listen("127.0.0.1:443", "0.0.0.0"), "0.0.0.0:443");
	}
}
