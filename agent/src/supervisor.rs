//! Forwarder Supervisor (§4.6): binary resolution, single-slot daemon
//! lifecycle, and the HTTP client the Task Router drives the daemon
//! through. At most one forwarder daemon runs per agent at a time (§3
//! Invariants) — `generation` lets a superseded waiter recognize it is
//! stale and no-op instead of racing a fresher restart.

use crate::config::Config;
use crate::error::SupervisorError;
use rand::Rng;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone, Debug, Default)]
struct DaemonInfo {
	pid: u32,
	port: u16,
	version: String,
}

pub struct EnsureOutcome {
	pub pid: u32,
	pub port: u16,
	pub version: String,
}

pub struct ForwarderSupervisor {
	config: Arc<Config>,
	http: reqwest::Client,
	generation: AtomicU64,
	stopping: AtomicBool,
	info: AsyncMutex<Option<DaemonInfo>>,
}

impl ForwarderSupervisor {
	pub fn new(config: Arc<Config>) -> Self {
		let http = reqwest::Client::builder().timeout(Duration::from_secs(5)).build().expect("reqwest client builds with static config");
		Self {
			config,
			http,
			generation: AtomicU64::new(0),
			stopping: AtomicBool::new(false),
			info: AsyncMutex::new(None),
		}
	}

	pub fn request_stop(&self) {
		self.stopping.store(true, Ordering::SeqCst);
	}

	/// Builds a supervisor already pointed at a running daemon on `port`,
	/// skipping binary resolution and spawning. Lets integration tests drive
	/// the daemon HTTP client against a hand-rolled fake server.
	pub fn with_running_daemon_for_test(config: Arc<Config>, pid: u32, port: u16, version: &str) -> Self {
		let supervisor = Self::new(config);
		*supervisor.info.blocking_lock() = Some(DaemonInfo {
			pid,
			port,
			version: version.to_string(),
		});
		supervisor
	}

	async fn base_url(&self) -> Option<String> {
		self.info.lock().await.as_ref().map(|i| format!("http://127.0.0.1:{}", i.port))
	}

	/// `REALM_API_ENSURE` (§4.5/§4.6): install if missing, (re)start if not
	/// already healthy, health-probe, return `{pid, port, version}`.
	#[tracing::instrument(skip(self))]
	pub async fn ensure(self: &Arc<Self>, force_reinstall: bool, binary_url: Option<&str>) -> Result<EnsureOutcome, SupervisorError> {
		if !force_reinstall {
			if let Some(info) = self.info.lock().await.clone() {
				if self.probe_healthy(info.port).await {
					return Ok(EnsureOutcome {
						pid: info.pid,
						port: info.port,
						version: info.version,
					});
				}
			}
		}

		let binary_path = self.resolve_binary(force_reinstall, binary_url).await?;
		let version = self.capture_version(&binary_path).await;
		self.spawn_with_retry(binary_path, version).await
	}

	async fn resolve_binary(&self, force_reinstall: bool, binary_url: Option<&str>) -> Result<PathBuf, SupervisorError> {
		if !force_reinstall {
			for candidate in self.config.realm_binary_candidates() {
				if tokio::fs::metadata(&candidate).await.is_ok() {
					return Ok(candidate);
				}
			}
			if let Ok(path) = which_on_path("realm").await {
				return Ok(path);
			}
		}

		let install_path = self.config.realm_binary_candidates().into_iter().next().expect("at least one candidate path configured");
		let url = binary_url.map(str::to_string).unwrap_or_else(default_binary_url);
		self.download_atomic(&url, &install_path).await?;
		Ok(install_path)
	}

	async fn download_atomic(&self, url: &str, dest: &PathBuf) -> Result<(), SupervisorError> {
		tracing::info!(url, dest = %dest.display(), "downloading forwarder binary");
		let response = self.http.get(url).send().await.map_err(|err| SupervisorError::Download(err.to_string()))?;
		if !response.status().is_success() {
			return Err(SupervisorError::Download(format!("unexpected status {}", response.status())));
		}
		let bytes = response.bytes().await.map_err(|err| SupervisorError::Download(err.to_string()))?;

		if let Some(parent) = dest.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|err| SupervisorError::Download(err.to_string()))?;
		}
		let tmp = dest.with_extension("tmp");
		{
			let mut file = tokio::fs::File::create(&tmp).await.map_err(|err| SupervisorError::Download(err.to_string()))?;
			file.write_all(&bytes).await.map_err(|err| SupervisorError::Download(err.to_string()))?;
			file.flush().await.map_err(|err| SupervisorError::Download(err.to_string()))?;
		}
		set_exec_bit(&tmp).map_err(|err| SupervisorError::Download(err.to_string()))?;
		tokio::fs::rename(&tmp, dest).await.map_err(|err| SupervisorError::Download(err.to_string()))?;
		Ok(())
	}

	async fn capture_version(&self, binary_path: &PathBuf) -> String {
		match Command::new(binary_path).arg("--version").output().await {
			Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
			_ => "unknown".to_string(),
		}
	}

	/// Picks a free loopback port, spawns, health-probes; on failure kills
	/// and retries with a new port, up to `spawn_attempts` (default 10).
	async fn spawn_with_retry(self: &Arc<Self>, binary_path: PathBuf, version: String) -> Result<EnsureOutcome, SupervisorError> {
		let mut last_err = SupervisorError::NoFreePort;
		for attempt in 1..=self.config.spawn_attempts {
			let port = pick_free_loopback_port(self.config.daemon_port_range_start, self.config.daemon_port_range_end).await?;
			tracing::debug!(attempt, port, "spawning forwarder daemon");

			let log_file = open_append_log(&self.config.realm_api_log_path()).await;
			let mut command = Command::new(&binary_path);
			command.arg("--api").arg(format!("127.0.0.1:{port}"));
			if let Ok(file) = &log_file {
				command.stdout(Stdio::from(file.try_clone().expect("log file clone")));
				command.stderr(Stdio::from(file.try_clone().expect("log file clone")));
			} else {
				command.stdout(Stdio::null()).stderr(Stdio::null());
			}

			let mut child = match command.spawn() {
				Ok(child) => child,
				Err(err) => {
					last_err = SupervisorError::Spawn(err);
					continue;
				},
			};
			let pid = child.id().unwrap_or(0);

			if self.probe_healthy(port).await {
				let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
				*self.info.lock().await = Some(DaemonInfo { pid, port, version: version.clone() });
				self.spawn_exit_waiter(child, binary_path.clone(), version.clone(), generation);
				return Ok(EnsureOutcome { pid, port, version });
			}

			let _ = child.kill().await;
			last_err = SupervisorError::HealthTimeout(Duration::from_millis(self.config.health_probe_timeout_ms));
		}
		Err(last_err)
	}

	async fn probe_healthy(&self, port: u16) -> bool {
		let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.health_probe_timeout_ms);
		let interval = Duration::from_millis(self.config.health_probe_interval_ms);
		let url = format!("http://127.0.0.1:{port}/instances");
		while tokio::time::Instant::now() < deadline {
			if let Ok(resp) = self.http.get(&url).send().await {
				if resp.status().is_success() {
					return true;
				}
			}
			tokio::time::sleep(interval).await;
		}
		false
	}

	/// Observes the daemon's exit; if it wasn't an intentional stop and this
	/// is still the latest generation, restarts via the same sequence.
	/// Superseded waiters (an older generation) silently no-op (§4.6).
	fn spawn_exit_waiter(self: &Arc<Self>, mut child: tokio::process::Child, binary_path: PathBuf, version: String, generation: u64) {
		let this = self.clone();
		tokio::spawn(async move {
			let status = child.wait().await;
			tracing::warn!(?status, generation, "forwarder daemon exited");
			if this.stopping.load(Ordering::SeqCst) {
				return;
			}
			if this.generation.load(Ordering::SeqCst) != generation {
				return;
			}
			if let Err(err) = this.spawn_with_retry(binary_path, version).await {
				tracing::error!(%err, "forwarder daemon restart failed");
			}
		});
	}

	// --- daemon HTTP API (§4.6/§6) ---

	pub async fn upsert_instance(&self, instance_id: &str, config: &Value) -> Result<(), SupervisorError> {
		let base = self.base_url().await.ok_or(SupervisorError::Http("daemon not started".into()))?;
		let mut body = config.clone();
		if let Value::Object(ref mut map) = body {
			map.insert("id".into(), Value::String(instance_id.to_string()));
		}
		let resp = self.http.post(format!("{base}/instances")).json(&body).send().await.map_err(|err| SupervisorError::Http(err.to_string()))?;
		check_status(resp, &[200, 201]).await
	}

	pub async fn start_instance(&self, instance_id: &str) -> Result<(), SupervisorError> {
		let base = self.base_url().await.ok_or(SupervisorError::Http("daemon not started".into()))?;
		let resp = self
			.http
			.post(format!("{base}/instances/{instance_id}/start"))
			.send()
			.await
			.map_err(|err| SupervisorError::Http(err.to_string()))?;
		check_status(resp, &[200, 409]).await
	}

	pub async fn stop_instance(&self, instance_id: &str) -> Result<(), SupervisorError> {
		let base = self.base_url().await.ok_or(SupervisorError::Http("daemon not started".into()))?;
		let resp = self
			.http
			.post(format!("{base}/instances/{instance_id}/stop"))
			.send()
			.await
			.map_err(|err| SupervisorError::Http(err.to_string()))?;
		check_status(resp, &[200, 409]).await
	}

	pub async fn delete_instance(&self, instance_id: &str) -> Result<(), SupervisorError> {
		let base = self.base_url().await.ok_or(SupervisorError::Http("daemon not started".into()))?;
		let resp = self.http.delete(format!("{base}/instances/{instance_id}")).send().await.map_err(|err| SupervisorError::Http(err.to_string()))?;
		check_status(resp, &[204, 404]).await
	}

	pub async fn get_stats(&self, instance_id: &str) -> Result<Value, SupervisorError> {
		self.get_json(&format!("/instances/{instance_id}/stats")).await
	}

	pub async fn get_route(&self, instance_id: &str) -> Result<Value, SupervisorError> {
		self.get_json(&format!("/instances/{instance_id}/route")).await
	}

	pub async fn get_connections(&self, instance_id: &str, protocol: Option<&str>, limit: u32, offset: u32) -> Result<Value, SupervisorError> {
		let mut path = format!("/instances/{instance_id}/connections?limit={limit}&offset={offset}");
		if let Some(protocol) = protocol {
			path.push_str(&format!("&protocol={protocol}"));
		}
		self.get_json(&path).await
	}

	async fn get_json(&self, path: &str) -> Result<Value, SupervisorError> {
		let base = self.base_url().await.ok_or(SupervisorError::Http("daemon not started".into()))?;
		let resp = self.http.get(format!("{base}{path}")).send().await.map_err(|err| SupervisorError::Http(err.to_string()))?;
		if !resp.status().is_success() {
			return Err(daemon_error(resp).await);
		}
		resp.json().await.map_err(|err| SupervisorError::Http(err.to_string()))
	}
}

async fn check_status(resp: reqwest::Response, ok: &[u16]) -> Result<(), SupervisorError> {
	if ok.contains(&resp.status().as_u16()) {
		return Ok(());
	}
	Err(daemon_error(resp).await)
}

/// Parses the daemon's `{error:{code,message}}` body when present (§4.6
/// Failures), falling back to the raw status line.
async fn daemon_error(resp: reqwest::Response) -> SupervisorError {
	let status = resp.status();
	let text = resp.text().await.unwrap_or_default();
	if let Ok(value) = serde_json::from_str::<Value>(&text) {
		if let Some(err) = value.get("error") {
			let code = err.get("code").and_then(|v| v.as_str()).unwrap_or("");
			let message = err.get("message").and_then(|v| v.as_str()).unwrap_or("");
			return SupervisorError::Api(format!("{status} {code}: {message}"));
		}
	}
	SupervisorError::Api(format!("{status}: {text}"))
}

async fn which_on_path(bin: &str) -> Result<PathBuf, SupervisorError> {
	let path_var = std::env::var_os("PATH").ok_or(SupervisorError::BinaryMissing)?;
	for dir in std::env::split_paths(&path_var) {
		let candidate = dir.join(bin);
		if tokio::fs::metadata(&candidate).await.is_ok() {
			return Ok(candidate);
		}
	}
	Err(SupervisorError::BinaryMissing)
}

async fn pick_free_loopback_port(start: u16, end: u16) -> Result<u16, SupervisorError> {
	for _ in 0..50 {
		let port = rand::thread_rng().gen_range(start..end);
		if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
			return Ok(port);
		}
	}
	// Fallback: let the OS pick an ephemeral port.
	let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.map_err(|_| SupervisorError::NoFreePort)?;
	listener.local_addr().map(|addr| addr.port()).map_err(|_| SupervisorError::NoFreePort)
}

async fn open_append_log(path: &PathBuf) -> std::io::Result<std::fs::File> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await.ok();
	}
	std::fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
fn set_exec_bit(path: &PathBuf) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt;
	let mut perms = std::fs::metadata(path)?.permissions();
	perms.set_mode(0o755);
	std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_exec_bit(_path: &PathBuf) -> std::io::Result<()> {
	Ok(())
}

fn default_binary_url() -> String {
	let os = std::env::consts::OS;
	let arch = std::env::consts::ARCH;
	format!("https://example.invalid/realm/latest/realm-{os}-{arch}")
}
