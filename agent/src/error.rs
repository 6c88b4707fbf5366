use thiserror::Error;

/// Errors from the Forwarder Supervisor (§4.6): binary resolution, daemon
/// lifecycle, and the realm-instance HTTP control surface.
#[derive(Error, Debug)]
pub enum SupervisorError {
	#[error("forwarder binary not found in PATH or well-known locations")]
	BinaryMissing,
	#[error("failed to download forwarder binary: {0}")]
	Download(String),
	#[error("failed to spawn forwarder daemon: {0}")]
	Spawn(#[source] std::io::Error),
	#[error("forwarder daemon did not become healthy within {0:?}")]
	HealthTimeout(std::time::Duration),
	#[error("no free port found for the forwarder daemon in 20000..=60000")]
	NoFreePort,
	#[error("realm API request failed: {0}")]
	Http(String),
	#[error("realm API returned an error: {0}")]
	Api(String),
}

/// Errors from the Firewall Manager (§4.7).
#[derive(Error, Debug)]
pub enum FirewallError {
	#[error("no supported firewall backend detected")]
	NoBackend,
	#[error("firewall command failed: {0}")]
	Command(String),
	#[error("failed to persist firewall state: {0}")]
	Persist(#[source] std::io::Error),
}

/// Errors from the Stats Programmer (§4.8).
#[derive(Error, Debug)]
pub enum StatsProgrammerError {
	#[error("no nftables family (inet/ip/ip6) exposes a usable chain")]
	NoChainFamily,
	#[error("counter command failed: {0}")]
	Command(String),
}

/// Errors surfaced back to the controller via `TaskResult::message` rather
/// than propagated — the Task Router always replies, never drops a task.
#[derive(Error, Debug)]
pub enum AgentError {
	#[error(transparent)]
	Supervisor(#[from] SupervisorError),
	#[error(transparent)]
	Firewall(#[from] FirewallError),
	#[error(transparent)]
	StatsProgrammer(#[from] StatsProgrammerError),
	#[error("unsupported task type for this agent")]
	UnsupportedTask,
	#[error("malformed task payload: {0}")]
	BadPayload(String),
}
