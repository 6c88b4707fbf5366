use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use komari_forward_agent::bus;
use komari_forward_agent::config::Config;
use komari_forward_agent::firewall::FirewallManager;
use komari_forward_agent::listen_host::choose_listen_host;
use komari_forward_agent::registry::InstanceRegistry;
use komari_forward_agent::reporter::InstanceReporter;
use komari_forward_agent::router::TaskRouter;
use komari_forward_agent::stats_programmer::StatsProgrammer;
use komari_forward_agent::supervisor::ForwarderSupervisor;
use tracing::info;

/// CLI flags layered over the file config, mirroring the controller's own
/// `--file`/env-driven `clap::Parser` plus `KOMARI_FORWARD_*` env fallback.
#[derive(Parser, Debug)]
#[command(about = "komari-forward agent: forwarder supervisor, firewall/stats programming, task router")]
struct Args {
	#[arg(short, long, env = "KOMARI_FORWARD_CONFIG")]
	file: Option<PathBuf>,

	#[arg(long, env = "KOMARI_FORWARD_NODE_ID")]
	node_id: Option<String>,

	#[arg(long, env = "KOMARI_FORWARD_CONTROLLER_URL")]
	controller_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

	let args = Args::parse();
	let mut config = match &args.file {
		Some(path) => {
			let contents = std::fs::read_to_string(path)?;
			Config::from_yaml(&contents)?
		},
		None => Config::from_yaml("nodeId: \"unset\"\n")?,
	};
	if let Some(node_id) = args.node_id {
		config.node_id = node_id;
	}
	if let Some(controller_url) = args.controller_url {
		config.controller_url = controller_url;
	}
	let config = Arc::new(config);

	let listen_host = choose_listen_host();
	info!(node_id = %config.node_id, controller_url = %config.controller_url, listen_host, "starting komari-forward agent");

	let supervisor = Arc::new(ForwarderSupervisor::new(config.clone()));
	let firewall = Arc::new(FirewallManager::detect(config.firewall_state_path()).await);
	let stats_programmer = Arc::new(StatsProgrammer::detect().await);
	let registry = Arc::new(InstanceRegistry::new());

	let router = Arc::new(TaskRouter {
		supervisor: supervisor.clone(),
		firewall,
		stats_programmer,
		registry: registry.clone(),
		listen_host,
	});

	let (outbound_tx, outbound_rx) = bus::channel();
	let stop = Arc::new(tokio::sync::Notify::new());

	let reporter = InstanceReporter {
		supervisor: supervisor.clone(),
		registry,
		outbound: outbound_tx,
		node_id: config.node_id.clone(),
		poll_interval: config.stats_poll_interval,
	};
	tokio::spawn(reporter.run(stop.clone()));

	bus::run(config.controller_url.clone(), config.node_id.clone(), router, outbound_rx, stop).await;
	Ok(())
}
