use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use komari_forward_controller::config::Config;
use komari_forward_controller::dispatcher::Dispatcher;
use komari_forward_controller::history::{self, HistoryPeriod, MaintenanceGuard};
use komari_forward_controller::registry::NodeRegistry;
use komari_forward_controller::repository::{InMemoryAlertRepository, InMemoryHistoryRepository, InMemoryRuleRepository, InMemoryStatsRepository};
use komari_forward_controller::rest::{self, AppState};
use komari_forward_controller::roles::RepositoryRoles;
use komari_forward_controller::stats::{NoopBroadcaster, StatsAggregator};
use komari_forward_controller::wsbus::WsBus;
use tracing::info;

/// CLI flags layered over the file config, mirroring the teacher's
/// `--file`/env-driven `clap::Parser` plus `KOMARI_FORWARD_*` env fallback.
#[derive(Parser, Debug)]
#[command(about = "komari-forward controller: rule store, apply engine, stats/alerts")]
struct Args {
	/// Path to a YAML config file. Missing file falls back to all defaults.
	#[arg(short, long, env = "KOMARI_FORWARD_CONFIG")]
	file: Option<PathBuf>,

	#[arg(long, env = "KOMARI_FORWARD_BIND")]
	bind_addr: Option<String>,
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
		None => Config::default(),
	};
	if let Some(bind_addr) = args.bind_addr {
		config.bind_addr = bind_addr;
	}

	let rules = Arc::new(InMemoryRuleRepository::default());
	let stats_repo = Arc::new(InMemoryStatsRepository::default());
	let history_repo = Arc::new(InMemoryHistoryRepository::default());
	let alert_repo = Arc::new(InMemoryAlertRepository::default());
	let registry = Arc::new(NodeRegistry::new());

	let bus = Arc::new(WsBus::new());
	let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
	let apply_engine = Arc::new(komari_forward_controller::apply::ApplyEngine::new(dispatcher.clone(), rules.clone(), registry.clone()));

	let roles = Arc::new(RepositoryRoles::new(rules.clone()));
	let aggregator = Arc::new(StatsAggregator {
		stats: stats_repo,
		history: history_repo.clone(),
		alerts: alert_repo.clone(),
		broadcaster: Arc::new(NoopBroadcaster),
		roles,
		history_period: HistoryPeriod::OneHour,
		stat_freshness: chrono::Duration::seconds(config.stat_freshness_secs),
	});

	let maintenance_guard = Arc::new(MaintenanceGuard::new());
	{
		let history_repo = history_repo.clone();
		let guard = maintenance_guard.clone();
		let probe_interval = config.maintenance_probe_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(probe_interval);
			loop {
				ticker.tick().await;
				let outcome = history::run_daily_maintenance(history_repo.as_ref(), &guard, chrono::Utc::now());
				tracing::debug!(?outcome, "daily maintenance probe");
			}
		});
	}

	let state = AppState {
		bus,
		dispatcher,
		apply_engine,
		aggregator,
		rules,
		alerts: alert_repo,
		history: history_repo,
		registry,
	};

	let app = rest::router(state);
	let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
	info!(bind_addr = %config.bind_addr, "komari-forward controller listening");
	axum::serve(listener, app).await?;
	Ok(())
}
