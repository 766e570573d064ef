mod agent;
mod artifact;
mod config;
mod control;
mod hooks;
mod model;
mod stream;
mod stuck;
#[cfg(test)]
mod testing;
mod tmux;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use agent::{Agent, Services, Settings};
use config::Config;
use control::HttpControlPlane;
use hooks::{AgentRegistry, HookRouter};
use model::AgentSnapshot;
use tmux::Tmux;

#[derive(Parser)]
#[command(name = "tsq")]
#[command(version, about = "Supervise terminal coding agents for a TaskSquad team")]
struct Cli {
	/// Config file (defaults to ~/.tasksquad/config.toml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	/// Override server.url from the config file
	#[arg(long, global = true)]
	api_url: Option<String>,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the daemon (default)
	Run,
	/// Print JSON status for every agent of the running daemon
	Status,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();
	let path = match cli.config {
		Some(path) => path,
		None => config::default_path()?,
	};
	let mut cfg = config::load_or_init(&path).context("failed to load config")?;
	if let Some(url) = cli.api_url {
		cfg.server.url = url;
	}

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => run_daemon(cfg).await,
		Commands::Status => print_status(&cfg).await,
	}
}

async fn run_daemon(cfg: Config) -> Result<()> {
	let control = HttpControlPlane::new(&cfg.server.url, &cfg.server.token)?;
	let services = Arc::new(Services {
		control: Arc::new(control),
		terminal: Arc::new(Tmux::new()),
		settings: Settings {
			team_id: cfg.server.team_id.clone(),
			stuck_timeout: cfg.stuck_timeout(),
			on_stuck: cfg.stuck_detection.on_stuck,
			stream_interval: cfg.stream_interval(),
			log_dir: PathBuf::from(&cfg.logs.dir),
		},
	});

	let agents: Vec<Arc<Agent>> = cfg
		.agents
		.iter()
		.map(|agent| Arc::new(Agent::new(agent, services.clone())))
		.collect();
	let registry = Arc::new(AgentRegistry::new(agents));
	if registry.is_empty() {
		warn!("no agents configured; only the hook server will run");
	}

	let poll = cfg.poll_interval();
	for agent in registry.iter() {
		tokio::spawn(agent.clone().run(poll));
	}
	info!(
		agents = registry.len(),
		server = %cfg.server.url,
		poll_secs = poll.as_secs(),
		"daemon started"
	);

	let app = hooks::router(HookRouter::new(registry.clone()));
	let addr = cfg.hooks_addr();
	match tokio::net::TcpListener::bind(&addr).await {
		Ok(listener) => {
			info!("hook server listening on http://{}", addr);
			axum::serve(listener, app)
				.with_graceful_shutdown(shutdown_signal())
				.await
				.context("hook server failed")?;
		}
		Err(e) => {
			// Agents keep polling; only hook-driven transitions are lost
			error!(addr = %addr, error = %e, "failed to bind hook server");
			shutdown_signal().await;
		}
	}

	info!("shutting down");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		error!(error = %e, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
}

async fn print_status(cfg: &Config) -> Result<()> {
	let url = format!("http://{}/status", cfg.hooks_addr());
	let client = reqwest::Client::builder()
		.timeout(Duration::from_secs(5))
		.build()?;
	let snapshots: Vec<AgentSnapshot> = client
		.get(&url)
		.send()
		.await
		.with_context(|| format!("daemon not reachable at {url}"))?
		.error_for_status()?
		.json()
		.await?;
	println!("{}", serde_json::to_string_pretty(&snapshots)?);
	Ok(())
}
