use anyhow::{Context, Result};
use async_trait::async_trait;
use slug::slugify;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

pub const SESSION_PREFIX: &str = "tsq-";

/// Common tmux installation paths
const TMUX_PATHS: &[&str] = &[
	"/opt/homebrew/bin/tmux", // Apple Silicon Homebrew
	"/usr/local/bin/tmux",    // Intel Homebrew
	"/usr/bin/tmux",          // System
	"/bin/tmux",              // Fallback
];

/// Time a freshly created session gets before we pipe or type into it.
const SESSION_SETTLE: Duration = Duration::from_millis(500);

/// Cached tmux path - found once at startup
static TMUX_PATH: OnceLock<String> = OnceLock::new();

/// The terminal capabilities the orchestrator drives. Sessions are addressed by name.
#[async_trait]
pub trait TerminalDriver: Send + Sync {
	/// Create the session unless it already exists.
	async fn ensure_session(&self, session: &str, work_dir: &Path, command: &str) -> Result<()>;

	/// Type `text` literally, then press Enter.
	async fn send_keys(&self, session: &str, text: &str) -> Result<()>;

	/// Append everything the session prints to `path`.
	async fn pipe_to_file(&self, session: &str, path: &Path) -> Result<()>;

	async fn stop_pipe(&self, session: &str) -> Result<()>;

	/// Currently visible pane content.
	async fn capture_pane(&self, session: &str) -> Result<String>;

	async fn kill_session(&self, session: &str) -> Result<()>;
}

/// tmux session name for an agent display name.
pub fn session_name_for(agent_name: &str) -> String {
	format!("{SESSION_PREFIX}{}", slugify(agent_name))
}

/// Find tmux binary, checking common locations if not in PATH
pub fn find_tmux() -> &'static str {
	TMUX_PATH.get_or_init(|| {
		// First check if tmux is in PATH
		if let Ok(output) = std::process::Command::new("which").arg("tmux").output() {
			if output.status.success() {
				let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
				if !path.is_empty() && Path::new(&path).exists() {
					return path;
				}
			}
		}

		for path in TMUX_PATHS {
			if Path::new(path).exists() {
				return path.to_string();
			}
		}

		"tmux".to_string()
	})
}

/// Create a Command for tmux with the correct path
fn tmux_cmd() -> Command {
	let mut cmd = Command::new(find_tmux());
	cmd.stdin(Stdio::null()).kill_on_drop(true);
	cmd
}

fn pane_target(session: &str) -> String {
	format!("{session}:0.0")
}

async fn run(args: &[&str]) -> Result<Output> {
	let output = tmux_cmd().args(args).output().await;
	match output {
		Ok(out) => Ok(out),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(anyhow::anyhow!(
			"tmux not found. Install it first.\nSearched: {:?}",
			TMUX_PATHS
		)),
		Err(e) => Err(e.into()),
	}
}

async fn run_checked(args: &[&str]) -> Result<()> {
	let output = run(args).await?;
	if !output.status.success() {
		return Err(anyhow::anyhow!(
			"tmux {} failed (status {}): {}",
			args.first().copied().unwrap_or_default(),
			output.status,
			String::from_utf8_lossy(&output.stderr).trim()
		));
	}
	Ok(())
}

/// [`TerminalDriver`] backed by the local tmux server.
#[derive(Debug, Default, Clone)]
pub struct Tmux;

impl Tmux {
	pub fn new() -> Self {
		Self
	}

	pub async fn has_session(&self, session: &str) -> bool {
		run(&["has-session", "-t", session])
			.await
			.map(|out| out.status.success())
			.unwrap_or(false)
	}
}

#[async_trait]
impl TerminalDriver for Tmux {
	async fn ensure_session(&self, session: &str, work_dir: &Path, command: &str) -> Result<()> {
		if self.has_session(session).await {
			return Ok(());
		}

		let dir = work_dir.to_string_lossy().into_owned();
		let mut args = vec!["new-session", "-d", "-s", session, "-c", dir.as_str()];
		if !command.trim().is_empty() {
			args.push(command);
		}
		run_checked(&args)
			.await
			.with_context(|| format!("failed to start tmux session {} (using {})", session, find_tmux()))?;

		// Let the session initialize before piping or typing into it
		tokio::time::sleep(SESSION_SETTLE).await;
		Ok(())
	}

	async fn send_keys(&self, session: &str, text: &str) -> Result<()> {
		// literal mode - don't interpret special chars in text
		run_checked(&["send-keys", "-l", "-t", session, text])
			.await
			.with_context(|| format!("failed to send keys to {}", session))?;

		run_checked(&["send-keys", "-t", session, "Enter"])
			.await
			.with_context(|| format!("failed to send Enter to {}", session))
	}

	async fn pipe_to_file(&self, session: &str, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let cmd = format!("cat >> '{}'", path.to_string_lossy().replace('\'', "'\\''"));
		let target = pane_target(session);

		// Retry - the tmux server may need time to be ready after session creation
		let mut last_error = None;
		for attempt in 0..3 {
			if attempt > 0 {
				tokio::time::sleep(Duration::from_millis(200)).await;
			}
			match run_checked(&["pipe-pane", "-t", &target, &cmd]).await {
				Ok(()) => return Ok(()),
				Err(e) => last_error = Some(e.to_string()),
			}
		}

		Err(anyhow::anyhow!(
			"tmux pipe-pane failed for session {} after 3 attempts: {} (tmux={}, target={})",
			session,
			last_error.unwrap_or_else(|| "unknown error".to_string()),
			find_tmux(),
			target
		))
	}

	async fn stop_pipe(&self, session: &str) -> Result<()> {
		// pipe-pane without a command closes the current pipe
		run_checked(&["pipe-pane", "-t", &pane_target(session)])
			.await
			.with_context(|| format!("failed to stop pipe for {}", session))
	}

	async fn capture_pane(&self, session: &str) -> Result<String> {
		let output = run(&["capture-pane", "-p", "-t", &pane_target(session)])
			.await
			.context("failed to capture pane")?;

		if !output.status.success() {
			return Err(anyhow::anyhow!(
				"tmux capture-pane failed: {}",
				String::from_utf8_lossy(&output.stderr)
			));
		}

		let stdout = String::from_utf8_lossy(&output.stdout);
		Ok(stdout.trim_end_matches('\n').to_string())
	}

	async fn kill_session(&self, session: &str) -> Result<()> {
		run_checked(&["kill-session", "-t", session])
			.await
			.with_context(|| format!("failed to kill session {}", session))
	}
}
