use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tmux::session_name_for;

const DEFAULT_CONFIG: &str = r#"
# TaskSquad daemon configuration

[server]
url = "http://localhost:8787"
token = ""
team_id = ""
poll_interval = 30

[stuck_detection]
timeout_seconds = 120
on_stuck = "notify" # or "auto-restart"

[hooks]
bind = "127.0.0.1"
port = 7374

[stream]
interval_ms = 2000

[logs]
dir = "~/.tasksquad/logs"

# [[agents]]
# id = "agent-1"
# name = "claude"
# command = "claude"
# work_dir = "~/code/project"
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub server: Server,
	#[serde(default)]
	pub agents: Vec<AgentConfig>,
	#[serde(default)]
	pub stuck_detection: StuckDetection,
	#[serde(default)]
	pub hooks: Hooks,
	#[serde(default)]
	pub stream: Stream,
	#[serde(default)]
	pub logs: Logs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
	pub url: String,
	#[serde(default)]
	pub token: String,
	#[serde(default)]
	pub team_id: String,
	#[serde(default = "default_poll_interval")]
	pub poll_interval: u64, // seconds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub command: String,
	#[serde(default = "default_work_dir")]
	pub work_dir: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StuckPolicy {
	/// Recreate the terminal session and reissue the task prompt.
	AutoRestart,
	/// Park the agent in waiting-for-input.
	#[default]
	Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckDetection {
	#[serde(default = "default_stuck_timeout")]
	pub timeout_seconds: u64,
	#[serde(default)]
	pub on_stuck: StuckPolicy,
}

impl Default for StuckDetection {
	fn default() -> Self {
		Self {
			timeout_seconds: default_stuck_timeout(),
			on_stuck: StuckPolicy::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hooks {
	#[serde(default = "default_hooks_bind")]
	pub bind: String,
	#[serde(default = "default_hooks_port")]
	pub port: u16,
}

impl Default for Hooks {
	fn default() -> Self {
		Self {
			bind: default_hooks_bind(),
			port: default_hooks_port(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
	#[serde(default = "default_stream_interval")]
	pub interval_ms: u64,
}

impl Default for Stream {
	fn default() -> Self {
		Self {
			interval_ms: default_stream_interval(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logs {
	#[serde(default = "default_logs_dir")]
	pub dir: String,
}

impl Default for Logs {
	fn default() -> Self {
		Self {
			dir: default_logs_dir(),
		}
	}
}

impl Config {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.server.poll_interval)
	}

	pub fn stuck_timeout(&self) -> Duration {
		Duration::from_secs(self.stuck_detection.timeout_seconds)
	}

	pub fn stream_interval(&self) -> Duration {
		Duration::from_millis(self.stream.interval_ms)
	}

	pub fn hooks_addr(&self) -> String {
		format!("{}:{}", self.hooks.bind, self.hooks.port)
	}

	pub fn validate(&self) -> Result<()> {
		if self.server.url.trim().is_empty() {
			anyhow::bail!("server.url must be set");
		}
		if self.server.poll_interval == 0 {
			anyhow::bail!("server.poll_interval must be greater than zero");
		}
		if self.stream.interval_ms == 0 {
			anyhow::bail!("stream.interval_ms must be greater than zero");
		}

		let mut ids = HashSet::new();
		let mut sessions = HashSet::new();
		for agent in &self.agents {
			if agent.id.trim().is_empty() {
				anyhow::bail!("agent {:?} has an empty id", agent.name);
			}
			if !ids.insert(agent.id.as_str()) {
				anyhow::bail!("duplicate agent id {:?}", agent.id);
			}
			let session = session_name_for(&agent.name);
			if !sessions.insert(session.clone()) {
				anyhow::bail!(
					"agent {:?} maps to tmux session {} which is already in use",
					agent.id,
					session
				);
			}
		}
		Ok(())
	}
}

/// Load the config at `path`, writing the default template first if it does not exist.
pub fn load_or_init(path: &Path) -> Result<Config> {
	if !path.exists() {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.with_context(|| format!("failed to create {}", parent.display()))?;
		}
		fs::write(path, DEFAULT_CONFIG.trim_start())
			.with_context(|| format!("failed to write default config to {}", path.display()))?;
	}
	let content = fs::read_to_string(path)
		.with_context(|| format!("failed to read {}", path.display()))?;
	parse(&content).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse(content: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(content)?;
	cfg.logs.dir = expand_path(&cfg.logs.dir);
	for agent in &mut cfg.agents {
		agent.work_dir = expand_path(&agent.work_dir);
	}
	cfg.validate()?;
	Ok(cfg)
}

pub fn expand_path(input: &str) -> String {
	if input.starts_with("~/") {
		if let Some(home) = dirs::home_dir() {
			return home
				.join(input.trim_start_matches("~/"))
				.to_string_lossy()
				.into_owned();
		}
	}
	input.to_string()
}

pub fn base_dir() -> Result<PathBuf> {
	dirs::home_dir()
		.map(|p| p.join(".tasksquad"))
		.ok_or_else(|| anyhow::anyhow!("Failed to resolve home directory"))
}

pub fn default_path() -> Result<PathBuf> {
	Ok(base_dir()?.join("config.toml"))
}

fn default_poll_interval() -> u64 {
	30
}

fn default_work_dir() -> String {
	".".to_string()
}

fn default_stuck_timeout() -> u64 {
	120
}

fn default_hooks_bind() -> String {
	"127.0.0.1".to_string()
}

fn default_hooks_port() -> u16 {
	7374
}

fn default_stream_interval() -> u64 {
	2000
}

fn default_logs_dir() -> String {
	"~/.tasksquad/logs".to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_defaults_applied() {
		let cfg = parse(
			r#"
[server]
url = "https://api.example.com"

[[agents]]
id = "a1"
name = "claude"
command = "claude"
"#,
		)
		.unwrap();

		assert_eq!(cfg.server.poll_interval, 30);
		assert_eq!(cfg.stuck_detection.timeout_seconds, 120);
		assert_eq!(cfg.stuck_detection.on_stuck, StuckPolicy::Notify);
		assert_eq!(cfg.hooks.port, 7374);
		assert_eq!(cfg.stream_interval(), Duration::from_secs(2));
		assert_eq!(cfg.agents[0].work_dir, ".");
	}

	#[test]
	fn test_auto_restart_policy() {
		let cfg = parse(
			r#"
[server]
url = "https://api.example.com"

[stuck_detection]
timeout_seconds = 5
on_stuck = "auto-restart"
"#,
		)
		.unwrap();

		assert_eq!(cfg.stuck_detection.on_stuck, StuckPolicy::AutoRestart);
		assert_eq!(cfg.stuck_timeout(), Duration::from_secs(5));
	}

	#[test]
	fn test_unknown_policy_rejected() {
		let err = parse(
			r#"
[server]
url = "https://api.example.com"

[stuck_detection]
on_stuck = "explode"
"#,
		);
		assert!(err.is_err());
	}

	#[test]
	fn test_duplicate_agent_ids_rejected() {
		let err = parse(
			r#"
[server]
url = "https://api.example.com"

[[agents]]
id = "a1"
name = "one"

[[agents]]
id = "a1"
name = "two"
"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("duplicate agent id"));
	}

	#[test]
	fn test_colliding_session_names_rejected() {
		let err = parse(
			r#"
[server]
url = "https://api.example.com"

[[agents]]
id = "a1"
name = "My Agent"

[[agents]]
id = "a2"
name = "my-agent"
"#,
		);
		assert!(err.is_err());
	}

	#[test]
	fn test_load_or_init_writes_template() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("nested").join("config.toml");

		let cfg = load_or_init(&path).unwrap();

		assert!(path.exists());
		assert!(cfg.agents.is_empty());
		assert_eq!(cfg.hooks_addr(), "127.0.0.1:7374");
	}
}
