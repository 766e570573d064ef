//! Per-agent lifecycle state machine.
//!
//! Three actors touch an agent: its own poll loop, the hook receiver, and the
//! live streamer. State lives behind a short-lived `state` lock that is never
//! held across an await. Whole transitions are serialized by a second, async
//! `turn` lock, so two transitions on one agent never interleave while slow
//! network and tmux calls still run outside the state lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact;
use crate::config::{AgentConfig, StuckPolicy};
use crate::control::{CloseStatus, Completion, ControlPlane, Heartbeat, PushKind, SessionClose};
use crate::model::{AgentSnapshot, Mode, Task};
use crate::stream::LiveStreamer;
use crate::stuck::{ContentHash, Progress, StuckDetector};
use crate::tmux::{session_name_for, TerminalDriver};

/// Settings shared by every agent in the process.
#[derive(Debug, Clone)]
pub struct Settings {
	pub team_id: String,
	pub stuck_timeout: Duration,
	pub on_stuck: StuckPolicy,
	pub stream_interval: Duration,
	pub log_dir: PathBuf,
}

/// Collaborators an agent drives.
pub struct Services {
	pub control: Arc<dyn ControlPlane>,
	pub terminal: Arc<dyn TerminalDriver>,
	pub settings: Settings,
}

/// The task an agent is currently bound to.
#[derive(Debug, Clone)]
struct TaskRun {
	task_id: String,
	session_id: String,
	log_path: PathBuf,
	prompt: String,
	started: Instant,
	started_at: DateTime<Utc>,
	/// Bytes of the log already pushed as backlog.
	flushed: u64,
	/// Terminal output is currently being appended to the log.
	piping: bool,
}

struct LiveStream {
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

struct AgentState {
	mode: Mode,
	run: Option<TaskRun>,
	stuck: StuckDetector,
	stream: Option<LiveStream>,
}

impl AgentState {
	/// Cancel the live streamer, if any. Taking the handle guarantees a single cancel.
	/// The task is left to notice the cancel on its own next tick.
	fn stop_stream(&mut self) {
		if let Some(stream) = self.stream.take() {
			stream.cancel.cancel();
		}
	}

	fn set_piping(&mut self, piping: bool) {
		if let Some(run) = self.run.as_mut() {
			run.piping = piping;
		}
	}
}

pub struct Agent {
	id: String,
	name: String,
	command: String,
	work_dir: PathBuf,
	session: String,
	services: Arc<Services>,
	turn: tokio::sync::Mutex<()>,
	state: Mutex<AgentState>,
}

impl Agent {
	pub fn new(config: &AgentConfig, services: Arc<Services>) -> Self {
		let stuck = StuckDetector::new(services.settings.stuck_timeout);
		Self {
			id: config.id.clone(),
			name: config.name.clone(),
			command: config.command.clone(),
			work_dir: PathBuf::from(&config.work_dir),
			session: session_name_for(&config.name),
			services,
			turn: tokio::sync::Mutex::new(()),
			state: Mutex::new(AgentState {
				mode: Mode::Idle,
				run: None,
				stuck,
				stream: None,
			}),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	fn state(&self) -> MutexGuard<'_, AgentState> {
		// Fields are only written together inside one critical section
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn mode(&self) -> Mode {
		self.state().mode
	}

	pub fn task_id(&self) -> Option<String> {
		self.state().run.as_ref().map(|run| run.task_id.clone())
	}

	pub fn session_id(&self) -> Option<String> {
		self.state().run.as_ref().map(|run| run.session_id.clone())
	}

	pub fn is_streaming(&self) -> bool {
		self.state().stream.is_some()
	}

	pub fn snapshot(&self) -> AgentSnapshot {
		let state = self.state();
		AgentSnapshot {
			id: self.id.clone(),
			name: self.name.clone(),
			command: self.command.clone(),
			work_dir: self.work_dir.clone(),
			session_name: self.session.clone(),
			mode: state.mode,
			task_id: state.run.as_ref().map(|run| run.task_id.clone()),
			session_id: state.run.as_ref().map(|run| run.session_id.clone()),
			started_at: state.run.as_ref().map(|run| run.started_at),
			live: state
				.stream
				.as_ref()
				.is_some_and(|stream| !stream.task.is_finished()),
		}
	}

	/// Poll forever: heartbeat, stuck check, mode sync. Each step absorbs its own failures.
	pub async fn run(self: Arc<Self>, poll_interval: Duration) {
		let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		info!(agent = %self.id, session = %self.session, "agent loop started");
		loop {
			ticker.tick().await;
			self.tick().await;
		}
	}

	pub async fn tick(&self) {
		self.heartbeat().await;
		if let Err(e) = self.check_stuck().await {
			warn!(agent = %self.id, error = %e, "stuck check failed");
		}
		self.sync_mode().await;
	}

	/// Report our mode and act on whatever the control plane hands back.
	/// Instructions that arrive in the wrong mode are dropped, not queued.
	pub async fn heartbeat(&self) {
		let status = self.mode();
		let beat = Heartbeat {
			agent_id: &self.id,
			team_id: &self.services.settings.team_id,
			status,
		};
		let response = match self.services.control.heartbeat(&beat).await {
			Ok(response) => response,
			Err(e) => {
				debug!(agent = %self.id, error = %e, "heartbeat failed");
				return;
			}
		};

		if let Some(task) = response.task {
			if let Err(e) = self.start_task(task).await {
				warn!(agent = %self.id, error = %e, "could not start task");
			}
		}
		if let Some(resume) = response.resume {
			if let Err(e) = self.resume(resume.message).await {
				warn!(agent = %self.id, error = %e, "could not resume task");
			}
		}
	}

	/// Idle → Accumulating. Returns `Ok(false)` when the agent is busy.
	pub async fn start_task(&self, task: Task) -> Result<bool> {
		let _turn = self.turn.lock().await;
		if self.mode() != Mode::Idle {
			debug!(agent = %self.id, task = %task.id, "ignoring task while busy");
			return Ok(false);
		}

		let terminal = &self.services.terminal;
		let log_path = artifact::log_path(&self.services.settings.log_dir, &self.id);
		artifact::reset_log(&log_path)
			.with_context(|| format!("failed to prepare log {}", log_path.display()))?;

		terminal
			.ensure_session(&self.session, &self.work_dir, &self.command)
			.await
			.context("terminal session unavailable")?;
		let piping = match terminal.pipe_to_file(&self.session, &log_path).await {
			Ok(()) => true,
			Err(e) => {
				warn!(agent = %self.id, error = %e, "pipe setup failed");
				false
			}
		};

		let session_id = match self.services.control.open_session(&task.id, &self.id).await {
			Ok(id) => id,
			Err(e) => {
				let _ = terminal.stop_pipe(&self.session).await;
				return Err(anyhow::Error::new(e).context("failed to open remote session"));
			}
		};

		let prompt = task.prompt();
		if let Err(e) = terminal.send_keys(&self.session, &prompt).await {
			warn!(agent = %self.id, error = %e, "failed to send task prompt");
		}

		let now = Instant::now();
		let mut state = self.state();
		state.run = Some(TaskRun {
			task_id: task.id.clone(),
			session_id: session_id.clone(),
			log_path,
			prompt,
			started: now,
			started_at: Utc::now(),
			flushed: 0,
			piping,
		});
		state.stuck.clear(now);
		state.mode = Mode::Accumulating;
		info!(agent = %self.id, task = %task.id, session = %session_id, "task started");
		Ok(true)
	}

	/// WaitingInput → Accumulating.
	pub async fn resume(&self, message: Option<String>) -> Result<bool> {
		let _turn = self.turn.lock().await;
		let log_path = {
			let state = self.state();
			match (&state.mode, &state.run) {
				(Mode::WaitingInput, Some(run)) => run.log_path.clone(),
				_ => {
					debug!(agent = %self.id, mode = %state.mode, "ignoring resume");
					return Ok(false);
				}
			}
		};

		let terminal = &self.services.terminal;
		let piping = match terminal.pipe_to_file(&self.session, &log_path).await {
			Ok(()) => true,
			Err(e) => {
				warn!(agent = %self.id, error = %e, "pipe setup failed");
				false
			}
		};
		// Resume instructions are not redelivered
		if let Some(message) = message.filter(|m| !m.is_empty()) {
			if let Err(e) = terminal.send_keys(&self.session, &message).await {
				warn!(agent = %self.id, error = %e, "failed to send resume message");
			}
		}

		let mut state = self.state();
		state.set_piping(piping);
		state.mode = Mode::Accumulating;
		state.stuck.reset(Instant::now());
		info!(agent = %self.id, "task resumed");
		Ok(true)
	}

	/// Hook "stopped": close out the task and return to Idle.
	pub async fn complete(&self, reason: Option<&str>) -> Result<bool> {
		let _turn = self.turn.lock().await;
		let run = {
			let mut state = self.state();
			if state.mode == Mode::Idle {
				return Ok(false);
			}
			state.stop_stream();
			state.run.clone()
		};

		let terminal = &self.services.terminal;
		let control = &self.services.control;
		if let Err(e) = terminal.stop_pipe(&self.session).await {
			debug!(agent = %self.id, error = %e, "stop pipe failed");
		}

		if let Some(run) = &run {
			let final_text = artifact::extract_final_text(&run.log_path);
			let close = SessionClose {
				session_id: &run.session_id,
				status: CloseStatus::Closed,
				final_text: &final_text,
			};
			match control.close_session(&close).await {
				Ok(closed) => {
					if let Some(upload_url) = closed.upload_url() {
						let key = match control.upload_log(upload_url, &run.log_path).await {
							Ok(()) => closed.key.as_deref(),
							Err(e) => {
								warn!(agent = %self.id, task = %run.task_id, error = %e, "log upload failed");
								None
							}
						};
						let completion = Completion {
							task_id: &run.task_id,
							session_id: &run.session_id,
							agent_id: &self.id,
							final_text: &final_text,
							r2_log_key: key,
							duration_ms: run.started.elapsed().as_millis() as u64,
							success: true,
						};
						if let Err(e) = control.complete_task(&completion).await {
							warn!(agent = %self.id, task = %run.task_id, error = %e, "completion report failed");
						}
					}
				}
				Err(e) => warn!(agent = %self.id, task = %run.task_id, error = %e, "session close failed"),
			}
		}

		if let Err(e) = terminal.kill_session(&self.session).await {
			debug!(agent = %self.id, error = %e, "kill session failed");
		}

		let mut state = self.state();
		state.mode = Mode::Idle;
		state.run = None;
		state.stuck.clear(Instant::now());
		info!(
			agent = %self.id,
			task = run.as_ref().map(|r| r.task_id.as_str()).unwrap_or_default(),
			reason = reason.unwrap_or_default(),
			"task completed"
		);
		Ok(true)
	}

	/// Hook "needs input": pause the task and tell the control plane why.
	pub async fn wait_for_input(&self, message: &str) -> Result<bool> {
		let _turn = self.turn.lock().await;
		let session_id = {
			let mut state = self.state();
			if !state.mode.is_working() {
				return Ok(false);
			}
			state.stop_stream();
			state.set_piping(false);
			state.mode = Mode::WaitingInput;
			state.run.as_ref().map(|run| run.session_id.clone())
		};

		if let Err(e) = self.services.terminal.stop_pipe(&self.session).await {
			debug!(agent = %self.id, error = %e, "stop pipe failed");
		}
		if let Some(session_id) = session_id {
			let close = SessionClose {
				session_id: &session_id,
				status: CloseStatus::WaitingInput,
				final_text: message,
			};
			if let Err(e) = self.services.control.close_session(&close).await {
				warn!(agent = %self.id, error = %e, "session close failed");
			}
		}
		info!(agent = %self.id, "waiting for input");
		Ok(true)
	}

	/// Compare the pane against the last capture and apply the stuck policy on timeout.
	pub async fn check_stuck(&self) -> Result<()> {
		let _turn = self.turn.lock().await;
		if !self.mode().is_working() {
			return Ok(());
		}

		// A dead session captures as empty and so eventually reads as stuck
		let content = match self.services.terminal.capture_pane(&self.session).await {
			Ok(content) => content,
			Err(e) => {
				debug!(agent = %self.id, error = %e, "capture failed");
				String::new()
			}
		};

		let now = Instant::now();
		let progress = {
			let mut state = self.state();
			let progress = state.stuck.observe(ContentHash::of(&content), now);
			if progress == Progress::Stuck {
				warn!(
					agent = %self.id,
					unchanged_secs = state.stuck.unchanged_for(now).as_secs(),
					"agent appears stuck"
				);
			}
			progress
		};

		if progress == Progress::Stuck {
			match self.services.settings.on_stuck {
				StuckPolicy::Notify => self.park_stuck().await,
				StuckPolicy::AutoRestart => self.restart().await,
			}
		}
		Ok(())
	}

	// Caller holds `turn`. Local only: the remote session stays open.
	async fn park_stuck(&self) {
		{
			let mut state = self.state();
			state.stop_stream();
			state.set_piping(false);
			state.mode = Mode::WaitingInput;
		}
		if let Err(e) = self.services.terminal.stop_pipe(&self.session).await {
			debug!(agent = %self.id, error = %e, "stop pipe failed");
		}
		info!(agent = %self.id, "stuck; waiting for input");
	}

	// Caller holds `turn`. The task and remote session carry over to the new terminal session.
	async fn restart(&self) {
		let run = {
			let mut state = self.state();
			state.stop_stream();
			state.set_piping(false);
			state.mode = Mode::Accumulating;
			state.run.clone()
		};
		let Some(run) = run else {
			return;
		};

		let terminal = &self.services.terminal;
		if let Err(e) = terminal.kill_session(&self.session).await {
			debug!(agent = %self.id, error = %e, "kill session failed");
		}

		match self.relaunch(&run).await {
			Ok(()) => {
				let mut state = self.state();
				state.set_piping(true);
				state.stuck.clear(Instant::now());
				info!(agent = %self.id, task = %run.task_id, "restarted stuck agent");
			}
			Err(e) => {
				warn!(agent = %self.id, task = %run.task_id, error = %e, "restart failed; waiting for input");
				let _ = terminal.stop_pipe(&self.session).await;
				self.state().mode = Mode::WaitingInput;
			}
		}
	}

	async fn relaunch(&self, run: &TaskRun) -> Result<()> {
		let terminal = &self.services.terminal;
		terminal
			.ensure_session(&self.session, &self.work_dir, &self.command)
			.await?;
		terminal.pipe_to_file(&self.session, &run.log_path).await?;
		terminal.send_keys(&self.session, &run.prompt).await
	}

	/// Follow the viewer count: stream live while watched, accumulate otherwise.
	pub async fn sync_mode(&self) {
		if !self.mode().is_working() {
			return;
		}

		let viewers = match self.services.control.viewer_count(&self.id).await {
			Ok(count) => count,
			Err(e) => {
				debug!(agent = %self.id, error = %e, "viewer count unavailable");
				return;
			}
		};

		let result = if viewers > 0 {
			self.go_live().await
		} else {
			self.go_unattended().await
		};
		if let Err(e) = result {
			warn!(agent = %self.id, error = %e, "mode switch failed");
		}
	}

	/// Accumulating → Live: stop piping, flush the backlog once, start streaming.
	pub async fn go_live(&self) -> Result<bool> {
		let _turn = self.turn.lock().await;
		let (log_path, flushed) = {
			let state = self.state();
			match (&state.mode, &state.run) {
				(Mode::Accumulating, Some(run)) => (run.log_path.clone(), run.flushed),
				_ => return Ok(false),
			}
		};

		// The log is only read once nothing appends to it
		if let Err(e) = self.services.terminal.stop_pipe(&self.session).await {
			debug!(agent = %self.id, error = %e, "stop pipe failed");
		}
		self.state().set_piping(false);

		let backlog = match self.flush_backlog(&log_path, flushed).await {
			Ok(backlog) => backlog,
			Err(e) => {
				self.repipe(&log_path).await;
				return Err(e);
			}
		};

		let cancel = CancellationToken::new();
		let task = LiveStreamer {
			agent_id: self.id.clone(),
			session: self.session.clone(),
			interval: self.services.settings.stream_interval,
			control: self.services.control.clone(),
			terminal: self.services.terminal.clone(),
		}
		.spawn(cancel.clone());

		let mut state = self.state();
		if let Some(run) = state.run.as_mut() {
			run.flushed = backlog.end;
		}
		state.stream = Some(LiveStream { cancel, task });
		state.mode = Mode::Live;
		info!(agent = %self.id, backlog_lines = backlog.lines.len(), "live");
		Ok(true)
	}

	async fn flush_backlog(&self, log_path: &Path, flushed: u64) -> Result<artifact::Backlog> {
		let backlog = artifact::read_backlog(log_path, flushed)
			.with_context(|| format!("failed to read backlog from {}", log_path.display()))?;
		if !backlog.lines.is_empty() {
			self.services
				.control
				.push_lines(&self.id, PushKind::Backlog, &backlog.lines)
				.await
				.context("backlog push failed")?;
		}
		Ok(backlog)
	}

	// Caller holds `turn`.
	async fn repipe(&self, log_path: &Path) {
		match self.services.terminal.pipe_to_file(&self.session, log_path).await {
			Ok(()) => self.state().set_piping(true),
			Err(e) => warn!(agent = %self.id, error = %e, "pipe setup failed"),
		}
	}

	/// Live → Accumulating: stop streaming and resume piping to the log.
	/// Also retries piping for an Accumulating agent whose earlier pipe setup failed.
	pub async fn go_unattended(&self) -> Result<bool> {
		let _turn = self.turn.lock().await;
		let log_path = {
			let mut state = self.state();
			let log_path = match (&state.mode, &state.run) {
				(Mode::Live, Some(run)) => run.log_path.clone(),
				(Mode::Accumulating, Some(run)) if !run.piping => run.log_path.clone(),
				_ => return Ok(false),
			};
			state.stop_stream();
			state.mode = Mode::Accumulating;
			log_path
		};

		self.services
			.terminal
			.pipe_to_file(&self.session, &log_path)
			.await
			.context("pipe setup failed")?;
		self.state().set_piping(true);
		info!(agent = %self.id, "accumulating");
		Ok(true)
	}
}
