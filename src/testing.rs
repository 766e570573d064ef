//! In-memory stand-ins for the control plane and tmux, recording every call.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::control::{
	CloseResponse, CloseStatus, Completion, ControlError, ControlPlane, Heartbeat,
	HeartbeatResponse, PushKind, SessionClose,
};
use crate::model::Mode;
use crate::tmux::TerminalDriver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
	Heartbeat {
		agent_id: String,
		status: Mode,
	},
	Open {
		task_id: String,
		agent_id: String,
	},
	Close {
		session_id: String,
		status: CloseStatus,
		final_text: String,
	},
	Viewers(String),
	Push {
		kind: PushKind,
		lines: Vec<String>,
	},
	Complete {
		task_id: String,
		session_id: String,
		final_text: String,
		r2_log_key: Option<String>,
		success: bool,
	},
	Upload {
		url: String,
		path: PathBuf,
	},
}

struct ControlState {
	calls: Vec<ControlCall>,
	heartbeats: VecDeque<HeartbeatResponse>,
	viewers: Option<u32>,
	close_response: CloseResponse,
	fail_open: bool,
	fail_upload: bool,
	fail_push: bool,
	sessions_opened: u32,
}

pub struct FakeControl {
	state: Mutex<ControlState>,
}

fn unavailable(path: &str) -> ControlError {
	ControlError::Malformed {
		path: path.to_string(),
		field: "everything",
	}
}

impl FakeControl {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(ControlState {
				calls: Vec::new(),
				heartbeats: VecDeque::new(),
				viewers: Some(0),
				close_response: CloseResponse::default(),
				fail_open: false,
				fail_upload: false,
				fail_push: false,
				sessions_opened: 0,
			}),
		}
	}

	/// Queue a response for the next heartbeat; an empty queue answers with nothing.
	pub fn queue_heartbeat(&self, response: HeartbeatResponse) {
		self.state.lock().unwrap().heartbeats.push_back(response);
	}

	/// `None` makes the viewer query fail.
	pub fn set_viewers(&self, viewers: Option<u32>) {
		self.state.lock().unwrap().viewers = viewers;
	}

	pub fn set_close_response(&self, response: CloseResponse) {
		self.state.lock().unwrap().close_response = response;
	}

	pub fn fail_open(&self, fail: bool) {
		self.state.lock().unwrap().fail_open = fail;
	}

	pub fn fail_upload(&self, fail: bool) {
		self.state.lock().unwrap().fail_upload = fail;
	}

	pub fn fail_push(&self, fail: bool) {
		self.state.lock().unwrap().fail_push = fail;
	}

	pub fn calls(&self) -> Vec<ControlCall> {
		self.state.lock().unwrap().calls.clone()
	}

	pub fn closes(&self) -> Vec<ControlCall> {
		self.calls()
			.into_iter()
			.filter(|call| matches!(call, ControlCall::Close { .. }))
			.collect()
	}

	pub fn pushes(&self, wanted: PushKind) -> Vec<Vec<String>> {
		self.calls()
			.into_iter()
			.filter_map(|call| match call {
				ControlCall::Push { kind, lines } if kind == wanted => Some(lines),
				_ => None,
			})
			.collect()
	}

	fn record(&self, call: ControlCall) {
		self.state.lock().unwrap().calls.push(call);
	}
}

#[async_trait]
impl ControlPlane for FakeControl {
	async fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<HeartbeatResponse, ControlError> {
		self.record(ControlCall::Heartbeat {
			agent_id: beat.agent_id.to_string(),
			status: beat.status,
		});
		Ok(self
			.state
			.lock()
			.unwrap()
			.heartbeats
			.pop_front()
			.unwrap_or_default())
	}

	async fn open_session(&self, task_id: &str, agent_id: &str) -> Result<String, ControlError> {
		self.record(ControlCall::Open {
			task_id: task_id.to_string(),
			agent_id: agent_id.to_string(),
		});
		let mut state = self.state.lock().unwrap();
		if state.fail_open {
			return Err(unavailable("/daemon/session/open"));
		}
		state.sessions_opened += 1;
		Ok(format!("S{}", state.sessions_opened))
	}

	async fn close_session(&self, close: &SessionClose<'_>) -> Result<CloseResponse, ControlError> {
		self.record(ControlCall::Close {
			session_id: close.session_id.to_string(),
			status: close.status,
			final_text: close.final_text.to_string(),
		});
		Ok(self.state.lock().unwrap().close_response.clone())
	}

	async fn viewer_count(&self, agent_id: &str) -> Result<u32, ControlError> {
		self.record(ControlCall::Viewers(agent_id.to_string()));
		self.state
			.lock()
			.unwrap()
			.viewers
			.ok_or_else(|| unavailable("/daemon/viewers"))
	}

	async fn push_lines(
		&self,
		_agent_id: &str,
		kind: PushKind,
		lines: &[String],
	) -> Result<(), ControlError> {
		if self.state.lock().unwrap().fail_push {
			return Err(unavailable("/daemon/push"));
		}
		self.record(ControlCall::Push {
			kind,
			lines: lines.to_vec(),
		});
		Ok(())
	}

	async fn complete_task(&self, completion: &Completion<'_>) -> Result<(), ControlError> {
		self.record(ControlCall::Complete {
			task_id: completion.task_id.to_string(),
			session_id: completion.session_id.to_string(),
			final_text: completion.final_text.to_string(),
			r2_log_key: completion.r2_log_key.map(str::to_string),
			success: completion.success,
		});
		Ok(())
	}

	async fn upload_log(&self, upload_url: &str, path: &Path) -> Result<(), ControlError> {
		self.record(ControlCall::Upload {
			url: upload_url.to_string(),
			path: path.to_path_buf(),
		});
		if self.state.lock().unwrap().fail_upload {
			return Err(ControlError::Upload("server returned 403 Forbidden".to_string()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCall {
	Ensure { session: String, command: String },
	SendKeys { session: String, text: String },
	Pipe { session: String, path: PathBuf },
	StopPipe(String),
	Capture(String),
	Kill(String),
}

struct TerminalState {
	calls: Vec<TerminalCall>,
	pane: String,
	fail_ensure: bool,
	fail_pipe: bool,
	fail_send: bool,
	cancel_on_capture: Option<CancellationToken>,
}

pub struct FakeTerminal {
	state: Mutex<TerminalState>,
}

impl FakeTerminal {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(TerminalState {
				calls: Vec::new(),
				pane: String::new(),
				fail_ensure: false,
				fail_pipe: false,
				fail_send: false,
				cancel_on_capture: None,
			}),
		}
	}

	pub fn set_pane(&self, content: &str) {
		self.state.lock().unwrap().pane = content.to_string();
	}

	pub fn fail_ensure(&self, fail: bool) {
		self.state.lock().unwrap().fail_ensure = fail;
	}

	pub fn fail_pipe(&self, fail: bool) {
		self.state.lock().unwrap().fail_pipe = fail;
	}

	pub fn fail_send(&self, fail: bool) {
		self.state.lock().unwrap().fail_send = fail;
	}

	/// Cancel `token` while a capture is in flight.
	pub fn cancel_on_capture(&self, token: CancellationToken) {
		self.state.lock().unwrap().cancel_on_capture = Some(token);
	}

	pub fn calls(&self) -> Vec<TerminalCall> {
		self.state.lock().unwrap().calls.clone()
	}

	pub fn pipes(&self) -> usize {
		self.calls()
			.iter()
			.filter(|call| matches!(call, TerminalCall::Pipe { .. }))
			.count()
	}

	pub fn clear_calls(&self) {
		self.state.lock().unwrap().calls.clear();
	}

	pub fn sent_text(&self) -> Vec<String> {
		self.calls()
			.into_iter()
			.filter_map(|call| match call {
				TerminalCall::SendKeys { text, .. } => Some(text),
				_ => None,
			})
			.collect()
	}

	fn record(&self, call: TerminalCall) {
		self.state.lock().unwrap().calls.push(call);
	}
}

#[async_trait]
impl TerminalDriver for FakeTerminal {
	async fn ensure_session(&self, session: &str, _work_dir: &Path, command: &str) -> Result<()> {
		self.record(TerminalCall::Ensure {
			session: session.to_string(),
			command: command.to_string(),
		});
		if self.state.lock().unwrap().fail_ensure {
			anyhow::bail!("tmux new-session failed for {session}");
		}
		Ok(())
	}

	async fn send_keys(&self, session: &str, text: &str) -> Result<()> {
		self.record(TerminalCall::SendKeys {
			session: session.to_string(),
			text: text.to_string(),
		});
		if self.state.lock().unwrap().fail_send {
			anyhow::bail!("tmux send-keys failed for {session}");
		}
		Ok(())
	}

	async fn pipe_to_file(&self, session: &str, path: &Path) -> Result<()> {
		self.record(TerminalCall::Pipe {
			session: session.to_string(),
			path: path.to_path_buf(),
		});
		if self.state.lock().unwrap().fail_pipe {
			anyhow::bail!("tmux pipe-pane failed for {session}");
		}
		Ok(())
	}

	async fn stop_pipe(&self, session: &str) -> Result<()> {
		self.record(TerminalCall::StopPipe(session.to_string()));
		Ok(())
	}

	async fn capture_pane(&self, session: &str) -> Result<String> {
		self.record(TerminalCall::Capture(session.to_string()));
		let state = self.state.lock().unwrap();
		if let Some(token) = &state.cancel_on_capture {
			token.cancel();
		}
		Ok(state.pane.clone())
	}

	async fn kill_session(&self, session: &str) -> Result<()> {
		self.record(TerminalCall::Kill(session.to_string()));
		Ok(())
	}
}
