use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
	Idle,
	Accumulating,
	Live,
	WaitingInput,
}

impl Mode {
	pub fn as_str(self) -> &'static str {
		match self {
			Mode::Idle => "idle",
			Mode::Accumulating => "accumulating",
			Mode::Live => "live",
			Mode::WaitingInput => "waiting_input",
		}
	}

	/// True while the agent is working on a task (output is being captured or streamed).
	pub fn is_working(self) -> bool {
		matches!(self, Mode::Accumulating | Mode::Live)
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A task assignment handed out by the control plane.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Task {
	pub id: String,
	#[serde(default)]
	pub subject: String,
	#[serde(default)]
	pub body: String,
}

impl Task {
	/// Text typed into the agent's terminal to kick off the task.
	pub fn prompt(&self) -> String {
		format!("{}\n\nTask ID: {}\n{}", self.subject, self.id, self.body)
	}
}

/// Instruction to continue a task that paused for human input.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Resume {
	#[serde(default)]
	pub message: Option<String>,
}

/// Point-in-time view of one agent, served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
	pub id: String,
	pub name: String,
	pub command: String,
	pub work_dir: PathBuf,
	pub session_name: String,
	pub mode: Mode,
	pub task_id: Option<String>,
	pub session_id: Option<String>,
	pub started_at: Option<DateTime<Utc>>,
	pub live: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_prompt_contains_subject_id_and_body() {
		let task = Task {
			id: "T1".to_string(),
			subject: "Fix bug".to_string(),
			body: "See issue".to_string(),
		};

		assert_eq!(task.prompt(), "Fix bug\n\nTask ID: T1\nSee issue");
	}

	#[test]
	fn test_task_without_text_fields() {
		let task: Task = serde_json::from_str(r#"{"id":"T9"}"#).unwrap();
		assert_eq!(task.subject, "");
		assert!(task.prompt().contains("Task ID: T9"));
	}

	#[test]
	fn test_mode_wire_names() {
		assert_eq!(serde_json::to_string(&Mode::WaitingInput).unwrap(), "\"waiting_input\"");
		assert_eq!(Mode::Accumulating.to_string(), "accumulating");
		assert!(Mode::Live.is_working());
		assert!(!Mode::WaitingInput.is_working());
	}
}
