//! Client for the TaskSquad control plane.
//!
//! Every call is fire-and-forget from the orchestrator's point of view: an
//! error means "no effect this tick" and the next poll is the retry.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::artifact;
use crate::model::{Mode, Resume, Task};

const TOKEN_HEADER: &str = "X-TSQ-Token";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
	#[error("request to {path} failed: {source}")]
	Transport {
		path: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("{path} returned {status}")]
	Status { path: String, status: StatusCode },
	#[error("{path} response is missing {field}")]
	Malformed { path: String, field: &'static str },
	#[error("log upload failed: {0}")]
	Upload(String),
	#[error("failed to read {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat<'a> {
	pub agent_id: &'a str,
	pub team_id: &'a str,
	pub status: Mode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatResponse {
	#[serde(default)]
	pub task: Option<Task>,
	#[serde(default)]
	pub resume: Option<Resume>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
	Closed,
	WaitingInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionClose<'a> {
	pub session_id: &'a str,
	pub status: CloseStatus,
	pub final_text: &'a str,
}

/// Where to put the full log after a session closes.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CloseResponse {
	#[serde(default)]
	pub upload_url: Option<String>,
	#[serde(default)]
	pub key: Option<String>,
}

impl CloseResponse {
	pub fn upload_url(&self) -> Option<&str> {
		self.upload_url.as_deref().filter(|url| !url.is_empty())
	}
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushKind {
	/// Everything accumulated while nobody was watching.
	Backlog,
	/// Incremental live update.
	Line,
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion<'a> {
	pub task_id: &'a str,
	pub session_id: &'a str,
	pub agent_id: &'a str,
	pub final_text: &'a str,
	pub r2_log_key: Option<&'a str>,
	pub duration_ms: u64,
	pub success: bool,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
	async fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<HeartbeatResponse, ControlError>;

	/// Open a remote session for a task, returning its id.
	async fn open_session(&self, task_id: &str, agent_id: &str) -> Result<String, ControlError>;

	async fn close_session(&self, close: &SessionClose<'_>) -> Result<CloseResponse, ControlError>;

	async fn viewer_count(&self, agent_id: &str) -> Result<u32, ControlError>;

	async fn push_lines(
		&self,
		agent_id: &str,
		kind: PushKind,
		lines: &[String],
	) -> Result<(), ControlError>;

	async fn complete_task(&self, completion: &Completion<'_>) -> Result<(), ControlError>;

	/// Transfer the file at `path` to a presigned destination.
	async fn upload_log(&self, upload_url: &str, path: &Path) -> Result<(), ControlError>;
}

#[derive(Serialize)]
struct OpenSession<'a> {
	task_id: &'a str,
	agent_id: &'a str,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
	#[serde(default)]
	session_id: Option<String>,
}

#[derive(Deserialize)]
struct ViewerCount {
	#[serde(default)]
	count: Option<u32>,
}

#[derive(Serialize)]
struct Push<'a> {
	#[serde(rename = "type")]
	kind: PushKind,
	lines: &'a [String],
}

/// [`ControlPlane`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
	client: Client,
	base_url: String,
	token: String,
}

impl HttpControlPlane {
	pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
		let client = Client::builder()
			.user_agent(concat!("tsq/", env!("CARGO_PKG_VERSION")))
			.build()?;
		Ok(Self {
			client,
			base_url: base_url.trim_end_matches('/').to_string(),
			token: token.to_string(),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn send(
		&self,
		path: &str,
		request: reqwest::RequestBuilder,
	) -> Result<reqwest::Response, ControlError> {
		let response = request
			.header(TOKEN_HEADER, &self.token)
			.send()
			.await
			.map_err(|source| ControlError::Transport {
				path: path.to_string(),
				source,
			})?;

		if !response.status().is_success() {
			return Err(ControlError::Status {
				path: path.to_string(),
				status: response.status(),
			});
		}
		Ok(response)
	}

	async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
		&self,
		path: &str,
		body: &B,
	) -> Result<R, ControlError> {
		let response = self.send(path, self.client.post(self.url(path)).json(body)).await?;
		decode(path, response).await
	}

	async fn post_ignoring_body<B: Serialize + ?Sized>(
		&self,
		path: &str,
		body: &B,
	) -> Result<(), ControlError> {
		self.send(path, self.client.post(self.url(path)).json(body)).await?;
		Ok(())
	}
}

async fn decode<R: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<R, ControlError> {
	response.json().await.map_err(|source| ControlError::Transport {
		path: path.to_string(),
		source,
	})
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
	async fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<HeartbeatResponse, ControlError> {
		self.post("/daemon/heartbeat", beat).await
	}

	async fn open_session(&self, task_id: &str, agent_id: &str) -> Result<String, ControlError> {
		let path = "/daemon/session/open";
		let response: OpenSessionResponse = self.post(path, &OpenSession { task_id, agent_id }).await?;
		response
			.session_id
			.filter(|id| !id.is_empty())
			.ok_or(ControlError::Malformed {
				path: path.to_string(),
				field: "session_id",
			})
	}

	async fn close_session(&self, close: &SessionClose<'_>) -> Result<CloseResponse, ControlError> {
		self.post("/daemon/session/close", close).await
	}

	async fn viewer_count(&self, agent_id: &str) -> Result<u32, ControlError> {
		let path = format!("/daemon/viewers/{agent_id}");
		let response = self.send(&path, self.client.get(self.url(&path))).await?;
		let viewers: ViewerCount = decode(&path, response).await?;
		viewers.count.ok_or(ControlError::Malformed {
			path,
			field: "count",
		})
	}

	async fn push_lines(
		&self,
		agent_id: &str,
		kind: PushKind,
		lines: &[String],
	) -> Result<(), ControlError> {
		let path = format!("/daemon/push/{agent_id}");
		self.post_ignoring_body(&path, &Push { kind, lines }).await
	}

	async fn complete_task(&self, completion: &Completion<'_>) -> Result<(), ControlError> {
		self.post_ignoring_body("/daemon/complete", completion).await
	}

	async fn upload_log(&self, upload_url: &str, path: &Path) -> Result<(), ControlError> {
		artifact::upload_file(&self.client, upload_url, path).await
	}
}
