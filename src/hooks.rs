//! Inbound hook events from the driven agents, plus the local status API.
//!
//! Events are acknowledged as soon as they are parsed; the matching
//! transition runs in a spawned task so the receiver never waits on tmux or
//! the control plane.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::model::{AgentSnapshot, Mode};

/// Every configured agent, in configuration order. Owned by the process driver.
pub struct AgentRegistry {
	agents: Vec<Arc<Agent>>,
}

impl AgentRegistry {
	pub fn new(agents: Vec<Arc<Agent>>) -> Self {
		Self { agents }
	}

	#[cfg(test)]
	pub fn get(&self, id: &str) -> Option<&Arc<Agent>> {
		self.agents.iter().find(|agent| agent.id() == id)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Agent>> {
		self.agents.iter()
	}

	pub fn len(&self) -> usize {
		self.agents.len()
	}

	pub fn is_empty(&self) -> bool {
		self.agents.is_empty()
	}

	pub fn snapshots(&self) -> Vec<AgentSnapshot> {
		self.agents.iter().map(|agent| agent.snapshot()).collect()
	}

	/// Exact session match first, otherwise the first agent accepted by `fallback`.
	///
	/// The fallback tolerates events without a usable session id. With more
	/// than one busy agent it always picks the earliest in configuration order.
	fn route(&self, session_id: Option<&str>, fallback: impl Fn(Mode) -> bool) -> Option<Arc<Agent>> {
		if let Some(session_id) = session_id.filter(|id| !id.is_empty()) {
			if let Some(agent) = self
				.agents
				.iter()
				.find(|agent| agent.session_id().as_deref() == Some(session_id))
			{
				return Some(agent.clone());
			}
		}
		self.agents.iter().find(|agent| fallback(agent.mode())).cloned()
	}

	pub fn route_stop(&self, session_id: Option<&str>) -> Option<Arc<Agent>> {
		self.route(session_id, |mode| mode != Mode::Idle)
	}

	pub fn route_notification(&self, session_id: Option<&str>) -> Option<Arc<Agent>> {
		self.route(session_id, Mode::is_working)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopEvent {
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationEvent {
	#[serde(default)]
	pub message: String,
	#[serde(default)]
	pub session_id: Option<String>,
}

/// Routes hook events to agents and fires the transition without waiting on it.
#[derive(Clone)]
pub struct HookRouter {
	registry: Arc<AgentRegistry>,
}

impl HookRouter {
	pub fn new(registry: Arc<AgentRegistry>) -> Self {
		Self { registry }
	}

	pub fn registry(&self) -> &AgentRegistry {
		&self.registry
	}

	pub fn dispatch_stop(&self, event: StopEvent) -> Option<JoinHandle<()>> {
		let Some(agent) = self.registry.route_stop(event.session_id.as_deref()) else {
			debug!(session = ?event.session_id, "stop event matched no agent");
			return None;
		};
		info!(agent = %agent.id(), reason = ?event.stop_reason, "stop hook");
		Some(tokio::spawn(async move {
			if let Err(e) = agent.complete(event.stop_reason.as_deref()).await {
				warn!(agent = %agent.id(), error = %e, "completing task failed");
			}
		}))
	}

	pub fn dispatch_notification(&self, event: NotificationEvent) -> Option<JoinHandle<()>> {
		let Some(agent) = self.registry.route_notification(event.session_id.as_deref()) else {
			debug!(session = ?event.session_id, "notification matched no agent");
			return None;
		};
		info!(agent = %agent.id(), "needs-input hook");
		Some(tokio::spawn(async move {
			if let Err(e) = agent.wait_for_input(&event.message).await {
				warn!(agent = %agent.id(), error = %e, "pausing task failed");
			}
		}))
	}
}

/// API error response body
#[derive(Serialize)]
pub struct ApiError {
	pub error: String,
	pub code: String,
}

pub enum AppError {
	BadRequest(String),
}

impl IntoResponse for AppError {
	fn into_response(self) -> Response {
		let (status, code, message) = match self {
			AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
		};
		(
			status,
			Json(ApiError {
				error: message,
				code: code.to_string(),
			}),
		)
			.into_response()
	}
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
	serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid payload: {e}")))
}

pub fn router(hooks: HookRouter) -> Router {
	Router::new()
		.route("/hooks/stop", post(stop))
		.route("/hooks/notification", post(notification))
		.route("/status", get(status))
		.route("/health", get(health))
		.layer(TraceLayer::new_for_http())
		.with_state(hooks)
}

async fn stop(State(hooks): State<HookRouter>, body: Bytes) -> Result<StatusCode, AppError> {
	let event: StopEvent = parse(&body)?;
	hooks.dispatch_stop(event);
	Ok(StatusCode::OK)
}

async fn notification(State(hooks): State<HookRouter>, body: Bytes) -> Result<StatusCode, AppError> {
	let event: NotificationEvent = parse(&body)?;
	hooks.dispatch_notification(event);
	Ok(StatusCode::OK)
}

async fn status(State(hooks): State<HookRouter>) -> Json<Vec<AgentSnapshot>> {
	Json(hooks.registry().snapshots())
}

async fn health() -> Json<HealthResponse> {
	Json(HealthResponse {
		status: "ok".to_string(),
		version: env!("CARGO_PKG_VERSION").to_string(),
	})
}

#[derive(Serialize)]
struct HealthResponse {
	status: String,
	version: String,
}
