//! Live streaming of terminal output while someone is watching.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::artifact::split_lines;
use crate::control::{ControlPlane, PushKind};
use crate::stuck::ContentHash;
use crate::tmux::TerminalDriver;

/// Captures the pane on a fixed interval and pushes it whenever it changed.
pub struct LiveStreamer {
	pub agent_id: String,
	pub session: String,
	pub interval: Duration,
	pub control: Arc<dyn ControlPlane>,
	pub terminal: Arc<dyn TerminalDriver>,
}

impl LiveStreamer {
	pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(self.run(cancel))
	}

	async fn run(self, cancel: CancellationToken) {
		let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// Fresh per activation, so the first capture always goes out
		let mut prev: Option<ContentHash> = None;

		debug!(agent = %self.agent_id, "live stream started");
		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}

			let content = match self.terminal.capture_pane(&self.session).await {
				Ok(content) => content,
				Err(e) => {
					debug!(agent = %self.agent_id, error = %e, "live capture failed");
					continue;
				}
			};

			let hash = ContentHash::of(&content);
			if prev == Some(hash) {
				continue;
			}
			prev = Some(hash);

			if cancel.is_cancelled() {
				break;
			}
			let lines = split_lines(&content);
			if let Err(e) = self.control.push_lines(&self.agent_id, PushKind::Line, &lines).await {
				debug!(agent = %self.agent_id, error = %e, "live push failed");
			}
		}
		debug!(agent = %self.agent_id, "live stream stopped");
	}
}
