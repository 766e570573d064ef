//! Progress tracking over periodic terminal captures.
//!
//! Each capture is reduced to a SHA-256 digest. An agent counts as stuck once
//! the digest has stayed the same for longer than the configured timeout,
//! measured in wall-clock time from the last observed change.

use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

/// Digest of captured terminal text. Only ever compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
	pub fn of(content: &str) -> Self {
		Self(Sha256::digest(content.as_bytes()).into())
	}
}

/// Outcome of feeding one capture to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
	/// Content differs from the previous capture; the timer was reset.
	Changed,
	/// Content is unchanged but still within the timeout.
	Unchanged,
	/// Content has been unchanged for longer than the timeout.
	Stuck,
}

#[derive(Debug)]
pub struct StuckDetector {
	timeout: Duration,
	prev_hash: Option<ContentHash>,
	stuck_since: Instant,
}

impl StuckDetector {
	pub fn new(timeout: Duration) -> Self {
		Self {
			timeout,
			prev_hash: None,
			stuck_since: Instant::now(),
		}
	}

	/// Restart the timer from `now`, keeping the last digest.
	pub fn reset(&mut self, now: Instant) {
		self.stuck_since = now;
	}

	/// Forget the last digest and restart the timer.
	pub fn clear(&mut self, now: Instant) {
		self.prev_hash = None;
		self.stuck_since = now;
	}

	pub fn observe(&mut self, hash: ContentHash, now: Instant) -> Progress {
		if self.prev_hash != Some(hash) {
			self.prev_hash = Some(hash);
			self.stuck_since = now;
			return Progress::Changed;
		}

		if now.saturating_duration_since(self.stuck_since) > self.timeout {
			Progress::Stuck
		} else {
			Progress::Unchanged
		}
	}

	pub fn unchanged_for(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.stuck_since)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECOND: Duration = Duration::from_secs(1);

	#[test]
	fn test_hash_equality() {
		assert_eq!(ContentHash::of("abc"), ContentHash::of("abc"));
		assert_ne!(ContentHash::of("abc"), ContentHash::of("abd"));
	}

	#[test]
	fn test_first_capture_counts_as_change() {
		let start = Instant::now();
		let mut detector = StuckDetector::new(10 * SECOND);
		assert_eq!(detector.observe(ContentHash::of(""), start), Progress::Changed);
	}

	#[test]
	fn test_fires_on_first_tick_past_timeout() {
		let start = Instant::now();
		let mut detector = StuckDetector::new(10 * SECOND);
		let hash = ContentHash::of("$ waiting");

		assert_eq!(detector.observe(hash, start), Progress::Changed);
		for tick in 1..=10 {
			assert_eq!(
				detector.observe(hash, start + tick * SECOND),
				Progress::Unchanged,
				"tick {tick} must not fire"
			);
		}
		assert_eq!(detector.observe(hash, start + 11 * SECOND), Progress::Stuck);
	}

	#[test]
	fn test_changing_content_never_fires() {
		let start = Instant::now();
		let mut detector = StuckDetector::new(10 * SECOND);

		// Ticks spaced right at the timeout boundary, content changing each time
		for tick in 0..20u32 {
			let hash = ContentHash::of(&format!("line {tick}"));
			let now = start + tick * 10 * SECOND + Duration::from_millis(999);
			assert_eq!(detector.observe(hash, now), Progress::Changed);
		}
	}

	#[test]
	fn test_reset_restarts_timer() {
		let start = Instant::now();
		let mut detector = StuckDetector::new(10 * SECOND);
		let hash = ContentHash::of("same");

		detector.observe(hash, start);
		detector.reset(start + 9 * SECOND);

		assert_eq!(detector.observe(hash, start + 15 * SECOND), Progress::Unchanged);
		assert_eq!(detector.observe(hash, start + 20 * SECOND), Progress::Stuck);
		assert_eq!(detector.unchanged_for(start + 20 * SECOND), 11 * SECOND);
	}

	#[test]
	fn test_clear_forgets_digest() {
		let start = Instant::now();
		let mut detector = StuckDetector::new(SECOND);
		let hash = ContentHash::of("same");

		detector.observe(hash, start);
		detector.clear(start + 5 * SECOND);

		assert_eq!(detector.observe(hash, start + 10 * SECOND), Progress::Changed);
	}
}
