//! Per-task log file helpers.
//!
//! The terminal driver appends unattended output to the log; the orchestrator
//! only reads it after piping has been stopped (final text) or to hand the
//! unflushed tail to viewers as a backlog.

use reqwest::Client;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::control::ControlError;

/// Maximum number of characters reported as a task's final text.
pub const FINAL_TEXT_LIMIT: usize = 500;

/// Log file for an agent. Reused across tasks and truncated at task start.
pub fn log_path(dir: &Path, agent_id: &str) -> PathBuf {
	dir.join(format!("tsq-{agent_id}.log"))
}

/// Create or truncate the log so a new task starts from an empty file.
pub fn reset_log(path: &Path) -> io::Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	File::create(path)?;
	Ok(())
}

/// Trailing excerpt of the log, whitespace-trimmed. Unreadable logs yield an empty string.
pub fn extract_final_text(path: &Path) -> String {
	let data = match std::fs::read(path) {
		Ok(data) => data,
		Err(_) => return String::new(),
	};
	let text = String::from_utf8_lossy(&data);
	let text = text.trim();

	let count = text.chars().count();
	if count <= FINAL_TEXT_LIMIT {
		return text.to_string();
	}
	text.chars().skip(count - FINAL_TEXT_LIMIT).collect()
}

/// Split on `\n` only. Carriage returns stay in the line as the terminal wrote them.
pub fn split_lines(text: &str) -> Vec<String> {
	if text.is_empty() {
		return Vec::new();
	}
	let text = text.strip_suffix('\n').unwrap_or(text);
	text.split('\n').map(str::to_string).collect()
}

/// Output appended to the log since the last flush.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Backlog {
	pub lines: Vec<String>,
	/// Byte offset just past the returned content.
	pub end: u64,
}

/// Read the log from byte `offset` on. A missing log is an empty backlog.
pub fn read_backlog(path: &Path, offset: u64) -> io::Result<Backlog> {
	let mut file = match File::open(path) {
		Ok(file) => file,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			return Ok(Backlog {
				lines: Vec::new(),
				end: offset,
			})
		}
		Err(e) => return Err(e),
	};

	let len = file.metadata()?.len();
	// A truncated log starts over
	let start = if offset > len { 0 } else { offset };
	file.seek(SeekFrom::Start(start))?;

	let mut data = Vec::new();
	file.read_to_end(&mut data)?;

	Ok(Backlog {
		lines: split_lines(&String::from_utf8_lossy(&data)),
		end: start + data.len() as u64,
	})
}

/// PUT the file's bytes to a presigned URL. Non-2xx is a failure for this attempt only.
pub async fn upload_file(client: &Client, upload_url: &str, path: &Path) -> Result<(), ControlError> {
	let data = tokio::fs::read(path).await.map_err(|source| ControlError::Io {
		path: path.to_path_buf(),
		source,
	})?;

	let response = client
		.put(upload_url)
		.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
		.body(data)
		.send()
		.await
		.map_err(|e| ControlError::Upload(e.to_string()))?;

	if !response.status().is_success() {
		return Err(ControlError::Upload(format!("server returned {}", response.status())));
	}
	Ok(())
}
