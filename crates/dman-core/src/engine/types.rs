//! Shared types for the coordinator, worker, and splitter.

use std::time::Duration;

/// Errors a download can terminate with. `Paused` is not a failure: it is the
/// sentinel the coordinator reports after an external `stop()` quiesces.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download paused")]
    Paused,
    #[error("server does not support resuming this download")]
    NotResumable,
    #[error("server content changed since the download was last run")]
    ServerChanged,
    #[error("unexpected HTTP response: {0}")]
    BadResponse(u32),
    #[error("server sent bad data (content-length mismatch)")]
    BadData,
    #[error("network error: {0}")]
    Transport(String),
    #[error("local I/O error: {0}")]
    LocalIo(String),
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::LocalIo(e.to_string())
    }
}

impl From<curl::Error> for DownloadError {
    fn from(e: curl::Error) -> Self {
        DownloadError::Transport(e.to_string())
    }
}

/// One byte range assigned to a worker, as tracked by the coordinator.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub offset: u64,
    pub length: u64,
    pub received: u64,
}

/// A candidate new job produced by the splitter, awaiting the coordinator's
/// accept/reject decision.
#[derive(Debug, Clone, Copy)]
pub struct SplitCandidate {
    pub donor_offset: u64,
    pub new_offset: u64,
    pub new_length: u64,
}

/// The filename and content-length the coordinator resolved from the
/// server's (or, on resume, the descriptor's) response, sent once a download
/// starts streaming.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub filename: String,
    pub content_length: Option<u64>,
}

/// A status snapshot emitted at most once per `STAT_INTERVAL`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub id: i64,
    pub rebuilding: bool,
    pub speed: String,
    pub written: String,
    pub percent: f64,
    pub conns: usize,
    pub eta: String,
}

/// Formats a byte count using 1024-based units, two decimal places.
pub fn human_size(bytes: f64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Formats a duration as `H:MM:SS`, clamping absurdly long etas to `LONG_TIME`.
pub fn human_eta(d: Duration) -> String {
    let d = d.min(super::tunables::LONG_TIME);
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
