//! What the device tells the outside world: HTTP responses for upload
//! outcomes, the upload page and the status report.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::{UpdateObserver, UpdateSource};
use crate::multipart::MultipartError;
use crate::session::{Outcome, UpdateError};

/// Upload page served at `/`.
pub const INDEX_HTML: &str = include_str!("index.html");

/// Status code and plain-text body for an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

impl UploadResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Map a finished (or never started) session to a response.
    ///
    /// `Pending` means no image part ever reached the session.
    #[must_use]
    pub fn for_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => Self::new(200, "Update successful! Device will restart..."),
            Outcome::Pending => Self::no_file(),
            Outcome::Failed(error) => Self::for_error(error),
            Outcome::Aborted => Self::for_error(&UpdateError::AbortedByClient),
        }
    }

    #[must_use]
    pub fn for_error(error: &UpdateError) -> Self {
        match error {
            UpdateError::Auth => Self::new(401, "Unauthorized: Invalid password"),
            UpdateError::Busy => Self::busy(),
            other => Self::new(500, format!("Update failed: {other}")),
        }
    }

    #[must_use]
    pub fn busy() -> Self {
        Self::new(409, "Update already in progress")
    }

    #[must_use]
    pub fn no_file() -> Self {
        Self::new(400, "Bad request: no firmware file in request")
    }

    #[must_use]
    pub fn malformed(error: &MultipartError) -> Self {
        Self::new(400, format!("Bad request: {error}"))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Coarse update state for the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Receiving,
    Succeeded,
    Failed,
}

/// What the [`StatusTracker`] has seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub source: Option<UpdateSource>,
    pub filename: Option<String>,
    pub bytes_written: usize,
    pub expected_size: Option<usize>,
    pub last_error: Option<String>,
    pub updates_succeeded: u32,
    pub updates_failed: u32,
    pub ip: Option<Ipv4Addr>,
}

/// Observer that keeps an [`UpdateStatus`] for the status endpoint.
///
/// Clones share the same state: subscribe one clone and read from another.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    state: Arc<Mutex<UpdateStatus>>,
}

impl StatusTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> UpdateStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, UpdateStatus> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateObserver for StatusTracker {
    fn on_start(&mut self, source: UpdateSource, filename: &str) {
        let mut state = self.lock();
        state.phase = UpdatePhase::Receiving;
        state.source = Some(source);
        state.filename = (!filename.is_empty()).then(|| filename.to_string());
        state.bytes_written = 0;
        state.expected_size = None;
        state.last_error = None;
    }

    fn on_progress(&mut self, written: usize, total: Option<usize>) {
        let mut state = self.lock();
        state.bytes_written = written;
        state.expected_size = total;
    }

    fn on_error(&mut self, source: UpdateSource, error: &UpdateError) {
        let mut state = self.lock();
        state.source = Some(source);
        state.last_error = Some(error.to_string());
        if state.phase != UpdatePhase::Receiving {
            // Rejected before streaming, so no end event follows
            state.phase = UpdatePhase::Failed;
            state.updates_failed += 1;
        }
    }

    fn on_end(&mut self, _source: UpdateSource, success: bool) {
        let mut state = self.lock();
        if success {
            state.phase = UpdatePhase::Succeeded;
            state.updates_succeeded += 1;
        } else {
            state.phase = UpdatePhase::Failed;
            state.updates_failed += 1;
            state
                .last_error
                .get_or_insert_with(|| UpdateError::AbortedByClient.to_string());
        }
    }

    fn on_network_connected(&mut self, ip: Ipv4Addr) {
        self.lock().ip = Some(ip);
    }

    fn on_network_disconnected(&mut self) {
        self.lock().ip = None;
    }
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub version: String,
    pub hostname: String,
    pub update_in_progress: bool,
    pub uptime_s: u64,
    /// Filled in on the device only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<u32>,
    pub bytes_written_human: String,
    #[serde(flatten)]
    pub update: UpdateStatus,
}

impl StatusReport {
    #[must_use]
    pub fn new(hostname: &str, update_in_progress: bool, uptime_s: u64, update: UpdateStatus) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            hostname: hostname.to_string(),
            update_in_progress,
            uptime_s,
            free_heap: None,
            bytes_written_human: format_bytes(update.bytes_written),
            update,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Human-readable byte count: `"512 B"`, `"1.50 KB"`, `"2.00 MB"`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    }
}
