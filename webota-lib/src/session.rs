//! The upload state machine.
//!
//! ```text
//! Idle ──Start──► Authenticating ──ok──► Streaming ──End──► Finalizing ──ok──► Succeeded
//!                       │                   │  ▲                 │
//!                       │ bad password      │  └─Chunk           └─commit error──► Failed
//!                       │ begin error       │ write error ───────────────────────► Failed
//!                       └──────────────────────────────────────────────────────► Failed
//! Idle / Streaming / Finalizing ──Abort──► Aborted
//! ```
//!
//! Terminal states (`Succeeded`, `Failed`, `Aborted`) ignore every further
//! event. The session holds the [`SessionPermit`] until it reaches one of them.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::MutexGuard;
use std::time::Duration;

use crate::auth::validate_password;
use crate::events::{Dispatcher, UpdateSource};
use crate::guard::SessionPermit;
use crate::sink::FlashSink;

/// Why an update did not produce a new image.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum UpdateError {
    /// The presented password did not match the configured one
    #[display("invalid password")]
    Auth,
    /// The flash region could not be reserved
    #[display("flash begin failed: {reason}")]
    SinkBegin { reason: String },
    /// A chunk was rejected or only partially written
    #[display("flash write failed after {written} bytes: {reason}")]
    Write { written: usize, reason: String },
    /// The image could not be finalized or verified
    #[display("flash commit failed: {reason}")]
    Commit { reason: String },
    /// The client went away or cancelled the upload
    #[display("aborted by client")]
    AbortedByClient,
    /// Another update holds the session guard
    #[display("update already in progress")]
    Busy,
}

impl UpdateError {
    /// Short machine-readable tag for status reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::SinkBegin { .. } => "begin",
            Self::Write { .. } => "write",
            Self::Commit { .. } => "commit",
            Self::AbortedByClient => "aborted",
            Self::Busy => "busy",
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Authenticating,
    Streaming,
    Finalizing,
    Succeeded,
    Failed(UpdateError),
    Aborted,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Aborted)
    }
}

/// Final result of a session, as seen by the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No terminal state reached yet
    Pending,
    Succeeded,
    Failed(UpdateError),
    Aborted,
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The error behind this outcome, if any. Aborted sessions report
    /// [`UpdateError::AbortedByClient`].
    #[must_use]
    pub fn error(&self) -> Option<UpdateError> {
        match self {
            Self::Failed(e) => Some(e.clone()),
            Self::Aborted => Some(UpdateError::AbortedByClient),
            Self::Pending | Self::Succeeded => None,
        }
    }
}

/// Upload events, in the order the transport delivers them:
/// `Start`, `Chunk`*, then `End` or `Abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent<'e> {
    /// The image starts. `password` is whatever credential the transport
    /// decoded before the image, if any.
    Start {
        password: Option<&'e str>,
        filename: &'e str,
        expected_size: Option<usize>,
    },
    Chunk(&'e [u8]),
    End,
    Abort,
}

/// One firmware upload attempt.
///
/// Created by [`crate::OtaService::open_session`], which hands it the session
/// permit and exclusive access to the flash sink. Dropping a session that is
/// still streaming applies the `Abort` transition.
pub struct UpdateSession<'a, S: FlashSink> {
    sink: MutexGuard<'a, S>,
    observers: &'a Dispatcher,
    password: String,
    restart_delay: Duration,
    source: UpdateSource,
    permit: Option<SessionPermit>,
    state: SessionState,
    auth_checked: bool,
    auth_ok: bool,
    bytes_written: usize,
    expected_size: Option<usize>,
    declared_filename: String,
    hasher: Sha256,
    image_digest: Option<[u8; 32]>,
}

impl<'a, S: FlashSink> UpdateSession<'a, S> {
    pub(crate) fn new(
        sink: MutexGuard<'a, S>,
        observers: &'a Dispatcher,
        password: String,
        restart_delay: Duration,
        source: UpdateSource,
        permit: SessionPermit,
    ) -> Self {
        Self {
            sink,
            observers,
            password,
            restart_delay,
            source,
            permit: Some(permit),
            state: SessionState::Idle,
            auth_checked: false,
            auth_ok: false,
            bytes_written: 0,
            expected_size: None,
            declared_filename: String::new(),
            hasher: Sha256::new(),
            image_digest: None,
        }
    }

    /// Advance the state machine by one event.
    pub fn handle(&mut self, event: UploadEvent<'_>) {
        match event {
            UploadEvent::Start {
                password,
                filename,
                expected_size,
            } => self.start(password, filename, expected_size),
            UploadEvent::Chunk(bytes) => self.chunk(bytes),
            UploadEvent::End => self.end(),
            UploadEvent::Abort => self.abort(),
        }
    }

    fn start(&mut self, password: Option<&str>, filename: &str, expected_size: Option<usize>) {
        if self.state != SessionState::Idle {
            debug!("OTA: start ignored in state {:?}", self.state);
            return;
        }

        self.declared_filename = filename.to_string();
        self.expected_size = expected_size;
        self.bytes_written = 0;
        self.state = SessionState::Authenticating;

        self.auth_ok = validate_password(&self.password, password);
        self.auth_checked = true;
        if !self.auth_ok {
            warn!(
                "OTA: {} update rejected, password {}",
                self.source,
                if password.unwrap_or_default().is_empty() { "missing" } else { "mismatch" }
            );
            self.fail(UpdateError::Auth);
            return;
        }

        if let Err(e) = self.sink.begin(expected_size) {
            self.fail(UpdateError::SinkBegin {
                reason: e.to_string(),
            });
            return;
        }

        info!(
            "OTA: {} update streaming '{}' (size {})",
            self.source,
            self.declared_filename,
            expected_size.map_or_else(|| "unknown".to_string(), |s| s.to_string())
        );
        self.state = SessionState::Streaming;
        self.observers.notify_start(self.source, &self.declared_filename);
    }

    fn chunk(&mut self, bytes: &[u8]) {
        if self.state != SessionState::Streaming {
            // Covers "no credential decision yet" as well as terminal states
            debug!("OTA: dropping {} byte chunk in state {:?}", bytes.len(), self.state);
            return;
        }
        debug_assert!(self.auth_checked && self.auth_ok);
        if bytes.is_empty() {
            return;
        }

        match self.sink.write(bytes) {
            Ok(accepted) if accepted == bytes.len() => {
                self.bytes_written += accepted;
                self.hasher.update(bytes);
                self.observers
                    .notify_progress(self.bytes_written, self.expected_size);
            }
            Ok(accepted) => {
                let reason = format!("short write, {accepted} of {} bytes accepted", bytes.len());
                self.fail_streaming(reason);
            }
            Err(e) => self.fail_streaming(e.to_string()),
        }
    }

    fn end(&mut self) {
        if self.state != SessionState::Streaming {
            debug!("OTA: end ignored in state {:?}", self.state);
            return;
        }

        self.state = SessionState::Finalizing;
        info!("OTA: finalizing update ({} bytes written)", self.bytes_written);

        match self.sink.end(true) {
            Ok(()) => {
                let digest = std::mem::take(&mut self.hasher).finalize();
                let mut image_digest = [0u8; 32];
                image_digest.copy_from_slice(&digest);
                self.image_digest = Some(image_digest);
                info!(
                    "OTA: image committed, sha256 {}",
                    hex::encode(image_digest)
                );
                self.state = SessionState::Succeeded;
                self.observers.notify_end(self.source, true);
                self.release();
            }
            Err(e) => {
                let error = UpdateError::Commit {
                    reason: e.to_string(),
                };
                self.state = SessionState::Failed(error.clone());
                self.observers.notify_error(self.source, &error);
                self.observers.notify_end(self.source, false);
                self.release();
            }
        }
    }

    fn abort(&mut self) {
        let announced = match self.state {
            SessionState::Idle | SessionState::Authenticating => false,
            SessionState::Streaming | SessionState::Finalizing => true,
            SessionState::Succeeded | SessionState::Failed(_) | SessionState::Aborted => {
                debug!("OTA: abort ignored in state {:?}", self.state);
                return;
            }
        };

        self.sink.abort();
        warn!(
            "OTA: {} update aborted after {} bytes",
            self.source, self.bytes_written
        );
        self.state = SessionState::Aborted;
        if announced {
            self.observers.notify_end(self.source, false);
        }
        self.release();
    }

    /// Failure before anything reached the sink.
    fn fail(&mut self, error: UpdateError) {
        self.state = SessionState::Failed(error.clone());
        self.observers.notify_error(self.source, &error);
        self.release();
    }

    /// Failure with a reserved region: discard it and close the announced update.
    fn fail_streaming(&mut self, reason: String) {
        self.sink.abort();
        let error = UpdateError::Write {
            written: self.bytes_written,
            reason,
        };
        self.state = SessionState::Failed(error.clone());
        self.observers.notify_error(self.source, &error);
        self.observers.notify_end(self.source, false);
        self.release();
    }

    fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match &self.state {
            SessionState::Succeeded => Outcome::Succeeded,
            SessionState::Failed(e) => Outcome::Failed(e.clone()),
            SessionState::Aborted => Outcome::Aborted,
            SessionState::Idle
            | SessionState::Authenticating
            | SessionState::Streaming
            | SessionState::Finalizing => Outcome::Pending,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Bytes accepted by the sink so far.
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// The password decision, once one was made.
    #[must_use]
    pub fn auth_decision(&self) -> Option<bool> {
        self.auth_checked.then_some(self.auth_ok)
    }

    /// Filename as sent by the client. Informational only.
    #[must_use]
    pub fn declared_filename(&self) -> &str {
        &self.declared_filename
    }

    #[must_use]
    pub fn source(&self) -> UpdateSource {
        self.source
    }

    /// SHA-256 of the committed image.
    #[must_use]
    pub fn image_digest(&self) -> Option<[u8; 32]> {
        self.image_digest
    }

    /// How long to wait before restarting into the new image.
    ///
    /// `Some` only after a successful commit.
    #[must_use]
    pub fn restart_after(&self) -> Option<Duration> {
        (self.state == SessionState::Succeeded).then_some(self.restart_delay)
    }
}

impl<S: FlashSink> Drop for UpdateSession<'_, S> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SessionState::Streaming | SessionState::Finalizing
        ) {
            warn!("OTA: session dropped mid-upload");
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{OtaService, OtaSettings};
    use crate::testing::{recording_service as service_with, RecordingSink, Seen, SinkCall};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<SinkCall>>>;
    type Events = Arc<Mutex<Vec<Seen>>>;

    fn service(password: &str) -> (OtaService<RecordingSink>, Calls, Events) {
        service_with(password, RecordingSink::default())
    }

    fn start(password: Option<&str>) -> UploadEvent<'_> {
        UploadEvent::Start {
            password,
            filename: "firmware.bin",
            expected_size: None,
        }
    }

    fn writes(calls: &Calls) -> usize {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, SinkCall::Write(_)))
            .count()
    }

    #[test]
    fn test_successful_upload_scenario() {
        let (service, calls, events) = service("secret123");
        let chunk = [0xA5u8; 1024];
        let mut session = service.open_session(UpdateSource::Web).unwrap();

        session.handle(start(Some("secret123")));
        assert_eq!(session.state(), &SessionState::Streaming);
        for _ in 0..10 {
            session.handle(UploadEvent::Chunk(&chunk));
        }
        session.handle(UploadEvent::End);

        assert_eq!(session.outcome(), Outcome::Succeeded);
        assert_eq!(session.bytes_written(), 10240);
        assert_eq!(session.restart_after(), Some(OtaSettings::default().restart_delay));
        assert!(session.image_digest().is_some());
        assert!(!service.is_update_in_progress());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.first(), Some(&SinkCall::Begin(None)));
        assert_eq!(calls.last(), Some(&SinkCall::End(true)));
        assert_eq!(calls.len(), 12);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 12);
        assert_eq!(events[0], Seen::Start(UpdateSource::Web, "firmware.bin".to_string()));
        for (i, event) in events[1..11].iter().enumerate() {
            assert_eq!(*event, Seen::Progress((i + 1) * 1024, None));
        }
        assert_eq!(events[11], Seen::End(UpdateSource::Web, true));
    }

    #[test]
    fn test_chunks_reach_sink_in_order() {
        let (service, calls, _) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"one"));
        session.handle(UploadEvent::Chunk(b"two"));
        session.handle(UploadEvent::Chunk(b"three"));
        session.handle(UploadEvent::End);

        assert_eq!(session.bytes_written(), 11);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                SinkCall::Begin(None),
                SinkCall::Write(b"one".to_vec()),
                SinkCall::Write(b"two".to_vec()),
                SinkCall::Write(b"three".to_vec()),
                SinkCall::End(true),
            ]
        );
    }

    #[test]
    fn test_wrong_password_never_touches_sink() {
        let (service, calls, events) = service("secret123");
        let mut session = service.open_session(UpdateSource::Web).unwrap();

        session.handle(start(Some("")));
        assert_eq!(session.outcome(), Outcome::Failed(UpdateError::Auth));
        assert_eq!(session.auth_decision(), Some(false));

        session.handle(UploadEvent::Chunk(b"payload"));
        session.handle(UploadEvent::Chunk(b"payload"));
        session.handle(UploadEvent::End);

        assert_eq!(session.bytes_written(), 0);
        assert_eq!(session.outcome(), Outcome::Failed(UpdateError::Auth));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![Seen::Error(UpdateSource::Web, UpdateError::Auth)]
        );
        assert!(!service.is_update_in_progress());
        assert_eq!(session.restart_after(), None);
    }

    #[test]
    fn test_missing_password_with_secret_fails() {
        let (service, calls, _) = service("secret123");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        assert_eq!(session.outcome(), Outcome::Failed(UpdateError::Auth));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_auth_accepts_any_password() {
        for presented in [None, Some(""), Some("anything"), Some("secret123")] {
            let (service, _, _) = service("");
            let mut session = service.open_session(UpdateSource::Web).unwrap();
            session.handle(start(presented));
            assert_eq!(session.state(), &SessionState::Streaming, "presented={presented:?}");
            assert_eq!(session.auth_decision(), Some(true));
        }
    }

    #[test]
    fn test_chunks_before_start_are_dropped() {
        let (service, calls, _) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        assert_eq!(session.auth_decision(), None);
        session.handle(UploadEvent::Chunk(b"early"));
        session.handle(UploadEvent::End);
        assert_eq!(session.state(), &SessionState::Idle);
        assert_eq!(session.bytes_written(), 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_then_abort() {
        let (service, calls, events) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Abort);

        assert_eq!(session.outcome(), Outcome::Aborted);
        assert_eq!(session.outcome().error(), Some(UpdateError::AbortedByClient));
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls.iter().filter(|c| **c == SinkCall::Abort).count(),
            1
        );
        assert_eq!(writes_in(&calls), 0);
        assert!(!service.is_update_in_progress());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Seen::Start(UpdateSource::Web, "firmware.bin".to_string()),
                Seen::End(UpdateSource::Web, false),
            ]
        );
    }

    fn writes_in(calls: &[SinkCall]) -> usize {
        calls.iter().filter(|c| matches!(c, SinkCall::Write(_))).count()
    }

    #[test]
    fn test_abort_before_start_discards_without_events() {
        let (service, calls, events) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(UploadEvent::Abort);
        assert_eq!(session.outcome(), Outcome::Aborted);
        assert_eq!(*calls.lock().unwrap(), vec![SinkCall::Abort]);
        assert!(events.lock().unwrap().is_empty());
        assert!(!service.is_update_in_progress());
    }

    #[test]
    fn test_write_failure_on_chunk_five() {
        let sink = RecordingSink {
            fail_write_on: Some(5),
            ..RecordingSink::default()
        };
        let (service, calls, events) = service_with("secret123", sink);
        let chunk = [1u8; 1024];
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(Some("secret123")));
        for _ in 0..10 {
            session.handle(UploadEvent::Chunk(&chunk));
        }
        session.handle(UploadEvent::End);

        assert!(matches!(
            session.outcome(),
            Outcome::Failed(UpdateError::Write { written: 4096, .. })
        ));
        assert_eq!(session.bytes_written(), 4096);
        // Chunks 1-4 accepted, chunk 5 attempted, 6-10 never delivered
        assert_eq!(writes(&calls), 5);
        assert_eq!(calls.lock().unwrap().last(), Some(&SinkCall::Abort));
        assert!(!calls.lock().unwrap().contains(&SinkCall::End(true)));

        let events = events.lock().unwrap();
        let progress = events.iter().filter(|e| matches!(e, Seen::Progress(..))).count();
        assert_eq!(progress, 4);
        assert!(matches!(events[events.len() - 2], Seen::Error(_, UpdateError::Write { .. })));
        assert_eq!(events[events.len() - 1], Seen::End(UpdateSource::Web, false));
        assert!(!service.is_update_in_progress());
    }

    #[test]
    fn test_short_write_is_a_failure() {
        let sink = RecordingSink {
            short_write_on: Some(2),
            ..RecordingSink::default()
        };
        let (service, _, _) = service_with("", sink);
        let mut session = service.open_session(UpdateSource::Push).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"abcd"));
        session.handle(UploadEvent::Chunk(b"efgh"));
        session.handle(UploadEvent::Chunk(b"ijkl"));

        assert_eq!(session.bytes_written(), 4);
        match session.outcome() {
            Outcome::Failed(UpdateError::Write { written, reason }) => {
                assert_eq!(written, 4);
                assert!(reason.contains("short write"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_begin_failure() {
        let sink = RecordingSink {
            fail_begin: true,
            ..RecordingSink::default()
        };
        let (service, calls, events) = service_with("", sink);
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"data"));
        session.handle(UploadEvent::End);

        assert!(matches!(
            session.outcome(),
            Outcome::Failed(UpdateError::SinkBegin { .. })
        ));
        assert_eq!(*calls.lock().unwrap(), vec![SinkCall::Begin(None)]);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert!(!service.is_update_in_progress());
    }

    #[test]
    fn test_commit_failure() {
        let sink = RecordingSink {
            fail_end: true,
            ..RecordingSink::default()
        };
        let (service, _, events) = service_with("", sink);
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"data"));
        session.handle(UploadEvent::End);

        assert!(matches!(
            session.outcome(),
            Outcome::Failed(UpdateError::Commit { .. })
        ));
        assert_eq!(session.bytes_written(), 4);
        assert_eq!(session.restart_after(), None);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Seen::End(UpdateSource::Web, false))
        );
    }

    #[test]
    fn test_duplicate_end_is_a_noop() {
        let (service, calls, events) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"data"));
        session.handle(UploadEvent::End);

        let sink_calls = calls.lock().unwrap().len();
        let seen = events.lock().unwrap().len();
        session.handle(UploadEvent::End);
        session.handle(UploadEvent::Chunk(b"more"));
        session.handle(UploadEvent::Abort);
        session.handle(start(None));

        assert_eq!(session.outcome(), Outcome::Succeeded);
        assert_eq!(calls.lock().unwrap().len(), sink_calls);
        assert_eq!(events.lock().unwrap().len(), seen);
    }

    #[test]
    fn test_duplicate_end_after_failure_is_a_noop() {
        let sink = RecordingSink {
            fail_end: true,
            ..RecordingSink::default()
        };
        let (service, calls, events) = service_with("", sink);
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"data"));
        session.handle(UploadEvent::End);
        let sink_calls = calls.lock().unwrap().len();
        let seen = events.lock().unwrap().len();

        session.handle(UploadEvent::End);
        assert_eq!(calls.lock().unwrap().len(), sink_calls);
        assert_eq!(events.lock().unwrap().len(), seen);
    }

    #[test]
    fn test_second_session_is_rejected_while_active() {
        let (service, calls, _) = service("");
        let mut first = service.open_session(UpdateSource::Web).unwrap();
        first.handle(start(None));
        first.handle(UploadEvent::Chunk(b"abc"));

        assert!(matches!(
            service.open_session(UpdateSource::Push),
            Err(UpdateError::Busy)
        ));
        assert_eq!(
            calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| matches!(c, SinkCall::Begin(_)))
                .count(),
            1
        );

        first.handle(UploadEvent::Chunk(b"def"));
        first.handle(UploadEvent::End);
        assert_eq!(first.outcome(), Outcome::Succeeded);
        assert_eq!(first.bytes_written(), 6);
        drop(first);

        assert!(service.open_session(UpdateSource::Push).is_ok());
    }

    #[test]
    fn test_drop_mid_stream_aborts() {
        let (service, calls, events) = service("");
        {
            let mut session = service.open_session(UpdateSource::Web).unwrap();
            session.handle(start(None));
            session.handle(UploadEvent::Chunk(b"partial"));
        }
        assert_eq!(calls.lock().unwrap().last(), Some(&SinkCall::Abort));
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Seen::End(UpdateSource::Web, false))
        );
        assert!(!service.is_update_in_progress());
    }

    #[test]
    fn test_drop_idle_session_releases_guard() {
        let (service, calls, _) = service("");
        drop(service.open_session(UpdateSource::Web).unwrap());
        assert!(!service.is_update_in_progress());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_expected_size_is_forwarded() {
        let (service, calls, events) = service("");
        let mut session = service.open_session(UpdateSource::Push).unwrap();
        session.handle(UploadEvent::Start {
            password: None,
            filename: "push.bin",
            expected_size: Some(8),
        });
        session.handle(UploadEvent::Chunk(b"abcd"));
        assert_eq!(calls.lock().unwrap()[0], SinkCall::Begin(Some(8)));
        assert_eq!(events.lock().unwrap()[1], Seen::Progress(4, Some(8)));
        assert_eq!(session.declared_filename(), "push.bin");
        assert_eq!(session.source(), UpdateSource::Push);
    }

    #[test]
    fn test_image_digest_matches_written_bytes() {
        let (service, _, _) = service("");
        let mut session = service.open_session(UpdateSource::Web).unwrap();
        session.handle(start(None));
        session.handle(UploadEvent::Chunk(b"hello "));
        session.handle(UploadEvent::Chunk(b"world"));
        session.handle(UploadEvent::End);

        let expected = Sha256::digest(b"hello world");
        assert_eq!(
            session.image_digest().map(|d| d.to_vec()),
            Some(expected.to_vec())
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(UpdateError::Auth.kind(), "auth");
        assert_eq!(UpdateError::Busy.to_string(), "update already in progress");
        assert_eq!(
            UpdateError::Commit {
                reason: "bad image".to_string()
            }
            .to_string(),
            "flash commit failed: bad image"
        );
    }
}
