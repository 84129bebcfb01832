//! Recording fakes shared by the unit tests.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::events::{UpdateObserver, UpdateSource};
use crate::service::{OtaService, OtaSettings};
use crate::session::UpdateError;
use crate::sink::FlashSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Begin(Option<usize>),
    Write(Vec<u8>),
    End(bool),
    Abort,
}

/// Sink that records every call and can be told to fail.
///
/// `fail_write_on` and `short_write_on` count write calls from 1.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub(crate) calls: Arc<Mutex<Vec<SinkCall>>>,
    pub fail_begin: bool,
    pub fail_write_on: Option<usize>,
    pub short_write_on: Option<usize>,
    pub fail_end: bool,
    pub(crate) writes: usize,
}

impl RecordingSink {
    pub fn calls(&self) -> Arc<Mutex<Vec<SinkCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: SinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl FlashSink for RecordingSink {
    type Error = String;

    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), Self::Error> {
        self.record(SinkCall::Begin(expected_size));
        self.writes = 0;
        if self.fail_begin {
            return Err("no update partition".to_string());
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        self.writes += 1;
        if self.fail_write_on == Some(self.writes) {
            self.record(SinkCall::Write(Vec::new()));
            return Err("flash write error".to_string());
        }
        if self.short_write_on == Some(self.writes) {
            let half = bytes.len() / 2;
            self.record(SinkCall::Write(bytes[..half].to_vec()));
            return Ok(half);
        }
        self.record(SinkCall::Write(bytes.to_vec()));
        Ok(bytes.len())
    }

    fn end(&mut self, verify: bool) -> Result<(), Self::Error> {
        self.record(SinkCall::End(verify));
        if self.fail_end {
            return Err("image verification failed".to_string());
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.record(SinkCall::Abort);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Start(UpdateSource, String),
    Progress(usize, Option<usize>),
    Error(UpdateSource, UpdateError),
    End(UpdateSource, bool),
    Connected(Ipv4Addr),
    Disconnected,
}

/// Observer that appends every event to a shared log.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    log: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingObserver {
    pub fn log(&self) -> Arc<Mutex<Vec<Seen>>> {
        Arc::clone(&self.log)
    }

    fn push(&self, seen: Seen) {
        self.log.lock().unwrap().push(seen);
    }
}

impl UpdateObserver for RecordingObserver {
    fn on_start(&mut self, source: UpdateSource, filename: &str) {
        self.push(Seen::Start(source, filename.to_string()));
    }

    fn on_progress(&mut self, written: usize, total: Option<usize>) {
        self.push(Seen::Progress(written, total));
    }

    fn on_error(&mut self, source: UpdateSource, error: &UpdateError) {
        self.push(Seen::Error(source, error.clone()));
    }

    fn on_end(&mut self, source: UpdateSource, success: bool) {
        self.push(Seen::End(source, success));
    }

    fn on_network_connected(&mut self, ip: Ipv4Addr) {
        self.push(Seen::Connected(ip));
    }

    fn on_network_disconnected(&mut self) {
        self.push(Seen::Disconnected);
    }
}

/// A service over a [`RecordingSink`] with one [`RecordingObserver`].
pub fn recording_service(
    password: &str,
    sink: RecordingSink,
) -> (
    OtaService<RecordingSink>,
    Arc<Mutex<Vec<SinkCall>>>,
    Arc<Mutex<Vec<Seen>>>,
) {
    let calls = sink.calls();
    let service = OtaService::new(
        OtaSettings {
            password: password.to_string(),
            ..OtaSettings::default()
        },
        sink,
    );
    let observer = RecordingObserver::default();
    let events = observer.log();
    service.subscribe(Box::new(observer));
    (service, calls, events)
}
