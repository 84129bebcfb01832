//! Update and network notifications.
//!
//! Observers implement [`UpdateObserver`] and only override the events they
//! care about. The [`Dispatcher`] calls every subscribed observer synchronously,
//! in subscription order, on the thread that drives the session.

use log::{info, warn};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use crate::session::UpdateError;
use crate::status::format_bytes;

/// Which path an update arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// Browser form upload (`multipart/form-data`)
    #[display("web")]
    Web,
    /// Raw image pushed by a companion tool
    #[display("push")]
    Push,
}

/// Receives session transitions and network lifecycle events.
///
/// All methods default to doing nothing. A panicking observer is not caught:
/// the panic propagates into whatever drove the transition.
///
/// Callbacks run with the [`Dispatcher`]'s lock held. An observer must not
/// call back into the dispatcher or the service that owns it (subscribing,
/// starting an update, notifying), or the calling thread deadlocks. Hand
/// such work to another thread instead.
pub trait UpdateObserver: Send {
    fn on_start(&mut self, _source: UpdateSource, _filename: &str) {}

    /// `total` is the declared image size, when the client sent one.
    fn on_progress(&mut self, _written: usize, _total: Option<usize>) {}

    fn on_error(&mut self, _source: UpdateSource, _error: &UpdateError) {}

    fn on_end(&mut self, _source: UpdateSource, _success: bool) {}

    fn on_network_connected(&mut self, _ip: Ipv4Addr) {}

    fn on_network_disconnected(&mut self) {}
}

/// Fan-out of events to any number of observers.
#[derive(Default)]
pub struct Dispatcher {
    observers: Mutex<Vec<Box<dyn UpdateObserver>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("observers", &self.len())
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Observers are never replaced, only added.
    pub fn subscribe(&self, observer: Box<dyn UpdateObserver>) {
        self.lock().push(observer);
    }

    /// Drop every observer.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_start(&self, source: UpdateSource, filename: &str) {
        self.each(|o| o.on_start(source, filename));
    }

    pub fn notify_progress(&self, written: usize, total: Option<usize>) {
        self.each(|o| o.on_progress(written, total));
    }

    pub fn notify_error(&self, source: UpdateSource, error: &UpdateError) {
        self.each(|o| o.on_error(source, error));
    }

    pub fn notify_end(&self, source: UpdateSource, success: bool) {
        self.each(|o| o.on_end(source, success));
    }

    pub fn notify_network_connected(&self, ip: Ipv4Addr) {
        self.each(|o| o.on_network_connected(ip));
    }

    pub fn notify_network_disconnected(&self) {
        self.each(|o| o.on_network_disconnected());
    }

    /// Runs `f` on every observer under the lock; see [`UpdateObserver`].
    fn each(&self, mut f: impl FnMut(&mut dyn UpdateObserver)) {
        for observer in self.lock().iter_mut() {
            f(observer.as_mut());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn UpdateObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Progress is logged every this many bytes when the total size is unknown.
const UNKNOWN_SIZE_LOG_STEP: usize = 64 * 1024;

/// Observer that writes every event to the log.
///
/// Progress is throttled to 10% steps (or 64 KiB steps without a declared size).
#[derive(Debug, Default)]
pub struct LogObserver {
    last_step: usize,
}

impl UpdateObserver for LogObserver {
    fn on_start(&mut self, source: UpdateSource, filename: &str) {
        self.last_step = 0;
        info!("OTA: {source} update started ({filename})");
    }

    fn on_progress(&mut self, written: usize, total: Option<usize>) {
        match total {
            Some(total) if total > 0 => {
                let pct = written * 100 / total;
                if pct / 10 > self.last_step {
                    self.last_step = pct / 10;
                    info!("OTA: {written}/{total} bytes ({pct}%)");
                }
            }
            _ => {
                let step = written / UNKNOWN_SIZE_LOG_STEP;
                if step > self.last_step {
                    self.last_step = step;
                    info!("OTA: {} received", format_bytes(written));
                }
            }
        }
    }

    fn on_error(&mut self, source: UpdateSource, error: &UpdateError) {
        warn!("OTA: {source} update error: {error}");
    }

    fn on_end(&mut self, source: UpdateSource, success: bool) {
        if success {
            info!("OTA: {source} update complete");
        } else {
            warn!("OTA: {source} update ended without a new image");
        }
    }

    fn on_network_connected(&mut self, ip: Ipv4Addr) {
        info!("WiFi: connected, IP address {ip}");
    }

    fn on_network_disconnected(&mut self) {
        warn!("WiFi: disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingObserver, Seen};

    #[test]
    fn test_every_observer_sees_every_event() {
        let dispatcher = Dispatcher::new();
        let first = RecordingObserver::default();
        let second = RecordingObserver::default();
        let first_log = first.log();
        let second_log = second.log();
        dispatcher.subscribe(Box::new(first));
        dispatcher.subscribe(Box::new(second));
        assert_eq!(dispatcher.len(), 2);

        dispatcher.notify_start(UpdateSource::Web, "fw.bin");
        dispatcher.notify_progress(10, None);
        dispatcher.notify_progress(10, None);
        dispatcher.notify_end(UpdateSource::Web, true);

        let expected = vec![
            Seen::Start(UpdateSource::Web, "fw.bin".to_string()),
            Seen::Progress(10, None),
            Seen::Progress(10, None),
            Seen::End(UpdateSource::Web, true),
        ];
        assert_eq!(*first_log.lock().unwrap(), expected);
        assert_eq!(*second_log.lock().unwrap(), expected);
    }

    #[test]
    fn test_network_events_are_relayed() {
        let dispatcher = Dispatcher::new();
        let observer = RecordingObserver::default();
        let log = observer.log();
        dispatcher.subscribe(Box::new(observer));

        dispatcher.notify_network_connected(Ipv4Addr::new(192, 168, 1, 50));
        dispatcher.notify_network_disconnected();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Seen::Connected(Ipv4Addr::new(192, 168, 1, 50)),
                Seen::Disconnected
            ]
        );
    }

    #[test]
    fn test_notify_from_several_threads() {
        let dispatcher = std::sync::Arc::new(Dispatcher::new());
        let observer = RecordingObserver::default();
        let log = observer.log();
        dispatcher.subscribe(Box::new(observer));

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    for written in 0..25 {
                        dispatcher.notify_progress(i * 100 + written, None);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        // The lock is released after every dispatch
        dispatcher.subscribe(Box::new(RecordingObserver::default()));
        assert_eq!(dispatcher.len(), 2);
        assert_eq!(log.lock().unwrap().len(), 100);
    }

    #[test]
    fn test_clear_drops_observers() {
        let dispatcher = Dispatcher::new();
        let observer = RecordingObserver::default();
        let log = observer.log();
        dispatcher.subscribe(Box::new(observer));
        dispatcher.clear();
        assert!(dispatcher.is_empty());

        dispatcher.notify_end(UpdateSource::Push, false);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_log_observer_throttles_progress() {
        let mut observer = LogObserver::default();
        observer.on_start(UpdateSource::Web, "fw.bin");
        observer.on_progress(5, Some(100));
        assert_eq!(observer.last_step, 0);
        observer.on_progress(25, Some(100));
        assert_eq!(observer.last_step, 2);
        observer.on_progress(26, Some(100));
        assert_eq!(observer.last_step, 2);

        observer.on_start(UpdateSource::Web, "fw.bin");
        assert_eq!(observer.last_step, 0);
        observer.on_progress(UNKNOWN_SIZE_LOG_STEP * 3, None);
        assert_eq!(observer.last_step, 3);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(UpdateSource::Web.to_string(), "web");
        assert_eq!(UpdateSource::Push.to_string(), "push");
    }
}
