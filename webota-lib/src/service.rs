//! The update service: one instance per device, shared by every transport.

use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::events::{Dispatcher, UpdateObserver, UpdateSource};
use crate::guard::SessionGuard;
use crate::session::{UpdateError, UpdateSession};
use crate::sink::FlashSink;

/// Settings snapshot consumed by new sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSettings {
    /// Update password; empty disables authentication
    pub password: String,
    /// Grace period between a successful commit and the restart
    pub restart_delay: Duration,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            password: String::new(),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Owns the flash sink, the session guard and the observers.
///
/// Shared behind an `Arc` by the HTTP handlers and the network monitor.
pub struct OtaService<S> {
    settings: Mutex<OtaSettings>,
    guard: SessionGuard,
    dispatcher: Dispatcher,
    sink: Mutex<S>,
}

impl<S: FlashSink> OtaService<S> {
    #[must_use]
    pub fn new(settings: OtaSettings, sink: S) -> Self {
        Self::with_guard(settings, sink, SessionGuard::new())
    }

    /// Build a service around an existing guard, so other code can observe
    /// whether an update is running.
    #[must_use]
    pub fn with_guard(settings: OtaSettings, sink: S, guard: SessionGuard) -> Self {
        if settings.password.is_empty() {
            warn!("OTA: no update password configured, authentication disabled");
        }
        Self {
            settings: Mutex::new(settings),
            guard,
            dispatcher: Dispatcher::new(),
            sink: Mutex::new(sink),
        }
    }

    /// Start a new upload attempt.
    ///
    /// Fails with [`UpdateError::Busy`] while another session holds the guard.
    /// The sink is not touched in that case.
    pub fn open_session(&self, source: UpdateSource) -> Result<UpdateSession<'_, S>, UpdateError> {
        let Some(permit) = self.guard.try_acquire() else {
            warn!("OTA: rejecting {source} update, another update is in progress");
            return Err(UpdateError::Busy);
        };
        let settings = self.settings();
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(UpdateSession::new(
            sink,
            &self.dispatcher,
            settings.password,
            settings.restart_delay,
            source,
            permit,
        ))
    }

    /// Swap the settings used by future sessions.
    ///
    /// Refused with [`UpdateError::Busy`] while a session is active.
    pub fn replace_settings(&self, settings: OtaSettings) -> Result<(), UpdateError> {
        let Some(_permit) = self.guard.try_acquire() else {
            return Err(UpdateError::Busy);
        };
        *self.lock_settings() = settings;
        info!("OTA: settings updated");
        Ok(())
    }

    /// Run `f` with exclusive access to the sink, outside of any session.
    ///
    /// Fails with [`UpdateError::Busy`] while a session is active.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, UpdateError> {
        let Some(_permit) = self.guard.try_acquire() else {
            return Err(UpdateError::Busy);
        };
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut sink))
    }
}

impl<S> OtaService<S> {
    #[must_use]
    pub fn settings(&self) -> OtaSettings {
        self.lock_settings().clone()
    }

    #[must_use]
    pub fn is_update_in_progress(&self) -> bool {
        self.guard.is_active()
    }

    #[must_use]
    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self, observer: Box<dyn UpdateObserver>) {
        self.dispatcher.subscribe(observer);
    }

    pub fn notify_network_connected(&self, ip: Ipv4Addr) {
        self.dispatcher.notify_network_connected(ip);
    }

    pub fn notify_network_disconnected(&self) {
        self.dispatcher.notify_network_disconnected();
    }

    /// Drop all observers. Sessions keep working without notifications.
    pub fn shutdown(&self) {
        info!("OTA: service shutting down");
        self.dispatcher.clear();
    }

    fn lock_settings(&self) -> MutexGuard<'_, OtaSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
