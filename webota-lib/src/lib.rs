//! Firmware upload sessions for network-updatable devices.
//!
//! This library contains everything about an over-the-air update that does not
//! depend on the radio, the HTTP server or the flash driver:
//!
//! - [`auth`]: password check for update requests
//! - [`config`]: JSON device configuration with defaults and validation
//! - [`sink`]: the four-operation contract of the flash update region
//! - [`guard`]: single-flight gate shared by every update path
//! - [`events`]: observer interface and dispatcher for update/network events
//! - [`session`]: the upload state machine
//! - [`service`]: the object a device keeps alive to open sessions
//! - [`multipart`]: streaming `multipart/form-data` decoder
//! - [`upload`]: glue from a request body (form or raw push) to a session
//! - [`status`]: responses, status report and the upload page
//!
//! A request flows decoder → [`upload::UploadRequest`] → [`session::UpdateSession`]
//! → [`sink::FlashSink`], with every transition fanned out through
//! [`events::Dispatcher`].

pub mod auth;
pub mod config;
pub mod events;
pub mod guard;
pub mod multipart;
pub mod service;
pub mod session;
pub mod sink;
pub mod status;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{is_valid_password, validate_password};
pub use config::{Config, ConfigError, LogLevel};
pub use events::{Dispatcher, LogObserver, UpdateObserver, UpdateSource};
pub use guard::{SessionGuard, SessionPermit};
pub use multipart::{MultipartDecoder, MultipartError};
pub use service::{OtaService, OtaSettings};
pub use session::{Outcome, SessionState, UpdateError, UpdateSession, UploadEvent};
pub use sink::{FlashSink, MemorySink};
pub use status::{format_bytes, StatusReport, StatusTracker, UpdateStatus, UploadResponse, INDEX_HTML};
pub use upload::{FormFields, PushRequest, UploadReport, UploadRequest};

/// Library version, reported in the status endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
