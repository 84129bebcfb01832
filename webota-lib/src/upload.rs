//! Drive an [`UpdateSession`] from an HTTP request body.
//!
//! [`UploadRequest`] handles browser form uploads: text fields are collected
//! until the first file part starts, then the `password` field seen so far is
//! presented to the session and the file contents are streamed into it.
//! [`PushRequest`] handles a raw image body with the password sent out of band.

use indexmap::IndexMap;
use log::{debug, warn};
use std::time::Duration;

use crate::events::UpdateSource;
use crate::multipart::{MultipartDecoder, MultipartError, Part};
use crate::service::OtaService;
use crate::session::{Outcome, UpdateSession, UploadEvent};
use crate::sink::FlashSink;
use crate::status::UploadResponse;

/// Name of the form field carrying the update password.
pub const PASSWORD_FIELD: &str = "password";

/// Text fields of a form upload, in arrival order.
pub type FormFields = IndexMap<String, String>;

/// Everything a handler needs once the body has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub outcome: Outcome,
    pub bytes_written: usize,
    /// Client-declared filename, if a file part was seen
    pub filename: Option<String>,
    pub response: UploadResponse,
    /// Set when the device should restart into the new image
    pub restart_after: Option<Duration>,
    /// SHA-256 of the committed image
    pub digest: Option<[u8; 32]>,
}

impl UploadReport {
    fn new<S: FlashSink>(session: &UpdateSession<'_, S>, response: UploadResponse) -> Self {
        let filename = (session.state() != &crate::session::SessionState::Idle)
            .then(|| session.declared_filename().to_string());
        Self {
            outcome: session.outcome(),
            bytes_written: session.bytes_written(),
            filename,
            response,
            restart_after: session.restart_after(),
            digest: session.image_digest(),
        }
    }

    /// Digest as lowercase hex, for logs and headers.
    #[must_use]
    pub fn digest_hex(&self) -> Option<String> {
        self.digest.map(hex::encode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilePart {
    /// No file part started yet
    Waiting,
    /// Streaming the first file part into the session
    Streaming,
    /// Inside a file part without a filename, which is ignored
    Ignoring,
    /// The first file part is complete
    Done,
}

/// A `multipart/form-data` upload in progress.
pub struct UploadRequest<'a, S: FlashSink> {
    session: UpdateSession<'a, S>,
    decoder: MultipartDecoder,
    fields: FormFields,
    file: FilePart,
    malformed: Option<MultipartError>,
}

impl<'a, S: FlashSink> UploadRequest<'a, S> {
    /// Validate the request headers and claim the update session.
    ///
    /// On error the returned response should be sent as is, without reading
    /// the body.
    pub fn new(service: &'a OtaService<S>, content_type: &str) -> Result<Self, UploadResponse> {
        let decoder = MultipartDecoder::from_content_type(content_type).map_err(|e| {
            warn!("OTA: rejecting upload: {e}");
            UploadResponse::malformed(&e)
        })?;
        let session = service
            .open_session(UpdateSource::Web)
            .map_err(|e| UploadResponse::for_error(&e))?;
        Ok(Self {
            session,
            decoder,
            fields: FormFields::new(),
            file: FilePart::Waiting,
            malformed: None,
        })
    }

    /// Feed the next piece of the body.
    pub fn feed(&mut self, data: &[u8]) {
        if self.malformed.is_some() {
            return;
        }

        let Self {
            session,
            decoder,
            fields,
            file,
            ..
        } = self;
        let result = decoder.feed(data, |part| match part {
            Part::Field { name, value } => {
                debug!("OTA: form field '{name}' ({} bytes)", value.len());
                fields.insert(name, value);
            }
            Part::FileStart { name, filename } => match *file {
                FilePart::Waiting | FilePart::Ignoring if filename.is_empty() => {
                    warn!("OTA: ignoring file part '{name}' without a filename");
                    *file = FilePart::Ignoring;
                }
                FilePart::Waiting | FilePart::Ignoring => {
                    *file = FilePart::Streaming;
                    session.handle(UploadEvent::Start {
                        password: fields.get(PASSWORD_FIELD).map(String::as_str),
                        filename: &filename,
                        expected_size: None,
                    });
                }
                _ => {
                    warn!("OTA: ignoring extra file part '{name}' ({filename})");
                    if *file == FilePart::Streaming {
                        *file = FilePart::Done;
                    }
                }
            },
            Part::FileData(bytes) => {
                if *file == FilePart::Streaming {
                    session.handle(UploadEvent::Chunk(bytes));
                }
            }
            Part::FileEnd => match *file {
                FilePart::Streaming => {
                    session.handle(UploadEvent::End);
                    *file = FilePart::Done;
                }
                FilePart::Ignoring => *file = FilePart::Waiting,
                FilePart::Waiting | FilePart::Done => {}
            },
        });

        if let Err(e) = result {
            if self.session.is_terminal() {
                debug!("OTA: ignoring malformed bytes after the update finished: {e}");
            } else {
                warn!("OTA: malformed upload body: {e}");
                self.session.handle(UploadEvent::Abort);
            }
            self.malformed = Some(e);
        }
    }

    /// The transport failed before the body was complete.
    pub fn abort(&mut self) {
        self.session.handle(UploadEvent::Abort);
    }

    /// Whether the session already reached a final state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.session.is_terminal()
    }

    #[must_use]
    pub fn fields(&self) -> &FormFields {
        &self.fields
    }

    /// Close the request and release the session.
    #[must_use]
    pub fn finish(mut self) -> UploadReport {
        if self.malformed.is_none() && !self.session.is_terminal() {
            if let Err(e) = self.decoder.finish() {
                warn!("OTA: upload body incomplete: {e}");
                self.session.handle(UploadEvent::Abort);
                self.malformed = Some(e);
            }
        }

        // A committed image stands even if the bytes after it were bad
        let response = match (self.session.outcome(), &self.malformed) {
            (outcome @ Outcome::Succeeded, _) => UploadResponse::for_outcome(&outcome),
            (Outcome::Failed(e), _) => UploadResponse::for_error(&e),
            (_, Some(e)) => UploadResponse::malformed(e),
            (outcome, None) => UploadResponse::for_outcome(&outcome),
        };
        UploadReport::new(&self.session, response)
    }
}

/// A raw image pushed in the request body.
pub struct PushRequest<'a, S: FlashSink> {
    session: UpdateSession<'a, S>,
}

impl<'a, S: FlashSink> PushRequest<'a, S> {
    /// Claim the update session and check the password.
    ///
    /// A rejected password is reported by [`PushRequest::finish`].
    pub fn new(
        service: &'a OtaService<S>,
        password: Option<&str>,
        expected_size: Option<usize>,
    ) -> Result<Self, UploadResponse> {
        let mut session = service
            .open_session(UpdateSource::Push)
            .map_err(|e| UploadResponse::for_error(&e))?;
        session.handle(UploadEvent::Start {
            password,
            filename: "",
            expected_size,
        });
        Ok(Self { session })
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.session.handle(UploadEvent::Chunk(data));
    }

    pub fn abort(&mut self) {
        self.session.handle(UploadEvent::Abort);
    }

    /// Whether the session already reached a final state, so the rest of
    /// the body can be skipped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.session.is_terminal()
    }

    #[must_use]
    pub fn finish(mut self) -> UploadReport {
        self.session.handle(UploadEvent::End);
        let response = UploadResponse::for_outcome(&self.session.outcome());
        UploadReport::new(&self.session, response)
    }
}
