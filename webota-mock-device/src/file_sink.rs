//! [`FlashSink`] backed by a file on the host.
//!
//! Bytes go to `<output>.part` while an update is in flight; a successful
//! `end` renames it over `<output>`, `abort` removes it. The committed file
//! is what the device would have booted.

use log::{debug, info, warn};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use webota_lib::FlashSink;

#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum FileSinkError {
    #[display("update region already reserved")]
    AlreadyBegun,
    #[display("no update region reserved")]
    NotBegun,
    #[display("injected write failure on chunk {chunk}")]
    Injected { chunk: usize },
    #[display("image is {written} bytes, client declared {expected}")]
    SizeMismatch { written: usize, expected: usize },
    #[display("I/O error: {_0}")]
    #[from]
    Io(std::io::Error),
}

struct InFlight {
    file: File,
    expected: Option<usize>,
    written: usize,
    chunks: usize,
}

pub struct FileSink {
    output: PathBuf,
    staging: PathBuf,
    /// Fail the write of this 1-based chunk number
    fail_after: Option<usize>,
    in_flight: Option<InFlight>,
}

impl FileSink {
    pub fn new(output: impl Into<PathBuf>, fail_after: Option<usize>) -> Self {
        let output = output.into();
        let mut staging = output.clone().into_os_string();
        staging.push(".part");
        Self {
            output,
            staging: staging.into(),
            fail_after,
            in_flight: None,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl FlashSink for FileSink {
    type Error = FileSinkError;

    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), FileSinkError> {
        if self.in_flight.is_some() {
            return Err(FileSinkError::AlreadyBegun);
        }
        let file = File::create(&self.staging)?;
        debug!("Sink: staging image in {}", self.staging.display());
        self.in_flight = Some(InFlight {
            file,
            expected: expected_size,
            written: 0,
            chunks: 0,
        });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, FileSinkError> {
        let in_flight = self.in_flight.as_mut().ok_or(FileSinkError::NotBegun)?;
        in_flight.chunks += 1;
        if self.fail_after == Some(in_flight.chunks) {
            warn!("Sink: injecting failure on chunk {}", in_flight.chunks);
            return Err(FileSinkError::Injected {
                chunk: in_flight.chunks,
            });
        }
        in_flight.file.write_all(bytes)?;
        in_flight.written += bytes.len();
        Ok(bytes.len())
    }

    fn end(&mut self, verify: bool) -> Result<(), FileSinkError> {
        let mut in_flight = self.in_flight.take().ok_or(FileSinkError::NotBegun)?;
        in_flight.file.flush()?;
        drop(in_flight.file);

        if verify {
            if let Some(expected) = in_flight.expected {
                if expected != in_flight.written {
                    if let Err(e) = std::fs::remove_file(&self.staging) {
                        debug!("Sink: failed to remove {}: {e}", self.staging.display());
                    }
                    return Err(FileSinkError::SizeMismatch {
                        written: in_flight.written,
                        expected,
                    });
                }
            }
        }

        std::fs::rename(&self.staging, &self.output)?;
        info!(
            "Sink: committed {} bytes to {}",
            in_flight.written,
            self.output.display()
        );
        Ok(())
    }

    fn abort(&mut self) {
        if self.in_flight.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.staging) {
                warn!("Sink: failed to remove {}: {e}", self.staging.display());
            } else {
                info!("Sink: staged image discarded");
            }
        }
    }
}
