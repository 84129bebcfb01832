//! The flash update region as seen by an upload session.

use std::fmt;

use log::debug;

/// Writable firmware update region.
///
/// Implementations wrap whatever the platform offers (ESP-IDF OTA partitions
/// on the device, memory or files on the host). A session calls the methods in
/// the order `begin`, `write`*, then exactly one of `end` or `abort`.
pub trait FlashSink {
    type Error: fmt::Display;

    /// Reserve the update region. `expected_size` is `None` when the total
    /// image size is not known up front.
    ///
    /// Fails if a previous region is still reserved.
    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), Self::Error>;

    /// Append `bytes` to the reserved region and return how many were accepted.
    ///
    /// Callers treat a short count as a failure.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error>;

    /// Finalize the region. On success the new image boots next.
    ///
    /// `verify` asks for the image to be checked before it is committed.
    /// Sinks whose finalization always validates may ignore it.
    fn end(&mut self, verify: bool) -> Result<(), Self::Error>;

    /// Discard the region. Must be safe to call in any state.
    fn abort(&mut self);
}

impl<S: FlashSink + ?Sized> FlashSink for Box<S> {
    type Error = S::Error;

    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), Self::Error> {
        (**self).begin(expected_size)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(bytes)
    }

    fn end(&mut self, verify: bool) -> Result<(), Self::Error> {
        (**self).end(verify)
    }

    fn abort(&mut self) {
        (**self).abort();
    }
}

/// Errors from [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum MemorySinkError {
    #[display("update region already reserved")]
    AlreadyBegun,
    #[display("no update region reserved")]
    NotBegun,
    #[display("region capacity of {capacity} bytes exceeded")]
    CapacityExceeded { capacity: usize },
    #[display("image is empty")]
    Empty,
    #[display("image has {actual} bytes but {expected} were declared")]
    SizeMismatch { expected: usize, actual: usize },
}

/// A [`FlashSink`] backed by memory.
///
/// Used by the host-side mock device and by tests. The committed image is kept
/// until the next `begin`.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    expected_size: Option<usize>,
    staging: Option<Vec<u8>>,
    committed: Option<Vec<u8>>,
}

impl MemorySink {
    /// Create a sink whose region holds at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            expected_size: None,
            staging: None,
            committed: None,
        }
    }

    /// Whether a region is currently reserved.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.staging.is_some()
    }

    /// The last image that was committed with `end`.
    #[must_use]
    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    /// Take the last committed image out of the sink.
    pub fn take_committed(&mut self) -> Option<Vec<u8>> {
        self.committed.take()
    }
}

impl FlashSink for MemorySink {
    type Error = MemorySinkError;

    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), Self::Error> {
        if self.staging.is_some() {
            return Err(MemorySinkError::AlreadyBegun);
        }
        if expected_size.is_some_and(|size| size > self.capacity) {
            return Err(MemorySinkError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        debug!("Memory sink: begin, expected={expected_size:?}");
        self.expected_size = expected_size;
        self.staging = Some(Vec::with_capacity(expected_size.unwrap_or(0)));
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        let staging = self.staging.as_mut().ok_or(MemorySinkError::NotBegun)?;
        if staging.len() + bytes.len() > self.capacity {
            return Err(MemorySinkError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        staging.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn end(&mut self, verify: bool) -> Result<(), Self::Error> {
        let image = self.staging.take().ok_or(MemorySinkError::NotBegun)?;
        if verify {
            if image.is_empty() {
                return Err(MemorySinkError::Empty);
            }
            if let Some(expected) = self.expected_size {
                if expected != image.len() {
                    return Err(MemorySinkError::SizeMismatch {
                        expected,
                        actual: image.len(),
                    });
                }
            }
        }
        debug!("Memory sink: committed {} bytes", image.len());
        self.committed = Some(image);
        Ok(())
    }

    fn abort(&mut self) {
        if self.staging.take().is_some() {
            debug!("Memory sink: region discarded");
        }
    }
}
