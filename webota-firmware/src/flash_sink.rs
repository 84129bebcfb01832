//! [`FlashSink`] over the ESP-IDF OTA partitions.
//!
//! The image is written to the next update partition. A successful `end`
//! validates it and makes it the boot partition; `abort` leaves the running
//! firmware untouched.

use anyhow::Result;
use esp_idf_svc::ota::EspOta;
use esp_idf_svc::sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, EspError,
    OTA_SIZE_UNKNOWN,
};
use log::{debug, info, warn};
use webota_lib::FlashSink;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum FlashError {
    #[display("no OTA update partition")]
    NoUpdatePartition,
    #[display("update region already reserved")]
    AlreadyBegun,
    #[display("no update region reserved")]
    NotBegun,
    #[display("{op}: {error}")]
    Esp { op: &'static str, error: EspError },
}

struct Reserved {
    handle: esp_ota_handle_t,
    partition: *const esp_partition_t,
}

#[derive(Default)]
pub struct EspFlashSink {
    reserved: Option<Reserved>,
}

// The partition pointer refers to the static partition table
unsafe impl Send for EspFlashSink {}

impl EspFlashSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn check(op: &'static str, code: i32) -> Result<(), FlashError> {
    esp!(code).map_err(|error| FlashError::Esp { op, error })
}

impl FlashSink for EspFlashSink {
    type Error = FlashError;

    fn begin(&mut self, expected_size: Option<usize>) -> Result<(), FlashError> {
        if self.reserved.is_some() {
            return Err(FlashError::AlreadyBegun);
        }

        let partition = unsafe { esp_ota_get_next_update_partition(std::ptr::null()) };
        if partition.is_null() {
            return Err(FlashError::NoUpdatePartition);
        }

        // A known size lets esp_ota_begin erase only what the image needs
        let size = expected_size.unwrap_or(OTA_SIZE_UNKNOWN as usize);
        let mut handle: esp_ota_handle_t = 0;
        check("esp_ota_begin", unsafe {
            esp_ota_begin(partition, size, &mut handle)
        })?;

        let label = unsafe { std::ffi::CStr::from_ptr((*partition).label.as_ptr()) };
        info!(
            "OTA: writing to partition {label:?} at 0x{:x}",
            unsafe { (*partition).address }
        );
        self.reserved = Some(Reserved { handle, partition });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, FlashError> {
        let reserved = self.reserved.as_ref().ok_or(FlashError::NotBegun)?;
        check("esp_ota_write", unsafe {
            esp_ota_write(reserved.handle, bytes.as_ptr().cast(), bytes.len())
        })?;
        Ok(bytes.len())
    }

    // esp_ota_end validates the image whether or not the caller asked to
    fn end(&mut self, _verify: bool) -> Result<(), FlashError> {
        let reserved = self.reserved.take().ok_or(FlashError::NotBegun)?;
        debug!("OTA: finalizing image");
        check("esp_ota_end", unsafe { esp_ota_end(reserved.handle) })?;
        check("esp_ota_set_boot_partition", unsafe {
            esp_ota_set_boot_partition(reserved.partition)
        })?;
        info!("OTA: new image set as boot partition");
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(reserved) = self.reserved.take() {
            if let Err(e) = check("esp_ota_abort", unsafe { esp_ota_abort(reserved.handle) }) {
                warn!("OTA: {e}");
            } else {
                info!("OTA: update region discarded");
            }
        }
    }
}

impl Drop for EspFlashSink {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Mark the currently running OTA slot as valid.
///
/// With rollback enabled (`CONFIG_BOOTLOADER_APP_ROLLBACK_ENABLE=y`) the
/// bootloader reverts to the previous image if this is never called.
pub fn mark_running_slot_valid() -> Result<()> {
    let mut ota = EspOta::new()?;
    ota.mark_running_slot_valid()?;
    info!("OTA: running slot marked valid");
    Ok(())
}
