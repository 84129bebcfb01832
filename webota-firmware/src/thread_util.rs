//! Helper for spawning threads with FreeRTOS task names
//!
//! Rust's `std::thread::Builder::name()` sets the pthread name after creation,
//! but ESP-IDF creates the FreeRTOS task at pthread creation time with the
//! default name. `ThreadSpawnConfiguration` sets the name before spawning.

use anyhow::Result;
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use std::ffi::CStr;
use std::thread::JoinHandle;

/// Stack for the helper threads; they only poll and log.
const STACK_SIZE: usize = 6 * 1024;

/// Spawn a thread with a FreeRTOS task name.
///
/// FreeRTOS task names are limited to 16 characters including the null terminator.
pub fn spawn_named<F, T>(name: &'static CStr, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let prev_conf = ThreadSpawnConfiguration::get();

    ThreadSpawnConfiguration {
        name: Some(name.to_bytes_with_nul()),
        stack_size: STACK_SIZE,
        ..Default::default()
    }
    .set()?;

    let handle = std::thread::Builder::new()
        .stack_size(STACK_SIZE)
        .spawn(f);

    // Restore the previous config even if the spawn failed
    ThreadSpawnConfiguration::set(&prev_conf.unwrap_or_default())?;

    Ok(handle?)
}
