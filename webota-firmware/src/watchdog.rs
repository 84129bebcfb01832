//! Task watchdog registration for long-running threads.

use esp_idf_svc::sys::{
    esp, esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t, EspError,
};
use log::{debug, error};
use std::ffi::CStr;

/// A registered watchdog user. Unregisters on drop.
pub struct WatchdogHandle {
    handle: esp_task_wdt_user_handle_t,
    name: &'static CStr,
}

// The handle is an opaque token owned by this value
unsafe impl Send for WatchdogHandle {}

impl WatchdogHandle {
    /// Register a new watchdog user, e.g. `c"net_monitor"`.
    pub fn register(name: &'static CStr) -> Result<Self, EspError> {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();
        esp!(unsafe { esp_task_wdt_add_user(name.as_ptr(), &mut handle) })?;
        debug!("Watchdog: registered user {name:?}");
        Ok(Self { handle, name })
    }

    /// Must be called within the watchdog timeout.
    pub fn feed(&self) {
        if let Err(e) = esp!(unsafe { esp_task_wdt_reset_user(self.handle) }) {
            error!("Watchdog: failed to feed {:?}: {e}", self.name);
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        debug!("Watchdog: unregistering user {:?}", self.name);
        if let Err(e) = esp!(unsafe { esp_task_wdt_delete_user(self.handle) }) {
            error!("Watchdog: failed to unregister {:?}: {e}", self.name);
        }
    }
}
