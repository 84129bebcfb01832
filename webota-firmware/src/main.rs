use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use webota_lib::{LogObserver, OtaService, StatusTracker};

mod config;
mod flash_sink;
mod network;
mod thread_util;
mod watchdog;
mod web_server;

use config::ConfigStore;
use flash_sink::EspFlashSink;
use web_server::State;

/// Pause before restarting when the station never came up.
const NO_NETWORK_RESTART_DELAY: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!(
        "Starting webota firmware {} ({})",
        webota_lib::VERSION,
        env!("GIT_VERSION")
    );

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let store = ConfigStore::new(nvs.clone())?;
    let config = store.load_or_default();

    // Apply configured log level
    {
        let level = config.level_filter();
        // Set for all targets (use "*" for global)
        if let Err(e) = esp_idf_svc::log::set_target_level("*", level) {
            warn!("Failed to set log level: {e}");
        } else {
            info!("Log level set to {level:?}");
        }
    }

    // Reaching this point means the image boots; keep it
    if let Err(e) = flash_sink::mark_running_slot_valid() {
        warn!("Failed to mark running slot valid: {e}");
    }

    let service = Arc::new(OtaService::new(config.ota_settings(), EspFlashSink::new()));
    let tracker = StatusTracker::new();
    service.subscribe(Box::new(LogObserver::default()));
    service.subscribe(Box::new(tracker.clone()));

    info!("Initializing WiFi...");
    let (wifi, ip) = match network::connect(peripherals.modem, sys_loop, nvs, &config) {
        Ok(connected) => connected,
        Err(e) => {
            error!("{e}");
            web_server::schedule_restart(NO_NETWORK_RESTART_DELAY);
            loop {
                FreeRtos::delay_ms(1000);
            }
        }
    };
    service.notify_network_connected(ip);
    network::spawn_monitor(wifi, service.clone(), config.port, Some(ip))?;

    let _mdns = if config.mdns_enabled {
        network::setup_mdns(&config.hostname, config.port)
    } else {
        None
    };

    let port = config.port;
    let state = Arc::new(State {
        service,
        config: Mutex::new(config),
        store,
        tracker,
        started: Instant::now(),
    });
    web_server::start_server(&state, port)?;

    info!("All systems running!");

    // Main loop - keep alive
    loop {
        FreeRtos::delay_ms(1000);
    }
}
