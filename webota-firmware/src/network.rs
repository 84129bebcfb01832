//! Wi-Fi station bring-up and connection monitoring.
//!
//! The monitor thread is the only source of network events: it polls the
//! station link once a second and tells the update service about transitions.

use anyhow::{bail, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::mdns::EspMdns;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use webota_lib::{FlashSink, OtaService};

use crate::config::Config;
use crate::thread_util::spawn_named;
use crate::watchdog::WatchdogHandle;

pub type Wifi = Arc<Mutex<BlockingWifi<EspWifi<'static>>>>;

const CONNECT_POLL: Duration = Duration::from_millis(500);
const MONITOR_INTERVAL_MS: u32 = 1000;

/// Configure the station and wait up to `wifi_timeout_ms` for an address.
pub fn connect(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    config: &Config,
) -> Result<(Wifi, Ipv4Addr)> {
    if config.wifi.ssid.is_empty() {
        bail!("WiFi SSID not configured");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
    if let Err(e) = esp_wifi.sta_netif_mut().set_hostname(&config.hostname) {
        warn!("WiFi: failed to set hostname {:?}: {e}", config.hostname);
    }
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let password = config.wifi.password.clone().unwrap_or_default();
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi
            .ssid
            .as_str()
            .try_into()
            .map_err(|()| anyhow::anyhow!("WiFi SSID too long"))?,
        password: password
            .as_str()
            .try_into()
            .map_err(|()| anyhow::anyhow!("WiFi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    info!("WiFi: connecting to '{}'...", config.wifi.ssid);
    if let Err(e) = wifi.wifi_mut().connect() {
        warn!("WiFi: connect request failed: {e}");
    }

    let timeout = Duration::from_millis(config.wifi_timeout_ms);
    let started = Instant::now();
    let ip = loop {
        if wifi.is_up().unwrap_or(false) {
            let ip = wifi.wifi().sta_netif().get_ip_info()?.ip;
            if !ip.is_unspecified() {
                break ip;
            }
        }
        if started.elapsed() >= timeout {
            bail!(
                "WiFi: no connection to '{}' after {} ms",
                config.wifi.ssid,
                config.wifi_timeout_ms
            );
        }
        std::thread::sleep(CONNECT_POLL);
    };

    info!("WiFi: connected to '{}', IP address {ip}", config.wifi.ssid);
    info!("Upload URL: http://{ip}:{}/", config.port);
    Ok((Arc::new(Mutex::new(wifi)), ip))
}

/// Current station address, if the link is up.
pub fn station_ip(wifi: &Wifi) -> Option<Ipv4Addr> {
    let wifi = wifi.lock().unwrap_or_else(PoisonError::into_inner);
    if !wifi.is_connected().unwrap_or(false) {
        return None;
    }
    wifi.wifi()
        .sta_netif()
        .get_ip_info()
        .ok()
        .map(|info| info.ip)
        .filter(|ip| !ip.is_unspecified())
}

/// Poll the link every second, reconnect when it drops and report
/// transitions to the service.
pub fn spawn_monitor<S>(wifi: Wifi, service: Arc<OtaService<S>>, port: u16, initial: Option<Ipv4Addr>) -> Result<()>
where
    S: FlashSink + Send + 'static,
{
    spawn_named(c"net_monitor", move || {
        let watchdog = match WatchdogHandle::register(c"net_monitor") {
            Ok(watchdog) => Some(watchdog),
            Err(e) => {
                warn!("WiFi: monitor runs without watchdog: {e}");
                None
            }
        };

        let mut last = initial;
        loop {
            FreeRtos::delay_ms(MONITOR_INTERVAL_MS);
            if let Some(watchdog) = &watchdog {
                watchdog.feed();
            }

            let current = station_ip(&wifi);
            match (last, current) {
                (None, Some(ip)) => {
                    info!("Upload URL: http://{ip}:{port}/");
                    service.notify_network_connected(ip);
                }
                (Some(_), None) => {
                    service.notify_network_disconnected();
                }
                (Some(old), Some(new)) if old != new => {
                    service.notify_network_disconnected();
                    service.notify_network_connected(new);
                }
                _ => {}
            }

            if current.is_none() {
                debug!("WiFi: link down, reconnecting");
                let mut wifi = wifi.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = wifi.wifi_mut().connect() {
                    debug!("WiFi: reconnect failed: {e}");
                }
            }
            last = current;
        }
    })?;
    Ok(())
}

/// Advertise the web server as `<hostname>.local`.
pub fn setup_mdns(hostname: &str, port: u16) -> Option<EspMdns> {
    match EspMdns::take() {
        Ok(mut mdns) => {
            if let Err(e) = mdns.set_hostname(hostname) {
                warn!("mDNS: failed to set hostname: {e:?}");
            }
            if let Err(e) = mdns.set_instance_name("Firmware update") {
                warn!("mDNS: failed to set instance name: {e:?}");
            }
            if let Err(e) = mdns.add_service(None, "_http", "_tcp", port, &[]) {
                warn!("mDNS: failed to add service: {e:?}");
            }
            info!("mDNS started: {hostname}.local");
            Some(mdns)
        }
        Err(e) => {
            warn!("Failed to start mDNS: {e:?}");
            None
        }
    }
}
