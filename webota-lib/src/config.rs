//! Device configuration, stored as JSON.
//!
//! The firmware keeps the blob in NVS, the mock device in a file. Both load it
//! through [`Config::from_json`], which fills in defaults and cleans up values
//! that would keep the device from coming up.

use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::is_valid_password;
use crate::service::OtaSettings;

/// Shown instead of stored secrets by [`Config::redacted`].
pub const REDACTED: &str = "********";

pub const MIN_WIFI_TIMEOUT_MS: u64 = 5_000;
pub const MAX_WIFI_TIMEOUT_MS: u64 = 120_000;
pub const MAX_RESTART_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum ConfigError {
    #[display("invalid config JSON: {reason}")]
    Json { reason: String },
    #[display("OTA password must be at most 64 printable ASCII characters")]
    InvalidPassword,
}

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Network hostname, also used for mDNS (`<hostname>.local`)
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub wifi: WifiConfig,
    /// Update password; empty disables authentication
    #[serde(default)]
    pub ota_password: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
    /// Forces debug logging
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    /// How long to wait for the network at boot
    #[serde(default = "default_wifi_timeout_ms")]
    pub wifi_timeout_ms: u64,
    /// Grace period between a successful update and the restart
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

fn default_hostname() -> String {
    "webota-esp32".to_string()
}

const fn default_port() -> u16 {
    80
}

const fn default_true() -> bool {
    true
}

const fn default_wifi_timeout_ms() -> u64 {
    30_000
}

const fn default_restart_delay_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            wifi: WifiConfig::default(),
            ota_password: String::new(),
            port: default_port(),
            mdns_enabled: true,
            verbose: false,
            log_level: LogLevel::default(),
            wifi_timeout_ms: default_wifi_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON blob.
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(json).map_err(|e| ConfigError::Json {
            reason: e.to_string(),
        })?;
        if !is_valid_password(&config.ota_password) {
            return Err(ConfigError::InvalidPassword);
        }
        config.validate();
        Ok(config)
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if !is_valid_hostname(&self.hostname) {
            warn!("Invalid hostname {:?}, resetting to default", self.hostname);
            self.hostname = default_hostname();
        }
        if self.port == 0 {
            warn!("Port 0 is not usable, resetting to {}", default_port());
            self.port = default_port();
        }
        let clamped = self
            .wifi_timeout_ms
            .clamp(MIN_WIFI_TIMEOUT_MS, MAX_WIFI_TIMEOUT_MS);
        if clamped != self.wifi_timeout_ms {
            warn!("Clamping wifi_timeout_ms from {} to {clamped}", self.wifi_timeout_ms);
            self.wifi_timeout_ms = clamped;
        }
        if self.restart_delay_ms > MAX_RESTART_DELAY_MS {
            warn!(
                "Clamping restart_delay_ms from {} to {MAX_RESTART_DELAY_MS}",
                self.restart_delay_ms
            );
            self.restart_delay_ms = MAX_RESTART_DELAY_MS;
        }
    }

    /// Level to apply to the logger.
    #[must_use]
    pub const fn level_filter(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            self.log_level.as_level_filter()
        }
    }

    #[must_use]
    pub fn ota_settings(&self) -> OtaSettings {
        OtaSettings {
            password: self.ota_password.clone(),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }

    /// Copy with secrets replaced by [`REDACTED`].
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.wifi.password.as_deref().is_some_and(|p| !p.is_empty()) {
            config.wifi.password = Some(REDACTED.to_string());
        }
        if !config.ota_password.is_empty() {
            config.ota_password = REDACTED.to_string();
        }
        config
    }

    /// Put back secrets that a client echoed as [`REDACTED`].
    pub fn restore_secrets(&mut self, current: &Self) {
        if self.wifi.password.as_deref() == Some(REDACTED) {
            self.wifi.password.clone_from(&current.wifi.password);
        }
        if self.ota_password == REDACTED {
            self.ota_password.clone_from(&current.ota_password);
        }
    }

    /// Whether switching from `self` to `other` needs a restart.
    #[must_use]
    pub fn network_changed(&self, other: &Self) -> bool {
        self.hostname != other.hostname
            || self.wifi != other.wifi
            || self.port != other.port
            || self.mdns_enabled != other.mdns_enabled
    }
}

/// 1-63 characters, ASCII letters, digits and `-`, not starting or ending with `-`.
#[must_use]
pub fn is_valid_hostname(hostname: &str) -> bool {
    (1..=63).contains(&hostname.len())
        && hostname.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !hostname.starts_with('-')
        && !hostname.ends_with('-')
}
