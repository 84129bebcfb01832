//! Configuration persistence in NVS.

use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{debug, info, warn};
use std::sync::{Mutex, PoisonError};

pub use webota_lib::config::Config;

const NVS_NAMESPACE: &str = "webota";
const NVS_CONFIG_KEY: &str = "config";

/// The `webota` NVS namespace holding the config blob.
pub struct ConfigStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl ConfigStore {
    pub fn new(nvs_partition: EspNvsPartition<NvsDefault>) -> Result<Self> {
        debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
        let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
        info!("NVS initialized");
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }

    pub fn load_or_default(&self) -> Config {
        match self.load() {
            Ok(config) => {
                info!("Loaded config from NVS");
                config
            }
            Err(e) => {
                warn!("Failed to load config from NVS: {e}, using defaults");
                Config::default()
            }
        }
    }

    pub fn load(&self) -> Result<Config> {
        debug!("Loading config from NVS");
        let nvs = self.nvs.lock().unwrap_or_else(PoisonError::into_inner);

        let len = nvs
            .blob_len(NVS_CONFIG_KEY)?
            .ok_or_else(|| anyhow!("No config found in NVS"))?;
        debug!("Config blob size: {len} bytes");
        let mut buf = vec![0u8; len];
        let blob = nvs
            .get_blob(NVS_CONFIG_KEY, &mut buf)?
            .ok_or_else(|| anyhow!("Config blob disappeared"))?;
        let config = Config::from_json(blob)?;
        debug!(
            "Config parsed: hostname={:?}, wifi.ssid={:?}, log_level={:?}",
            config.hostname, config.wifi.ssid, config.log_level
        );
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        debug!("Saving config to NVS");
        let json = serde_json::to_vec(config)?;
        debug!("Config JSON size: {} bytes", json.len());
        self.nvs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_blob(NVS_CONFIG_KEY, &json)?;
        info!("Config saved to NVS");
        Ok(())
    }
}
