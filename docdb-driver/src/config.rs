//! Driver configuration, usually loaded from a yaml file.

use crate::pool::PoolConfig;
use crate::validation::ModifierExemption;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DriverConfig {
    /// `host:port` of the server.
    pub address: String,
    pub auto_reconnect: bool,
    pub pool_size: usize,
    /// How many of the `pool_size` connections serve reads exclusively.
    /// 0 means reads share the writer connections.
    pub reader_pool_size: usize,
    pub request_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// Sweep from a dedicated task every `sweep_interval_ms`.
    /// When false sweeps only piggy-back on request admission, callers are still bounded by
    /// `request_timeout_ms + sweep_interval_ms`.
    pub reaper_timer: bool,
    pub strict_mode: bool,
    pub modifier_exemption: ModifierExemption,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            address: "127.0.0.1:27017".to_owned(),
            auto_reconnect: true,
            pool_size: 1,
            reader_pool_size: 0,
            request_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
            connect_timeout_ms: 3_000,
            reconnect_interval_ms: 1_000,
            reaper_timer: true,
            strict_mode: false,
            modifier_exemption: ModifierExemption::TopLevel,
        }
    }
}

impl DriverConfig {
    pub fn from_file(filepath: &str) -> Result<DriverConfig> {
        let file = std::fs::File::open(filepath)
            .with_context(|| format!("Couldn't open the config file {filepath}"))?;
        let config: DriverConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {filepath}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {filepath}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be at least 1"));
        }
        if self.reader_pool_size > 0 && self.reader_pool_size >= self.pool_size {
            return Err(anyhow!(
                "reader_pool_size ({}) must leave at least one writer in a pool of {}",
                self.reader_pool_size,
                self.pool_size
            ));
        }
        if self.address.is_empty() {
            return Err(anyhow!("address must not be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            address: self.address.clone(),
            pool_size: self.pool_size,
            reader_pool_size: self.reader_pool_size,
            auto_reconnect: self.auto_reconnect,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}
