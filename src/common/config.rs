//! Deploy-time configuration for the master and worker binaries, loaded from
//! TOML files in the style of:
//!
//! ```toml
//! # master.toml
//! [master]
//! port = 9000
//! policy = "round-robin"
//!
//! [dispatch]
//! event_queue_capacity = 128
//! ```
//!
//! ```toml
//! # worker.toml
//! [worker]
//! port = 9100
//! advertised_ip = "127.0.0.1"
//! mode = "light"
//!
//! [master]
//! address = "127.0.0.1:9000"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::filter::pipeline::FilterMode;
use crate::master::policy::SelectionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub master: MasterInfo,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterInfo {
    /// TCP port the master listens on for workers and submitters alike.
    pub port: u16,
    /// Worker-selection policy. Fixed for the lifetime of the process.
    pub policy: SelectionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Bound of the transport -> dispatcher event channel.
    pub event_queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker: WorkerInfo,
    pub master: MasterAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// The port this worker advertises as its identity. Echoed back as
    /// `SlavePort` on every response.
    pub port: u16,
    /// The address this worker advertises when registering.
    #[serde(default = "default_advertised_ip")]
    pub advertised_ip: String,
    /// Which filter pipeline this worker runs.
    pub mode: FilterMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAddress {
    /// `ip:port` of the master to dial at startup.
    pub address: String,
}

fn default_advertised_ip() -> String {
    "127.0.0.1".to_string()
}

impl MasterConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read master config '{}'", path))?;
        let config: MasterConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse master config '{}'", path))?;
        Ok(config)
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read worker config '{}'", path))?;
        let config: WorkerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse worker config '{}'", path))?;
        Ok(config)
    }
}
