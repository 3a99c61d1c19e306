//! Configuration types for threadlink-node.
//! Parsed from ~/.threadlink/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use threadlink_protocol::ERA_0;

use crate::group_poll_task::PollTiming;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub devices: DevicesSection,
    #[serde(default)]
    pub handshake: HandshakeSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub unlink: UnlinkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Public key of this device.
    #[serde(default)]
    pub local_identity: String,
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesSection {
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_secs(),
        }
    }
}

impl DevicesSection {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeSection {
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSection {
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    #[serde(default = "default_idle_limit")]
    pub idle_limit_secs: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            idle_limit_secs: default_idle_limit(),
        }
    }
}

impl PollingSection {
    pub fn timing(&self) -> PollTiming {
        PollTiming {
            min: Duration::from_secs(self.min_interval_secs),
            max: Duration::from_secs(self.max_interval_secs),
            idle_limit: Duration::from_secs(self.idle_limit_secs),
        }
    }
}

/// How old the directory's view may be when reconciling an unlink request.
/// Zero forces a fresh directory query for every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlinkSection {
    #[serde(default)]
    pub max_view_age_secs: u64,
}

impl UnlinkSection {
    pub fn max_view_age(&self) -> Duration {
        Duration::from_secs(self.max_view_age_secs)
    }
}

// Default value functions
fn default_database() -> String {
    "~/.threadlink/threadlink.db".into()
}
fn default_refresh_secs() -> u64 {
    ERA_0.device_link_refresh_secs
}
fn default_expiry_secs() -> u64 {
    ERA_0.handshake_expiry_secs
}
fn default_min_interval() -> u64 {
    ERA_0.poll_min_interval_secs
}
fn default_max_interval() -> u64 {
    ERA_0.poll_max_interval_secs
}
fn default_idle_limit() -> u64 {
    ERA_0.poll_idle_limit_secs
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                local_identity: String::new(),
                database: default_database(),
            },
            devices: DevicesSection::default(),
            handshake: HandshakeSection::default(),
            polling: PollingSection::default(),
            unlink: UnlinkSection::default(),
        }
    }
}
