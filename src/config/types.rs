//! VNet SSH configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Tunables for the SSH bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnetSshConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Delay before rejecting a public key after the target could not be dialed
    #[serde(default = "default_auth_failure_delay_ms")]
    pub auth_failure_delay_ms: u64,

    /// Timeout for the proxied TCP dial and for each outbound SSH handshake
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Outbound client keepalive interval
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the outbound client gives up
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// How long a cluster's VNet config stays cached
    #[serde(default = "default_cluster_config_ttl_secs")]
    pub cluster_config_ttl_secs: u64,

    /// End the local session with the target dial error when a key is
    /// rejected, instead of letting the client offer another one
    #[serde(default)]
    pub banner_on_failure: bool,
}

impl VnetSshConfig {
    pub fn auth_failure_delay(&self) -> Duration {
        Duration::from_millis(self.auth_failure_delay_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn cluster_config_ttl(&self) -> Duration {
        Duration::from_secs(self.cluster_config_ttl_secs)
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_auth_failure_delay_ms() -> u64 {
    500
}

fn default_dial_timeout_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_cluster_config_ttl_secs() -> u64 {
    300
}

impl Default for VnetSshConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            auth_failure_delay_ms: default_auth_failure_delay_ms(),
            dial_timeout_secs: default_dial_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max: default_keepalive_max(),
            cluster_config_ttl_secs: default_cluster_config_ttl_secs(),
            banner_on_failure: false,
        }
    }
}
