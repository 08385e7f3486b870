// src/core/cluster/config.rs

//! Defines the cluster-specific configuration options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Holds all configuration settings related to membership and merge handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// How long a member may stay unreachable before it is removed from the
    /// member list. A reconnect under the same cluster identity within this
    /// window is treated as a transient network blip.
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub missing_member_grace_period: Duration,
    /// Upper bound for one merge attempt (handshake, entry transfer and join).
    #[serde(with = "humantime_serde", default = "default_merge_timeout")]
    pub merge_timeout: Duration,
    /// How often the management context checks missing members against the grace period.
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub missing_member_check_interval: Duration,
    /// Capacity of the command channel feeding the cluster management context.
    #[serde(default = "default_channel_capacity")]
    pub management_channel_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            missing_member_grace_period: default_grace_period(),
            merge_timeout: default_merge_timeout(),
            missing_member_check_interval: default_check_interval(),
            management_channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}
fn default_merge_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_channel_capacity() -> usize {
    1024
}
