// src/config.rs

//! Manages member configuration: loading from TOML and validation.

use crate::core::cluster::{Address, ClusterConfig, Member};
use crate::core::merge::DataStructureConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use tracing::warn;
use uuid::Uuid;

/// Configuration for the Prometheus metrics endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics and cluster status.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// The main configuration of one member.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// A fixed member UUID. A random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_uuid: Option<Uuid>,
    /// Lite members take part in the cluster but own no data partitions.
    #[serde(default)]
    pub lite_member: bool,
    #[serde(default)]
    pub member_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub data_structures: Vec<DataStructureConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            member_uuid: None,
            lite_member: false,
            member_attributes: BTreeMap::new(),
            cluster: ClusterConfig::default(),
            metrics: MetricsConfig::default(),
            data_structures: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5701
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from a TOML file and validates it.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.cluster.missing_member_grace_period.is_zero() {
            return Err(anyhow!("cluster.missing_member_grace_period cannot be 0"));
        }
        if self.cluster.merge_timeout.is_zero() {
            return Err(anyhow!("cluster.merge_timeout cannot be 0"));
        }
        if self.cluster.missing_member_check_interval.is_zero() {
            return Err(anyhow!("cluster.missing_member_check_interval cannot be 0"));
        }
        if self.cluster.management_channel_capacity == 0 {
            return Err(anyhow!("cluster.management_channel_capacity cannot be 0"));
        }
        if self.cluster.missing_member_check_interval > self.cluster.missing_member_grace_period {
            warn!(
                "cluster.missing_member_check_interval ({:?}) exceeds the grace period ({:?}); missing members will be removed late.",
                self.cluster.missing_member_check_interval, self.cluster.missing_member_grace_period
            );
        }

        let mut names = HashSet::new();
        for (i, ds) in self.data_structures.iter().enumerate() {
            if ds.name.trim().is_empty() {
                return Err(anyhow!("data structure #{} has an empty name", i + 1));
            }
            if !names.insert(ds.name.as_str()) {
                return Err(anyhow!("data structure '{}' is declared twice", ds.name));
            }
            if ds.merge_policy.batch_size == 0 {
                return Err(anyhow!(
                    "data structure '{}': merge_policy.batch_size cannot be 0",
                    ds.name
                ));
            }
        }

        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!(
                "metrics.port cannot be the same as the member port ({})",
                self.port
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    /// Builds the local member described by this configuration.
    pub fn local_member(&self) -> Member {
        Member::new(self.member_uuid.unwrap_or_else(Uuid::new_v4), self.address())
            .with_attributes(self.member_attributes.clone())
            .with_lite(self.lite_member)
            .with_local(true)
    }
}
