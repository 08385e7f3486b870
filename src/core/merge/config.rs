// src/core/merge/config.rs

//! Per-data-structure merge configuration.

use serde::{Deserialize, Serialize};

/// Selects the merge policy of one data structure instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyConfig {
    /// A built-in policy name (e.g. `PutIfAbsent`) or the name of a registered custom policy.
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Number of entries sent per merge batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_policy() -> String {
    "PutIfAbsent".to_string()
}
fn default_batch_size() -> usize {
    100
}

/// Declares one distributed data structure instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStructureConfig {
    pub name: String,
    #[serde(default)]
    pub merge_policy: MergePolicyConfig,
}

impl DataStructureConfig {
    pub fn new(name: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge_policy: MergePolicyConfig {
                policy: policy.into(),
                ..MergePolicyConfig::default()
            },
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.merge_policy.batch_size = batch_size;
        self
    }
}
