//! Recorder configuration
//!
//! Defaults write to the working directory as rank 0 behind a device-wide
//! barrier, and reject batches recorded before any layer context was set.
//!
//! ## Example
//!
//! ```rust
//! use expert_distribution::config::{RecorderConfig, UnsetLayerPolicy};
//! use expert_distribution::device::SyncScope;
//!
//! let config = RecorderConfig::new()
//!     .with_output_dir("/tmp/expert-dumps")
//!     .with_rank(3)
//!     .with_sync_scope(SyncScope::Stream)
//!     .with_unset_layer_policy(UnsetLayerPolicy::FileUnderUnset);
//!
//! assert_eq!(config.rank, 3);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::SyncScope;
use crate::error::{DistributionError, Result};

/// Environment variable naming the artifact directory
pub const ENV_OUTPUT_DIR: &str = "EXPERT_DISTRIBUTION_DIR";
/// Environment variable carrying the distributed rank
pub const ENV_RANK: &str = "RANK";
/// Environment variable selecting the barrier scope (`device` or `stream`)
pub const ENV_SYNC_SCOPE: &str = "EXPERT_DISTRIBUTION_SYNC";
/// Environment variable selecting the unset-layer policy (`reject` or `unset`)
pub const ENV_UNSET_LAYER: &str = "EXPERT_DISTRIBUTION_UNSET_LAYER";

/// What to do with a batch recorded before `set_current_layer` was ever called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsetLayerPolicy {
    /// Surface `DistributionError::LayerNotSet` to the caller
    #[default]
    Reject,
    /// File the records under the `unset` layer key
    FileUnderUnset,
}

impl std::str::FromStr for UnsetLayerPolicy {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "unset" | "file_under_unset" => Ok(Self::FileUnderUnset),
            other => Err(DistributionError::InvalidConfig(format!(
                "unknown unset-layer policy '{other}' (expected 'reject' or 'unset')"
            ))),
        }
    }
}

/// Configuration for an `ExpertDistributionRecorder`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Directory that receives dump artifacts
    pub output_dir: PathBuf,
    /// Distributed rank embedded in artifact names
    pub rank: usize,
    /// Scope of the barrier taken after each device-to-host copy
    pub sync_scope: SyncScope,
    /// Handling of batches recorded without a layer context
    pub unset_layer_policy: UnsetLayerPolicy,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            rank: 0,
            sync_scope: SyncScope::Device,
            unset_layer_policy: UnsetLayerPolicy::Reject,
        }
    }
}

impl RecorderConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the `EXPERT_DISTRIBUTION_*` and `RANK` variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RecorderConfig::from_env`] with an injectable variable source
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|d| !d.is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(rank) = lookup(ENV_RANK) {
            config.rank = rank.trim().parse().map_err(|e| {
                DistributionError::InvalidConfig(format!("{ENV_RANK}='{rank}': {e}"))
            })?;
        }
        if let Some(scope) = lookup(ENV_SYNC_SCOPE) {
            config.sync_scope = scope.parse()?;
        }
        if let Some(policy) = lookup(ENV_UNSET_LAYER) {
            config.unset_layer_policy = policy.parse()?;
        }

        Ok(config)
    }

    /// Set the artifact directory
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the distributed rank
    #[must_use]
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Set the barrier scope
    #[must_use]
    pub fn with_sync_scope(mut self, scope: SyncScope) -> Self {
        self.sync_scope = scope;
        self
    }

    /// Set the unset-layer policy
    #[must_use]
    pub fn with_unset_layer_policy(mut self, policy: UnsetLayerPolicy) -> Self {
        self.unset_layer_policy = policy;
        self
    }
}
