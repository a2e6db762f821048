//! Engine configuration.

use fabric_error::{FabricError, Result};
use serde::{Deserialize, Serialize};

/// Tunables for commits and acknowledger walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Retries granted to an `AUTO` transaction before its conflict is
    /// returned to the caller.
    pub max_commit_retries: u32,
    /// CAS attempts a walker makes to close an open interception before it
    /// suspends and tries again on its next run.
    pub max_cas_attempts_per_walk: u32,
    /// Work units a walker processes per `run` call.
    pub walker_budget: u32,
    /// Acknowledged maps a branch may accumulate before the merger folds
    /// them into the base state.
    pub trim_threshold: u32,
}

impl FabricConfig {
    pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 16;
    pub const DEFAULT_MAX_CAS_ATTEMPTS_PER_WALK: u32 = 8;
    pub const DEFAULT_WALKER_BUDGET: u32 = 64;
    pub const DEFAULT_TRIM_THRESHOLD: u32 = 32;

    pub fn validate(&self) -> Result<()> {
        if self.max_cas_attempts_per_walk == 0 {
            return Err(FabricError::config("max_cas_attempts_per_walk must be at least 1"));
        }
        if self.walker_budget == 0 {
            return Err(FabricError::config("walker_budget must be at least 1"));
        }
        Ok(())
    }

    /// Parse from JSON; absent fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| FabricError::config(format!("fabric config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: Self::DEFAULT_MAX_COMMIT_RETRIES,
            max_cas_attempts_per_walk: Self::DEFAULT_MAX_CAS_ATTEMPTS_PER_WALK,
            walker_budget: Self::DEFAULT_WALKER_BUDGET,
            trim_threshold: Self::DEFAULT_TRIM_THRESHOLD,
        }
    }
}
