//! Connection configuration.

use fabric_error::{FabricError, Result};
use serde::{Deserialize, Serialize};

/// Tunables for one connection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Idle time after the last write before a heartbeat is sent.
    pub heartbeat_interval_ms: u64,
    /// Silence from the peer after which the connection is closed.
    pub timeout_ms: u64,
    /// Queued frames at which the overload callback fires.
    pub overload_threshold: u32,
    /// Longest string or byte value accepted from the peer.
    pub max_string_len: u32,
    /// Most versions accepted in one map frame.
    pub max_frame_versions: u32,
    /// Largest body accepted for a control frame.
    pub max_control_bytes: u32,
    /// Longest array a peer may describe in an object header.
    pub max_array_len: u32,
    /// Maps held back across all pending interceptions of the peer.
    pub max_held_maps: u32,
    /// Interceptions of the peer waiting for their end marker at once.
    pub max_held_interceptions: u32,
}

impl WireConfig {
    pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_OVERLOAD_THRESHOLD: u32 = 1_024;
    pub const DEFAULT_MAX_STRING_LEN: u32 = 16 * 1024 * 1024;
    pub const DEFAULT_MAX_FRAME_VERSIONS: u32 = 65_536;
    pub const DEFAULT_MAX_CONTROL_BYTES: u32 = 1024 * 1024;
    pub const DEFAULT_MAX_ARRAY_LEN: u32 = 1 << 24;
    pub const DEFAULT_MAX_HELD_MAPS: u32 = 4_096;
    pub const DEFAULT_MAX_HELD_INTERCEPTIONS: u32 = 256;

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(FabricError::config("heartbeat_interval_ms must be positive"));
        }
        if self.timeout_ms <= self.heartbeat_interval_ms {
            return Err(FabricError::config(format!(
                "timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.overload_threshold < 2 {
            return Err(FabricError::config("overload_threshold must be at least 2"));
        }
        if self.max_frame_versions == 0 {
            return Err(FabricError::config("max_frame_versions must be at least 1"));
        }
        if self.max_control_bytes < 64 {
            return Err(FabricError::config("max_control_bytes must be at least 64"));
        }
        if self.max_held_maps == 0 || self.max_held_interceptions == 0 {
            return Err(FabricError::config(
                "max_held_maps and max_held_interceptions must be positive",
            ));
        }
        Ok(())
    }

    /// Parse from JSON; absent fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| FabricError::config(format!("wire config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: Self::DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            overload_threshold: Self::DEFAULT_OVERLOAD_THRESHOLD,
            max_string_len: Self::DEFAULT_MAX_STRING_LEN,
            max_frame_versions: Self::DEFAULT_MAX_FRAME_VERSIONS,
            max_control_bytes: Self::DEFAULT_MAX_CONTROL_BYTES,
            max_array_len: Self::DEFAULT_MAX_ARRAY_LEN,
            max_held_maps: Self::DEFAULT_MAX_HELD_MAPS,
            max_held_interceptions: Self::DEFAULT_MAX_HELD_INTERCEPTIONS,
        }
    }
}
