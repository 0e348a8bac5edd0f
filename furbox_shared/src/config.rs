//! Configuration system.
//!
//! Loads client configuration from JSON strings/files. Every field has a
//! default so partial files are fine.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Highest accepted frame rate (one frame per millisecond).
pub const MAX_FRAME_HZ: u32 = 1000;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket endpoint of the game server.
    pub socket_url: String,
    /// Channel topic to join.
    pub topic: String,
    /// Frame rate of the sampling/interpolation loop.
    pub frame_hz: u32,
    /// Socket heartbeat period.
    pub heartbeat_secs: u64,
    /// How long to wait for the join reply.
    pub join_timeout_ms: u64,
    /// Fraction of the remaining distance closed per frame.
    pub smoothing_factor: f32,
    /// Scale smoothing by elapsed time instead of applying it once per frame.
    pub time_scaled_smoothing: bool,
    /// Forget entities that are missing from the latest snapshot.
    pub prune_missing: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:4000/socket/websocket".to_string(),
            topic: "world:lobby".to_string(),
            frame_hz: 60,
            heartbeat_secs: 30,
            join_timeout_ms: 10_000,
            smoothing_factor: 0.2,
            time_scaled_smoothing: false,
            prune_missing: false,
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the client cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_hz == 0 || self.frame_hz > MAX_FRAME_HZ {
            anyhow::bail!(
                "frame_hz must be in 1..={MAX_FRAME_HZ}, got {}",
                self.frame_hz
            );
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            anyhow::bail!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            );
        }
        if self.topic.is_empty() {
            anyhow::bail!("topic must not be empty");
        }
        Ok(())
    }

    /// Frame period, never shorter than one millisecond.
    pub fn frame_interval(&self) -> Duration {
        let hz = self.frame_hz.clamp(1, MAX_FRAME_HZ);
        Duration::from_secs_f64(1.0 / hz as f64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
