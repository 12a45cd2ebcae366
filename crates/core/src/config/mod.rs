use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{timeline::SeekPolicy, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub resolver: ResolverConfig,
    pub cycle: CycleConfig,
}

impl AppConfig {
    /// Reads a JSON file. Missing sections and fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }
}

/// Settings for the URI player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub default_uri: String,
    pub poll_interval_ms: u64,
    pub seek: SeekPolicy,
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_uri: "https://gstreamer.freedesktop.org/data/media/sintel_trailer-480p.webm"
                .to_string(),
            poll_interval_ms: 100,
            seek: SeekPolicy::default(),
        }
    }
}

/// Media types the late-binding resolver links.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub accepted_prefixes: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            accepted_prefixes: vec!["audio/x-raw".to_string()],
        }
    }
}

/// Settings for the source-swapping demo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub interval_ms: u64,
    pub pattern_count: u32,
    pub is_live: bool,
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            pattern_count: 26,
            is_live: true,
        }
    }
}
