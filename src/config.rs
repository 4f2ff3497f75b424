use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::enums::CachePolicy;

/// Tunables of a viewer. Every field has a default, so partial documents parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Prefix of every image identifier handed to the decoder.
    pub decoder_scheme: String,
    pub playback_interval_ms: u64,
    pub loop_playback: bool,
    pub prefetch_batch_size: usize,
    /// Approximate number of pixels sampled per overlay slice during label discovery.
    pub label_sample_target: usize,
    /// Label discovery stops scanning once this many distinct values were found.
    pub label_cap: usize,
    pub default_label_opacity: f32,
    pub cache_policy: CachePolicy,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            decoder_scheme: String::from("wadouri"),
            playback_interval_ms: 200,
            loop_playback: true,
            prefetch_batch_size: 5,
            label_sample_target: 50_000,
            label_cap: 20,
            default_label_opacity: 0.35,
            cache_policy: CachePolicy::Unbounded,
        }
    }
}

impl ViewerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.playback_interval_ms.max(1))
    }
}
