// THEORY:
// Tunables for the whole dashboard live in one serde struct with sensible defaults.
// Values come from (in increasing precedence) the defaults, an optional JSON file,
// `TV_*` environment variables and finally whatever the host binary overrides from
// its command line. `validate()` is the single gate every source passes through.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Number of concurrent stream slots. Fixed.
pub const SLOT_CAPACITY: usize = 4;
pub const MAX_SKIP_FRAMES: u32 = 30;
pub const MAX_CONFIDENCE_THRESHOLD: u32 = 100;
pub const MIN_IMAGE_SIZE: u32 = 320;
pub const MAX_IMAGE_SIZE: u32 = 1280;
pub const IMAGE_SIZE_STEP: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Simulated backend connection delay before a slot starts ticking.
    pub warmup_ms: u64,
    /// Model selected at startup.
    pub default_model: String,
    pub skip_frames: u32,
    /// Stored and reported, never read by the simulator.
    pub confidence_threshold: u32,
    /// Stored and reported, never read by the simulator.
    pub image_size: u32,
    /// Seeds every slot's RNG deterministically when set.
    pub seed: Option<u64>,
    /// Capacity of the broadcast channel carrying slot frames.
    pub frame_bus_capacity: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 2500,
            default_model: "YOLO-FDE (Ours)".to_string(),
            skip_frames: 5,
            confidence_threshold: 50,
            image_size: 640,
            seed: None,
            frame_bus_capacity: 16,
        }
    }
}

impl DashboardConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Loads and validates a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: DashboardConfig = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::invalid_value("(file)", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `TV_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key lookup (the environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TV_WARMUP_MS") {
            self.warmup_ms = parse_field("TV_WARMUP_MS", &v)?;
        }
        if let Some(v) = lookup("TV_MODEL") {
            if !v.trim().is_empty() {
                self.default_model = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("TV_SKIP_FRAMES") {
            self.skip_frames = parse_field("TV_SKIP_FRAMES", &v)?;
        }
        if let Some(v) = lookup("TV_SEED") {
            self.seed = Some(parse_field("TV_SEED", &v)?);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.skip_frames > MAX_SKIP_FRAMES {
            return Err(ConfigError::invalid_value(
                "skip_frames",
                format!("must be <= {MAX_SKIP_FRAMES}"),
            ));
        }
        if self.confidence_threshold > MAX_CONFIDENCE_THRESHOLD {
            return Err(ConfigError::invalid_value("confidence_threshold", "must be <= 100"));
        }
        if !image_size_is_valid(self.image_size) {
            return Err(ConfigError::invalid_value(
                "image_size",
                format!("must be a multiple of {IMAGE_SIZE_STEP} in {MIN_IMAGE_SIZE}..={MAX_IMAGE_SIZE}"),
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::invalid_value("default_model", "must not be empty"));
        }
        if self.frame_bus_capacity == 0 {
            return Err(ConfigError::invalid_value("frame_bus_capacity", "must be > 0"));
        }
        Ok(())
    }
}

pub(crate) fn image_size_is_valid(px: u32) -> bool {
    (MIN_IMAGE_SIZE..=MAX_IMAGE_SIZE).contains(&px) && (px - MIN_IMAGE_SIZE) % IMAGE_SIZE_STEP == 0
}

fn parse_field<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid_value(field, e.to_string()))
}
