// THEORY:
// A `ModelProfile` is the only thing the simulator knows about "the model". It is an
// immutable descriptor: accuracy drives how stable the synthetic detections look
// and base FPS drives how often the simulator ticks. The catalog is a fixed list
// selected by name; resolving an unknown name is not an error at this level, the
// simulator simply skips ticks until a known model is selected.

use serde::{Deserialize, Serialize};

/// Immutable throughput/accuracy descriptor of a detection model.
///
/// Fields are private so every profile, including deserialized ones, passes
/// through [`ModelProfile::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ProfileFields")]
pub struct ModelProfile {
    name: String,
    /// Mean average precision, in percent (0..=100).
    accuracy: f64,
    /// Frames per second the model sustains without frame skipping. Always finite and > 0.
    base_fps: f64,
}

#[derive(Deserialize)]
struct ProfileFields {
    name: String,
    accuracy: f64,
    base_fps: f64,
}

impl From<ProfileFields> for ModelProfile {
    fn from(f: ProfileFields) -> Self {
        ModelProfile::new(f.name, f.accuracy, f.base_fps)
    }
}

impl ModelProfile {
    pub fn new(name: impl Into<String>, accuracy: f64, base_fps: f64) -> Self {
        Self {
            name: name.into(),
            accuracy: if accuracy.is_nan() { 0.0 } else { accuracy.clamp(0.0, 100.0) },
            base_fps: if base_fps.is_finite() && base_fps > 0.0 { base_fps } else { 1.0 },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn base_fps(&self) -> f64 {
        self.base_fps
    }

    /// Damping coefficient in `0..=1` derived from accuracy.
    pub fn stability_factor(&self) -> f64 {
        self.accuracy / 100.0
    }
}

/// The fixed set of selectable models.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    profiles: Vec<ModelProfile>,
}

impl ModelCatalog {
    pub fn builtin() -> Self {
        Self {
            profiles: vec![
                ModelProfile::new("YOLO-FDE (Ours)", 92.5, 45.0),
                ModelProfile::new("YOLOv8x", 53.9, 30.0),
                ModelProfile::new("YOLOv8l", 52.9, 40.0),
                ModelProfile::new("YOLOv8m", 50.2, 60.0),
                ModelProfile::new("YOLOv8s", 44.9, 90.0),
                ModelProfile::new("YOLOv8n", 37.3, 120.0),
            ],
        }
    }

    pub fn from_profiles(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }

    pub fn resolve(&self, name: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
