// THEORY:
// The `DetectionSimulator` is the per-slot engine that pretends to be an inference
// backend. It owns its slot's `TrackSet` privately and, once per tick, evolves it
// and publishes an immutable `SimulationFrame`: a frozen copy of the objects plus
// the aggregate counts. Consumers (the overlay renderer, the frame bus, session
// capture) only ever see frames, never the live mutable set.
//
// The simulator itself is synchronous and clock-free. Cadence is computed here
// (`tick_interval`) but the timer that drives it lives in the stream manager's
// per-slot worker, which is the only place that knows about tokio.

use crate::core_modules::model_profile::{ModelCatalog, ModelProfile};
use crate::core_modules::tracker::{TrackSet, TrackedObject};
use crate::core_modules::vehicle::{ClassBaseline, ClassCount, empty_breakdown};
use crate::error::SimulationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Relative amplitude of the reported FPS noise (±5%).
const FPS_JITTER: f64 = 0.1;

/// Per-tick summary statistics for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub total: u32,
    pub breakdown: Vec<ClassCount>,
    pub fps: f64,
}

impl AggregateSnapshot {
    pub fn empty() -> Self {
        Self {
            total: 0,
            breakdown: empty_breakdown(),
            fps: 0.0,
        }
    }
}

impl Default for AggregateSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// An immutable result of one tick.
#[derive(Debug, Clone)]
pub struct SimulationFrame {
    pub tick: u64,
    pub objects: Arc<[TrackedObject]>,
    pub snapshot: AggregateSnapshot,
}

/// Shortest cadence a slot is ever armed with.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);
/// Longest cadence a slot is ever armed with.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(3600);

/// Time between two simulator ticks: `1000 / base_fps * (skip_frames + 1)` ms,
/// clamped to `MIN_TICK_INTERVAL..=MAX_TICK_INTERVAL`.
pub fn tick_interval(profile: &ModelProfile, skip_frames: u32) -> Duration {
    let secs = (skip_frames as f64 + 1.0) / profile.base_fps();
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_TICK_INTERVAL)
        .clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL)
}

/// The FPS a slot effectively runs at once frames are skipped.
pub fn effective_fps(profile: &ModelProfile, skip_frames: u32) -> f64 {
    profile.base_fps() / (skip_frames as f64 + 1.0)
}

/// Settings the simulator reads on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorSettings {
    pub model_name: String,
    pub skip_frames: u32,
}

pub struct DetectionSimulator {
    catalog: Arc<ModelCatalog>,
    baseline: ClassBaseline,
    settings: SimulatorSettings,
    tracks: TrackSet,
    ticks: u64,
}

impl DetectionSimulator {
    pub fn new(catalog: Arc<ModelCatalog>, slot_index: usize, settings: SimulatorSettings) -> Self {
        Self::with_baseline(catalog, ClassBaseline::for_slot(slot_index), settings)
    }

    pub fn with_baseline(
        catalog: Arc<ModelCatalog>,
        baseline: ClassBaseline,
        settings: SimulatorSettings,
    ) -> Self {
        Self {
            catalog,
            baseline,
            settings,
            tracks: TrackSet::new(),
            ticks: 0,
        }
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: SimulatorSettings) {
        self.settings = settings;
    }

    pub fn profile(&self) -> Result<&ModelProfile, SimulationError> {
        self.catalog
            .resolve(&self.settings.model_name)
            .ok_or_else(|| SimulationError::MissingModelProfile {
                name: self.settings.model_name.clone(),
            })
    }

    /// Current cadence, or `None` while the model cannot be resolved.
    pub fn interval(&self) -> Option<Duration> {
        self.profile()
            .ok()
            .map(|p| tick_interval(p, self.settings.skip_frames))
    }

    pub fn track_set(&self) -> &TrackSet {
        &self.tracks
    }

    /// Evolves the track set once and freezes the result.
    ///
    /// An unresolved model leaves the track set untouched.
    pub fn tick<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<SimulationFrame, SimulationError> {
        let profile = self.profile()?.clone();
        let stability = profile.stability_factor();

        self.tracks.step(&self.baseline, stability, rng);
        self.ticks += 1;

        let breakdown = self.tracks.breakdown();
        let total = breakdown.iter().map(|c| c.count).sum();
        let effective = effective_fps(&profile, self.settings.skip_frames);
        let noisy = effective + (rng.gen_range(0.0..1.0) - 0.5) * effective * FPS_JITTER;

        Ok(SimulationFrame {
            tick: self.ticks,
            objects: Arc::from(self.tracks.objects()),
            snapshot: AggregateSnapshot {
                total,
                breakdown,
                fps: (noisy * 10.0).round() / 10.0,
            },
        })
    }
}
