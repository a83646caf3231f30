// THEORY:
// The `tracker` module gives the synthetic detections "object permanence". Nothing is
// actually detected: the `TrackSet` invents vehicles and keeps them alive across
// ticks so the overlay looks like a real tracker following real traffic.
//
// Key architectural principles:
// 1.  **Identity Persistence**: A `TrackedObject` keeps its id, class and box size for
//     its whole life. Only position and confidence drift. Ids come from a
//     per-set counter and are never reused.
// 2.  **Bounded Drift**: Each tick applies a small random walk to every live object.
//     The walk is clamped so a box never leaves the unit frame and confidence stays
//     inside the plausible detector band.
// 3.  **Stochastic Convergence**: Every class independently draws a noisy target
//     around its baseline. Surplus objects are removed one candidate at a time with
//     an independent roll, shortfalls are spawned outright. A high stability factor
//     both narrows the target noise and makes removals rarer, so accurate models
//     produce calm, steady counts.
// 4.  **No History**: Removal is unconditional deletion. The set is a live view, not
//     an archive.

use crate::core_modules::vehicle::{ClassBaseline, ClassCount, VehicleClass};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Full span of the horizontal random walk (±half of it per tick).
const JITTER_X_SPAN: f64 = 0.01;
const JITTER_Y_SPAN: f64 = 0.005;
/// Confidence walk span before scaling by `2 - stability`.
const JITTER_CONFIDENCE_SPAN: f64 = 0.05;
pub const MIN_JITTERED_CONFIDENCE: f64 = 0.4;
pub const MAX_JITTERED_CONFIDENCE: f64 = 0.99;

/// An axis-aligned box in normalized `[0, 1]` frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BoundingBox {
    /// True when the box lies fully inside the unit frame.
    pub fn is_within_frame(&self) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.x <= 1.0 - self.w && self.y <= 1.0 - self.h
    }
}

/// A single synthetic vehicle followed across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    /// Unique for the lifetime of the owning track set.
    pub id: u64,
    pub class: VehicleClass,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub confidence: f64,
}

/// The live, privately owned collection of tracked objects for one slot.
#[derive(Debug, Default)]
pub struct TrackSet {
    objects: Vec<TrackedObject>,
    next_id: u64,
}

impl TrackSet {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            next_id: 0,
        }
    }

    pub fn objects(&self) -> &[TrackedObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn count_of(&self, class: VehicleClass) -> u32 {
        self.objects.iter().filter(|o| o.class == class).count() as u32
    }

    /// Per-class live counts in class order.
    pub fn breakdown(&self) -> Vec<ClassCount> {
        VehicleClass::ALL
            .iter()
            .map(|&class| ClassCount {
                class,
                count: self.count_of(class),
            })
            .collect()
    }

    /// Runs one evolution step: drift, then per-class target draw and reconciliation.
    pub fn step<R: Rng + ?Sized>(&mut self, baseline: &ClassBaseline, stability: f64, rng: &mut R) {
        self.jitter(stability, rng);
        for class in VehicleClass::ALL {
            let target = target_count(baseline.get(class), stability, rng);
            self.reconcile(class, target, stability, rng);
        }
    }

    /// Applies the bounded random walk to every live object.
    pub fn jitter<R: Rng + ?Sized>(&mut self, stability: f64, rng: &mut R) {
        let confidence_span = JITTER_CONFIDENCE_SPAN * (2.0 - stability);
        for obj in &mut self.objects {
            let b = &mut obj.bbox;
            b.x = (b.x + centered(rng) * JITTER_X_SPAN).min(1.0 - b.w).max(0.0);
            b.y = (b.y + centered(rng) * JITTER_Y_SPAN).min(1.0 - b.h).max(0.0);
            obj.confidence = (obj.confidence + centered(rng) * confidence_span)
                .min(MAX_JITTERED_CONFIDENCE)
                .max(MIN_JITTERED_CONFIDENCE);
        }
    }

    /// Moves the live count of `class` toward `target`.
    ///
    /// Surplus candidates are visited in insertion order and each one is removed
    /// only if its own roll beats the stability factor, so a single tick may remove
    /// fewer than the surplus. Shortfalls are always spawned in full.
    pub fn reconcile<R: Rng + ?Sized>(
        &mut self,
        class: VehicleClass,
        target: u32,
        stability: f64,
        rng: &mut R,
    ) {
        let live = self.count_of(class);
        if live > target {
            let mut to_remove = live - target;
            self.objects.retain(|o| {
                if o.class == class && to_remove > 0 && rng.gen_range(0.0..1.0) > stability {
                    to_remove -= 1;
                    return false;
                }
                true
            });
        } else if live < target {
            for _ in 0..(target - live) {
                let obj = self.spawn(class, stability, rng);
                self.objects.push(obj);
            }
        }
    }

    fn spawn<R: Rng + ?Sized>(&mut self, class: VehicleClass, stability: f64, rng: &mut R) -> TrackedObject {
        let (w, h) = if class.is_large() {
            (rng.gen_range(0.15..0.25), rng.gen_range(0.12..0.17))
        } else {
            (rng.gen_range(0.10..0.15), rng.gen_range(0.08..0.13))
        };
        let bbox = BoundingBox {
            x: rng.gen_range(0.0..1.0) * (1.0 - w),
            y: rng.gen_range(0.0..1.0) * (1.0 - h),
            w,
            h,
        };
        let id = self.next_id;
        self.next_id += 1;
        TrackedObject {
            id,
            class,
            bbox,
            confidence: spawn_confidence(stability, rng),
        }
    }
}

/// Draws the per-tick target population for one class.
///
/// `fluctuation` is uniform in `±(baseline * (1.5 - stability)) / 2`.
pub fn target_count<R: Rng + ?Sized>(baseline: u32, stability: f64, rng: &mut R) -> u32 {
    let base = baseline as f64;
    let fluctuation = centered(rng) * (base * (1.5 - stability));
    (base + fluctuation).round().max(0.0) as u32
}

/// Initial confidence in `[stability, 1)`, rounded to two decimals.
fn spawn_confidence<R: Rng + ?Sized>(stability: f64, rng: &mut R) -> f64 {
    let raw = stability + rng.gen_range(0.0..1.0) * (1.0 - stability);
    let mut rounded = (raw * 100.0).round() / 100.0;
    if rounded < stability {
        rounded = (stability * 100.0).ceil() / 100.0;
    }
    // A perfect model has an empty interval; keep it at the detector ceiling.
    if rounded >= 1.0 {
        rounded = MAX_JITTERED_CONFIDENCE;
    }
    rounded
}

/// Uniform sample in `[-0.5, 0.5)`.
fn centered<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(0.0..1.0) - 0.5
}
