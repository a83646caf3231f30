// THEORY:
// The vehicle vocabulary shared by every layer: the four detectable classes, the
// per-slot baseline population each class converges toward, and the count record
// used in snapshots and session summaries. The class order is fixed and is the
// order in which every per-class loop runs.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Car,
    Truck,
    Bus,
    Motorcycle,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Truck,
        VehicleClass::Bus,
        VehicleClass::Motorcycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Car => "Car",
            VehicleClass::Truck => "Truck",
            VehicleClass::Bus => "Bus",
            VehicleClass::Motorcycle => "Motorcycle",
        }
    }

    /// Position in [`VehicleClass::ALL`].
    pub fn index(&self) -> usize {
        match self {
            VehicleClass::Car => 0,
            VehicleClass::Truck => 1,
            VehicleClass::Bus => 2,
            VehicleClass::Motorcycle => 3,
        }
    }

    /// Large vehicles get larger synthetic boxes.
    pub fn is_large(&self) -> bool {
        matches!(self, VehicleClass::Bus | VehicleClass::Truck)
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The population a slot's track set hovers around, per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassBaseline {
    counts: [u32; 4],
}

impl ClassBaseline {
    /// Baselines vary with the slot index so that the four streams look different.
    pub fn for_slot(slot_index: usize) -> Self {
        let i = slot_index as u32;
        Self {
            counts: [15 + i * 3, 4 + i, 2, 3 + i],
        }
    }

    pub fn uniform(count: u32) -> Self {
        Self { counts: [count; 4] }
    }

    pub fn get(&self, class: VehicleClass) -> u32 {
        self.counts[class.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCount {
    #[serde(rename = "type")]
    pub class: VehicleClass,
    pub count: u32,
}

/// A zeroed breakdown in class order.
pub fn empty_breakdown() -> Vec<ClassCount> {
    VehicleClass::ALL
        .iter()
        .map(|&class| ClassCount { class, count: 0 })
        .collect()
}
