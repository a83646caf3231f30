// THEORY:
// This file is the main entry point for the `traffic_vision` library crate.
// It defines the public API exposed to hosts such as the dashboard runner and the
// visualizer server.
//
// The primary export is the `StreamManager` (see `stream_manager`), which owns the
// four stream slots and their per-slot simulation workers, together with the data
// it publishes (`SlotFrame`, `AggregateSnapshot`). The building blocks in
// `core_modules` (track set, simulator, gate, overlay renderer) are public so hosts
// can drive or test them directly, but a typical host only needs the manager, the
// overlay canvas and the session recorder.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod session;
pub mod stream_manager;

pub use config::{DashboardConfig, SLOT_CAPACITY};
pub use core_modules::model_profile::{ModelCatalog, ModelProfile};
pub use core_modules::overlay::{OverlayCanvas, OverlayRenderer, Theme};
pub use core_modules::simulator::AggregateSnapshot;
pub use core_modules::slot::{LocalFileHandle, SourceRef};
pub use core_modules::vehicle::VehicleClass;
pub use error::DashboardError;
pub use stream_manager::{SlotFrame, StreamManager};
