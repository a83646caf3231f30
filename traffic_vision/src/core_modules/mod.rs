pub mod gate;
pub mod model_profile;
pub mod overlay;
pub mod simulator;
pub mod slot;
pub mod tracker;
pub mod vehicle;
