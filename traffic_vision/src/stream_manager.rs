// THEORY:
// The `StreamManager` is the top-level API of the engine. It owns the four stream
// slots and runs one independent worker task per occupied slot. Each worker owns
// its slot's initialization gate and detection simulator outright; nothing mutable
// is shared between slots.
//
// Key architectural principles:
// 1.  **One Task Per Slot**: A worker is spawned when a source is bound and aborted
//     when the slot is stopped. The abort happens before any replacement worker is
//     spawned, so an old timer can never tick into a new occupant.
// 2.  **Generation Tagging**: Every frame a worker publishes carries the slot
//     generation it was spawned for. `latest()` and `is_current()` compare against
//     the live generation, so a late frame from a stopped worker is ignored even if
//     the slot index has already been reused.
// 3.  **Settings Fan-Out**: Model and skip-frame changes go out on a `watch`
//     channel. Each worker drops its interval and arms a new one with the new
//     cadence. Confidence threshold and image size are stored here only.
// 4.  **Immutable Output**: Workers publish `SlotFrame`s (a frozen object list and
//     snapshot) to a per-slot `watch` for "latest state" reads and to a shared
//     `broadcast` bus for streaming consumers.

use crate::config::{
    DashboardConfig, MAX_CONFIDENCE_THRESHOLD, MAX_IMAGE_SIZE, MAX_SKIP_FRAMES, MIN_IMAGE_SIZE,
    SLOT_CAPACITY, image_size_is_valid,
};
use crate::core_modules::gate::{GatePhase, InitializationGate};
use crate::core_modules::model_profile::ModelCatalog;
use crate::core_modules::simulator::{
    AggregateSnapshot, DetectionSimulator, SimulatorSettings, tick_interval,
};
use crate::core_modules::slot::{LocalFileHandle, SlotStatus, SourceRef, StreamSlot};
use crate::core_modules::tracker::TrackedObject;
use crate::error::{DashboardError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Running statistics a worker keeps for its occupant.
#[derive(Debug, Clone, Copy)]
pub struct SlotStats {
    pub bound_at: Instant,
    pub ticks: u64,
    pub fps_sum: f64,
}

impl SlotStats {
    fn new(bound_at: Instant) -> Self {
        Self {
            bound_at,
            ticks: 0,
            fps_sum: 0.0,
        }
    }

    pub fn avg_fps(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.fps_sum / self.ticks as f64
        }
    }

    pub fn running_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.bound_at)
    }
}

/// Everything a consumer needs to display one slot at one moment.
#[derive(Debug, Clone)]
pub struct SlotFrame {
    pub slot: usize,
    pub generation: u64,
    pub phase: GatePhase,
    pub is_inferencing: bool,
    pub model_name: String,
    pub source_label: Option<String>,
    pub tick: u64,
    pub objects: Arc<[TrackedObject]>,
    pub snapshot: AggregateSnapshot,
    pub stats: SlotStats,
}

impl SlotFrame {
    /// The frame published when a slot is emptied or paused.
    fn closed(slot: usize, generation: u64, model_name: String, source_label: Option<String>) -> Self {
        Self {
            slot,
            generation,
            phase: GatePhase::Closed,
            is_inferencing: false,
            model_name,
            source_label,
            tick: 0,
            objects: Arc::from(Vec::new()),
            snapshot: AggregateSnapshot::empty(),
            stats: SlotStats::new(Instant::now()),
        }
    }

    /// Boxes are painted only for an inferencing slot whose gate is open.
    pub fn overlay_visible(&self) -> bool {
        self.is_inferencing && self.phase == GatePhase::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.phase == GatePhase::Connecting
    }
}

/// Settings as last set by the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardSettings {
    pub model_name: String,
    pub skip_frames: u32,
    pub confidence_threshold: u32,
    pub image_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// The slot held a source before the call.
    pub was_active: bool,
    /// A local file handle was released by this call.
    pub released_handle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAllOutcome {
    Stopped { streams: usize, released_handles: usize },
    Declined,
}

/// An occupied slot together with its most recent frame.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub status: SlotStatus,
    pub frame: Option<SlotFrame>,
}

struct WorkerHandle {
    generation: u64,
    task: JoinHandle<()>,
    frames: watch::Receiver<SlotFrame>,
}

/// Everything a slot worker owns.
struct WorkerContext {
    slot: usize,
    generation: u64,
    source_label: String,
    catalog: Arc<ModelCatalog>,
    warmup: Duration,
    settings_rx: watch::Receiver<SimulatorSettings>,
    frames_tx: watch::Sender<SlotFrame>,
    bus_tx: broadcast::Sender<SlotFrame>,
    rng: StdRng,
    stats: SlotStats,
}

pub struct StreamManager {
    config: DashboardConfig,
    catalog: Arc<ModelCatalog>,
    slots: Vec<StreamSlot>,
    workers: Vec<Option<WorkerHandle>>,
    settings: DashboardSettings,
    settings_tx: watch::Sender<SimulatorSettings>,
    bus_tx: broadcast::Sender<SlotFrame>,
    staged: Option<SourceRef>,
}

impl StreamManager {
    pub fn new(config: DashboardConfig, catalog: ModelCatalog) -> Self {
        let settings = DashboardSettings {
            model_name: config.default_model.clone(),
            skip_frames: config.skip_frames,
            confidence_threshold: config.confidence_threshold,
            image_size: config.image_size,
        };
        let (settings_tx, _) = watch::channel(SimulatorSettings {
            model_name: settings.model_name.clone(),
            skip_frames: settings.skip_frames,
        });
        let (bus_tx, _) = broadcast::channel(config.frame_bus_capacity.max(1));

        Self {
            config,
            catalog: Arc::new(catalog),
            slots: (0..SLOT_CAPACITY).map(|_| StreamSlot::new()).collect(),
            workers: (0..SLOT_CAPACITY).map(|_| None).collect(),
            settings,
            settings_tx,
            bus_tx,
            staged: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    // --- Source staging ---

    /// Stages a typed URL as the next source. The previously staged local file, if
    /// any and not bound to a slot, is released.
    pub fn stage_url(&mut self, input: &str) -> Result<()> {
        let source = SourceRef::parse(input)?;
        self.replace_staged(source);
        Ok(())
    }

    /// Stages an uploaded file, superseding whatever was staged before.
    pub fn stage_local_file(&mut self, handle: LocalFileHandle) {
        self.replace_staged(SourceRef::LocalFile(handle));
    }

    pub fn staged(&self) -> Option<&SourceRef> {
        self.staged.as_ref()
    }

    fn replace_staged(&mut self, next: SourceRef) {
        if let Some(previous) = self.staged.replace(next) {
            if let Some(handle) = previous.local_handle() {
                if !self.is_bound(handle) && handle.release() {
                    debug!(path = %handle.path().display(), "released superseded local source");
                }
            }
        }
    }

    fn is_bound(&self, handle: &LocalFileHandle) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.source().and_then(SourceRef::local_handle))
            .any(|h| h.same_handle(handle))
    }

    /// Drops the staged source if its local handle has been released by a slot.
    fn forget_released_staged(&mut self) {
        let released = self
            .staged
            .as_ref()
            .and_then(SourceRef::local_handle)
            .is_some_and(LocalFileHandle::is_released);
        if released {
            self.staged = None;
        }
    }

    /// Starts the staged source in the first empty slot.
    pub fn start_staged(&mut self) -> Result<usize> {
        let source = self.staged.clone().ok_or(DashboardError::EmptySource)?;
        self.start_stream(source)
    }

    // --- Lifecycle ---

    /// Binds `source` to the first empty slot and starts its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_stream(&mut self, source: SourceRef) -> Result<usize> {
        if source.is_blank() {
            return Err(DashboardError::EmptySource);
        }
        if let Some(handle) = source.local_handle().filter(|h| h.is_released()) {
            return Err(DashboardError::ReleasedSource {
                path: handle.path().to_path_buf(),
            });
        }
        let Some(index) = self.slots.iter().position(StreamSlot::is_empty) else {
            return Err(DashboardError::CapacityExceeded {
                capacity: self.capacity(),
            });
        };

        let label = source.label();
        // Cancel anything still attached to this index before arming a new worker.
        self.abort_worker(index);
        let generation = self.slots[index].bind(source);
        let worker = self.spawn_worker(index, generation, label.clone());
        self.workers[index] = Some(worker);

        info!(slot = index, generation, source = %label, "stream started");
        Ok(index)
    }

    /// Empties one slot. Stopping an empty slot is a no-op.
    pub fn stop_stream(&mut self, index: usize) -> Result<StopOutcome> {
        self.check_index(index)?;
        if self.slots[index].is_empty() {
            return Ok(StopOutcome {
                was_active: false,
                released_handle: false,
            });
        }

        self.abort_worker(index);
        let released_handle = self.slots[index].clear();
        if released_handle {
            self.forget_released_staged();
        }
        let generation = self.slots[index].generation();
        let _ = self
            .bus_tx
            .send(SlotFrame::closed(index, generation, self.settings.model_name.clone(), None));

        info!(slot = index, generation, released_handle, "stream stopped");
        Ok(StopOutcome {
            was_active: true,
            released_handle,
        })
    }

    /// Stops every active slot after `confirm` approves the number of streams.
    pub fn stop_all_streams(&mut self, confirm: impl FnOnce(usize) -> bool) -> Result<StopAllOutcome> {
        let active = self.active_count();
        if active == 0 {
            return Err(DashboardError::NoActiveStreams);
        }
        if !confirm(active) {
            debug!(active, "stop-all declined");
            return Ok(StopAllOutcome::Declined);
        }

        let mut released_handles = 0;
        for index in 0..self.capacity() {
            if self.stop_stream(index)?.released_handle {
                released_handles += 1;
            }
        }
        Ok(StopAllOutcome::Stopped {
            streams: active,
            released_handles,
        })
    }

    /// Pauses or resumes inferencing on an occupied slot. Pausing closes the gate
    /// and discards the track set; resuming restarts the full warmup. Returns
    /// whether anything changed.
    pub fn set_inferencing(&mut self, index: usize, on: bool) -> Result<bool> {
        self.check_index(index)?;
        let Some(label) = self.slots[index].source().map(SourceRef::label) else {
            return Ok(false);
        };
        let Some(generation) = self.slots[index].set_inferencing(on) else {
            return Ok(false);
        };

        self.abort_worker(index);
        if on {
            let worker = self.spawn_worker(index, generation, label);
            self.workers[index] = Some(worker);
        } else {
            let _ = self.bus_tx.send(SlotFrame::closed(
                index,
                generation,
                self.settings.model_name.clone(),
                Some(label),
            ));
        }
        info!(slot = index, generation, inferencing = on, "inferencing toggled");
        Ok(true)
    }

    fn abort_worker(&mut self, index: usize) {
        if let Some(worker) = self.workers[index].take() {
            worker.task.abort();
            debug!(slot = index, generation = worker.generation, "worker aborted");
        }
    }

    fn spawn_worker(&self, slot: usize, generation: u64, source_label: String) -> WorkerHandle {
        let now = Instant::now();
        let stats = SlotStats::new(now);
        let initial = SlotFrame {
            slot,
            generation,
            phase: GatePhase::Connecting,
            is_inferencing: true,
            model_name: self.settings.model_name.clone(),
            source_label: Some(source_label.clone()),
            tick: 0,
            objects: Arc::from(Vec::new()),
            snapshot: AggregateSnapshot::empty(),
            stats,
        };
        let (frames_tx, frames) = watch::channel(initial.clone());
        let _ = self.bus_tx.send(initial);

        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ ((slot as u64) << 32) ^ generation),
            None => StdRng::from_entropy(),
        };
        let ctx = WorkerContext {
            slot,
            generation,
            source_label,
            catalog: self.catalog.clone(),
            warmup: self.config.warmup(),
            settings_rx: self.settings_tx.subscribe(),
            frames_tx,
            bus_tx: self.bus_tx.clone(),
            rng,
            stats,
        };

        WorkerHandle {
            generation,
            task: tokio::spawn(run_slot(ctx)),
            frames,
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.capacity() {
            return Err(DashboardError::InvalidSlot {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    // --- Settings ---

    pub fn settings(&self) -> &DashboardSettings {
        &self.settings
    }

    /// Selects a model by name. Unknown names are accepted; affected workers stop
    /// ticking until a known model is selected again.
    pub fn set_model(&mut self, name: &str) {
        let name = name.trim().to_string();
        if self.catalog.resolve(&name).is_none() {
            warn!(model = %name, "selected model is not in the catalog");
        }
        self.settings.model_name = name.clone();
        self.settings_tx.send_if_modified(|s| {
            if s.model_name == name {
                return false;
            }
            s.model_name = name;
            true
        });
    }

    pub fn set_skip_frames(&mut self, skip_frames: u32) -> Result<()> {
        if skip_frames > MAX_SKIP_FRAMES {
            return Err(DashboardError::OutOfRange {
                setting: "skip_frames",
                value: skip_frames,
                min: 0,
                max: MAX_SKIP_FRAMES,
            });
        }
        self.settings.skip_frames = skip_frames;
        self.settings_tx.send_if_modified(|s| {
            if s.skip_frames == skip_frames {
                return false;
            }
            s.skip_frames = skip_frames;
            true
        });
        Ok(())
    }

    /// Stored only; the simulator does not filter by confidence.
    pub fn set_confidence_threshold(&mut self, threshold: u32) -> Result<()> {
        if threshold > MAX_CONFIDENCE_THRESHOLD {
            return Err(DashboardError::OutOfRange {
                setting: "confidence_threshold",
                value: threshold,
                min: 0,
                max: MAX_CONFIDENCE_THRESHOLD,
            });
        }
        self.settings.confidence_threshold = threshold;
        Ok(())
    }

    /// Stored only; the simulator does not depend on input resolution.
    pub fn set_image_size(&mut self, px: u32) -> Result<()> {
        if !image_size_is_valid(px) {
            return Err(DashboardError::OutOfRange {
                setting: "image_size",
                value: px,
                min: MIN_IMAGE_SIZE,
                max: MAX_IMAGE_SIZE,
            });
        }
        self.settings.image_size = px;
        Ok(())
    }

    /// Cadence the selected model and skip setting imply, if the model resolves.
    pub fn current_interval(&self) -> Option<Duration> {
        self.catalog
            .resolve(&self.settings.model_name)
            .map(|p| tick_interval(p, self.settings.skip_frames))
    }

    // --- Reads ---

    pub fn slot_status(&self, index: usize) -> Result<SlotStatus> {
        self.check_index(index)?;
        Ok(self.slots[index].status(index))
    }

    pub fn slots(&self) -> Vec<SlotStatus> {
        self.slots.iter().enumerate().map(|(i, s)| s.status(i)).collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    /// The newest frame of the slot's current occupant.
    pub fn latest(&self, index: usize) -> Option<SlotFrame> {
        let worker = self.workers.get(index)?.as_ref()?;
        let frame = worker.frames.borrow().clone();
        self.is_current(&frame).then_some(frame)
    }

    /// Whether a frame belongs to the slot's current occupant.
    pub fn is_current(&self, frame: &SlotFrame) -> bool {
        self.slots
            .get(frame.slot)
            .is_some_and(|s| s.generation() == frame.generation)
    }

    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| ActiveStream {
                status: s.status(i),
                frame: self.latest(i),
            })
            .collect()
    }

    /// Streams every published frame. Filter with [`StreamManager::is_current`].
    pub fn subscribe(&self) -> broadcast::Receiver<SlotFrame> {
        self.bus_tx.subscribe()
    }

    /// Aborts every worker and waits for them to wind down. Slots keep their sources.
    pub async fn shutdown(&mut self) {
        let tasks: Vec<JoinHandle<()>> = self
            .workers
            .iter_mut()
            .filter_map(Option::take)
            .map(|w| {
                w.task.abort();
                w.task
            })
            .collect();
        let count = tasks.len();
        futures::future::join_all(tasks).await;
        info!(workers = count, "stream manager shut down");
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        for worker in self.workers.iter().flatten() {
            worker.task.abort();
        }
    }
}

// --- Worker ---

async fn run_slot(mut ctx: WorkerContext) {
    let mut gate = InitializationGate::new(ctx.warmup);
    gate.set_inferencing(true, ctx.stats.bound_at);

    // Phase 1: warmup. Settings may change meanwhile; they are read once the gate opens.
    while let Some(deadline) = gate.deadline() {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                gate.poll(Instant::now());
            }
            changed = ctx.settings_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
    if !gate.is_open() {
        return;
    }

    let settings = ctx.settings_rx.borrow_and_update().clone();
    let mut sim = DetectionSimulator::new(ctx.catalog.clone(), ctx.slot, settings);
    info!(slot = ctx.slot, generation = ctx.generation, "gate open");
    publish(&ctx, GatePhase::Open, &sim, 0, Arc::from(Vec::new()), AggregateSnapshot::empty());

    // Phase 2: tick loop.
    let mut ticker = arm_ticker(&sim, ctx.slot);
    loop {
        tokio::select! {
            _ = next_tick(&mut ticker) => {
                match sim.tick(&mut ctx.rng) {
                    Ok(frame) => {
                        ctx.stats.ticks += 1;
                        ctx.stats.fps_sum += frame.snapshot.fps;
                        debug!(slot = ctx.slot, tick = frame.tick, total = frame.snapshot.total, "tick");
                        publish(&ctx, GatePhase::Open, &sim, frame.tick, frame.objects, frame.snapshot);
                    }
                    Err(e) => debug!(slot = ctx.slot, error = %e, "tick skipped"),
                }
            }
            changed = ctx.settings_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let settings = ctx.settings_rx.borrow_and_update().clone();
                // The old interval is dropped before the replacement is armed.
                drop(ticker.take());
                sim.update_settings(settings);
                ticker = arm_ticker(&sim, ctx.slot);
            }
        }
    }
}

fn arm_ticker(sim: &DetectionSimulator, slot: usize) -> Option<Interval> {
    match sim.profile() {
        Ok(profile) => {
            let period = tick_interval(profile, sim.settings().skip_frames);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(slot, period_ms = period.as_secs_f64() * 1000.0, "ticker armed");
            Some(interval)
        }
        Err(e) => {
            warn!(slot, error = %e, "simulation paused");
            None
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn publish(
    ctx: &WorkerContext,
    phase: GatePhase,
    sim: &DetectionSimulator,
    tick: u64,
    objects: Arc<[TrackedObject]>,
    snapshot: AggregateSnapshot,
) {
    let frame = SlotFrame {
        slot: ctx.slot,
        generation: ctx.generation,
        phase,
        is_inferencing: true,
        model_name: sim.settings().model_name.clone(),
        source_label: Some(ctx.source_label.clone()),
        tick,
        objects,
        snapshot,
        stats: ctx.stats,
    };
    ctx.frames_tx.send_replace(frame.clone());
    let _ = ctx.bus_tx.send(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StreamManager {
        let config = DashboardConfig {
            seed: Some(1),
            ..DashboardConfig::default()
        };
        StreamManager::new(config, ModelCatalog::builtin())
    }

    #[test]
    fn settings_validation_rejects_out_of_range_values() {
        let mut m = manager();
        assert!(matches!(
            m.set_skip_frames(31),
            Err(DashboardError::OutOfRange { setting: "skip_frames", .. })
        ));
        assert!(m.set_confidence_threshold(101).is_err());
        assert!(m.set_image_size(333).is_err());
        m.set_image_size(1024).unwrap();
        m.set_confidence_threshold(0).unwrap();
        assert_eq!(m.settings().image_size, 1024);
        assert_eq!(m.settings().confidence_threshold, 0);
    }

    #[test]
    fn invalid_slot_index_is_reported() {
        let mut m = manager();
        assert!(matches!(
            m.stop_stream(4),
            Err(DashboardError::InvalidSlot { index: 4, capacity: 4 })
        ));
    }

    #[test]
    fn stop_all_without_streams_is_an_error() {
        let mut m = manager();
        let mut asked = false;
        let res = m.stop_all_streams(|_| {
            asked = true;
            true
        });
        assert!(matches!(res, Err(DashboardError::NoActiveStreams)));
        assert!(!asked);
    }

    #[test]
    fn superseded_staged_file_is_released() {
        let mut m = manager();
        let first = LocalFileHandle::new("/tmp/a.mp4");
        m.stage_local_file(first.clone());
        m.stage_local_file(LocalFileHandle::new("/tmp/b.mp4"));
        assert!(first.is_released());
        m.stage_url("rtsp://cam").unwrap();
        assert_eq!(m.staged().map(SourceRef::label).as_deref(), Some("rtsp://cam"));
    }

    #[test]
    fn current_interval_follows_settings() {
        let mut m = manager();
        m.set_model("YOLOv8x");
        m.set_skip_frames(5).unwrap();
        let interval = m.current_interval().unwrap();
        assert!((interval.as_secs_f64() - 0.2).abs() < 1e-9);
        m.set_model("nope");
        assert!(m.current_interval().is_none());
    }
}
