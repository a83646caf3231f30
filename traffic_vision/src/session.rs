// THEORY:
// Session capture is the boundary between the live simulation and whatever keeps
// history. On demand it summarizes the currently occupied slots into a flat,
// serializable `SessionRecord` and hands it to a key-value `SessionStore`. The
// simulation never reads records back.
//
// The summary is derived from each slot's latest published frame: counts are the
// per-class sum of the latest breakdowns, FPS is the mean of each slot's running
// average, and duration is the age of the longest running slot.

use crate::core_modules::vehicle::{ClassCount, VehicleClass, empty_breakdown};
use crate::error::{DashboardError, Result, StoreError};
use crate::stream_manager::StreamManager;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Key under which session history is persisted.
pub const SESSIONS_KEY: &str = "traffic_ai_sessions";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// Local time, `YYYY-MM-DD HH:MM`.
    pub timestamp: String,
    pub model_used: String,
    /// `HH:MM:SS`.
    pub duration: String,
    pub total_vehicles: u32,
    pub vehicle_counts: Vec<ClassCount>,
    pub source_label: String,
    pub avg_fps: f64,
}

/// Key-value persistence boundary for session history.
pub trait SessionStore {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: String) -> std::result::Result<(), StoreError>;

    /// All saved sessions, newest first.
    fn load_sessions(&self) -> std::result::Result<Vec<SessionRecord>, StoreError> {
        match self.get(SESSIONS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Prepends `record` to the saved history.
    fn save_session(&mut self, record: &SessionRecord) -> std::result::Result<(), StoreError> {
        let mut sessions = self.load_sessions()?;
        sessions.insert(0, record.clone());
        let raw = serde_json::to_string(&sessions)?;
        self.set(SESSIONS_KEY, raw)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> std::result::Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// A JSON object on disk mapping keys to string values.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> std::result::Result<HashMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl SessionStore for JsonFileStore {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: String) -> std::result::Result<(), StoreError> {
        let mut all = self.read_all()?;
        all.insert(key.to_string(), value);
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&all)?).map_err(io_err)
    }
}

/// Builds session records from a running [`StreamManager`].
pub struct SessionRecorder;

impl SessionRecorder {
    /// Summarizes every occupied slot under `name`.
    pub fn capture(name: &str, manager: &StreamManager) -> Result<SessionRecord> {
        Self::capture_at(name, manager, Local::now(), Instant::now())
    }

    pub fn capture_at(
        name: &str,
        manager: &StreamManager,
        wall_clock: DateTime<Local>,
        now: Instant,
    ) -> Result<SessionRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DashboardError::EmptySessionName);
        }
        let active = manager.active_streams();
        if active.is_empty() {
            return Err(DashboardError::NoActiveStreams);
        }

        let mut counts = empty_breakdown();
        let mut longest = Duration::ZERO;
        let mut fps_total = 0.0;
        let mut reporting = 0usize;
        for frame in active.iter().filter_map(|a| a.frame.as_ref()) {
            for c in &frame.snapshot.breakdown {
                counts[c.class.index()].count += c.count;
            }
            longest = longest.max(frame.stats.running_for(now));
            // Paused or still warming up: no rate to report yet.
            if frame.stats.ticks > 0 {
                fps_total += frame.stats.avg_fps();
                reporting += 1;
            }
        }
        let avg_fps = if reporting == 0 { 0.0 } else { fps_total / reporting as f64 };
        let total_vehicles = counts.iter().map(|c| c.count).sum();

        let record = SessionRecord {
            id: format!("sess_{}", wall_clock.timestamp_millis()),
            timestamp: wall_clock.format("%Y-%m-%d %H:%M").to_string(),
            model_used: manager.settings().model_name.clone(),
            duration: format_duration(longest),
            total_vehicles,
            vehicle_counts: counts,
            source_label: name.to_string(),
            avg_fps: (avg_fps * 10.0).round() / 10.0,
        };
        info!(id = %record.id, streams = active.len(), total = record.total_vehicles, "session captured");
        Ok(record)
    }

    /// Captures and persists in one step.
    pub fn save(name: &str, manager: &StreamManager, store: &mut dyn SessionStore) -> Result<SessionRecord> {
        let record = Self::capture(name, manager)?;
        store.save_session(&record)?;
        Ok(record)
    }
}

/// `HH:MM:SS`, hours not wrapped.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Count for one class in a record's breakdown.
pub fn count_for(record: &SessionRecord, class: VehicleClass) -> u32 {
    record
        .vehicle_counts
        .iter()
        .find(|c| c.class == class)
        .map(|c| c.count)
        .unwrap_or(0)
}
