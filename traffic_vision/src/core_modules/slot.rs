// THEORY:
// A `StreamSlot` is one of the fixed capacity units of the dashboard. It is either
// empty or bound to a source, and a bound slot carries an inferencing flag. Each
// bind or clear bumps the slot's generation so that anything still holding an old
// generation (a late timer callback, a frame in flight) can tell it no longer
// belongs to the current occupant.
//
// Sources come in two kinds. Remote references are plain text. Local files are
// transient handles that must be released exactly once, whether the release is
// triggered by the slot being stopped or by the staged input being superseded.
// The release flag is shared between clones, so any second release is a no-op.

use crate::error::DashboardError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type ReleaseHook = Arc<dyn Fn(&Path) + Send + Sync>;

/// A transient handle to an uploaded local video.
#[derive(Clone)]
pub struct LocalFileHandle {
    path: PathBuf,
    released: Arc<AtomicBool>,
    on_release: Option<ReleaseHook>,
}

impl LocalFileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: Arc::new(AtomicBool::new(false)),
            on_release: None,
        }
    }

    /// Runs `hook` on the first (and only) release, e.g. to delete a temp copy.
    pub fn with_release_hook(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Arc::new(hook));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Releases the handle. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(hook) = &self.on_release {
            hook(&self.path);
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// True when both values refer to the same underlying handle.
    pub fn same_handle(&self, other: &LocalFileHandle) -> bool {
        Arc::ptr_eq(&self.released, &other.released)
    }
}

impl fmt::Debug for LocalFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFileHandle")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

/// What a slot plays.
#[derive(Debug, Clone)]
pub enum SourceRef {
    Remote(String),
    LocalFile(LocalFileHandle),
}

impl SourceRef {
    /// Parses user input into a remote reference. Blank input is rejected.
    pub fn parse(input: &str) -> Result<Self, DashboardError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DashboardError::EmptySource);
        }
        Ok(SourceRef::Remote(trimmed.to_string()))
    }

    pub fn is_blank(&self) -> bool {
        match self {
            SourceRef::Remote(url) => url.trim().is_empty(),
            SourceRef::LocalFile(handle) => handle.path().as_os_str().is_empty(),
        }
    }

    /// Human readable label used in readouts and session records.
    pub fn label(&self) -> String {
        match self {
            SourceRef::Remote(url) => url.clone(),
            SourceRef::LocalFile(handle) => handle.file_name(),
        }
    }

    pub fn local_handle(&self) -> Option<&LocalFileHandle> {
        match self {
            SourceRef::LocalFile(handle) => Some(handle),
            SourceRef::Remote(_) => None,
        }
    }

    /// Releases a local handle if this source holds one.
    pub fn release(&self) -> bool {
        self.local_handle().map(LocalFileHandle::release).unwrap_or(false)
    }
}

/// One of the fixed capacity stream units.
#[derive(Debug, Default)]
pub struct StreamSlot {
    source: Option<SourceRef>,
    is_inferencing: bool,
    generation: u64,
}

/// Read-only view of a slot handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub index: usize,
    pub source_label: Option<String>,
    pub is_inferencing: bool,
    pub generation: u64,
}

impl StreamSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none()
    }

    pub fn is_inferencing(&self) -> bool {
        self.is_inferencing
    }

    pub fn source(&self) -> Option<&SourceRef> {
        self.source.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Binds a source and starts inferencing. Returns the new generation.
    pub(crate) fn bind(&mut self, source: SourceRef) -> u64 {
        self.source = Some(source);
        self.is_inferencing = true;
        self.generation += 1;
        self.generation
    }

    /// Flips inferencing on an occupied slot. Returns the new generation when
    /// anything changed.
    pub(crate) fn set_inferencing(&mut self, on: bool) -> Option<u64> {
        if self.source.is_none() || self.is_inferencing == on {
            return None;
        }
        self.is_inferencing = on;
        self.generation += 1;
        Some(self.generation)
    }

    /// Empties the slot. An already empty slot is left untouched.
    ///
    /// Returns whether a local handle was released by this call.
    pub(crate) fn clear(&mut self) -> bool {
        let Some(source) = self.source.take() else {
            return false;
        };
        self.is_inferencing = false;
        self.generation += 1;
        source.release()
    }

    pub fn status(&self, index: usize) -> SlotStatus {
        SlotStatus {
            index,
            source_label: self.source.as_ref().map(SourceRef::label),
            is_inferencing: self.is_inferencing,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counted_handle(path: &str) -> (LocalFileHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = LocalFileHandle::new(path).with_release_hook(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (handle, count)
    }

    #[test]
    fn blank_input_is_rejected() {
        assert!(matches!(SourceRef::parse("   "), Err(DashboardError::EmptySource)));
        let src = SourceRef::parse("  rtsp://cam/1 ").unwrap();
        assert_eq!(src.label(), "rtsp://cam/1");
    }

    #[test]
    fn handle_releases_exactly_once_across_clones() {
        let (handle, count) = counted_handle("/tmp/upload.mp4");
        let clone = handle.clone();
        assert!(handle.release());
        assert!(!clone.release());
        assert!(clone.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clearing_an_empty_slot_changes_nothing() {
        let mut slot = StreamSlot::new();
        assert!(!slot.clear());
        assert_eq!(slot.generation(), 0);
        assert!(!slot.is_inferencing());
    }

    #[test]
    fn clear_releases_bound_local_file() {
        let (handle, count) = counted_handle("/tmp/clip.mp4");
        let mut slot = StreamSlot::new();
        let generation = slot.bind(SourceRef::LocalFile(handle));
        assert_eq!(generation, 1);
        assert_eq!(slot.status(0).source_label.as_deref(), Some("clip.mp4"));

        assert!(slot.clear());
        assert!(slot.is_empty());
        assert!(!slot.clear());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(slot.generation(), 2);
    }

    #[test]
    fn inferencing_toggle_needs_a_source_and_a_change() {
        let mut slot = StreamSlot::new();
        assert_eq!(slot.set_inferencing(true), None);

        slot.bind(SourceRef::parse("rtsp://cam").unwrap());
        assert_eq!(slot.set_inferencing(true), None);
        assert_eq!(slot.set_inferencing(false), Some(2));
        assert!(!slot.is_inferencing());
        assert!(!slot.is_empty());
        assert_eq!(slot.set_inferencing(true), Some(3));
    }
}
