use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use traffic_vision::core_modules::gate::GatePhase;
use traffic_vision::core_modules::simulator::MIN_TICK_INTERVAL;
use traffic_vision::session::{MemoryStore, SessionRecorder, SessionStore};
use traffic_vision::stream_manager::{StopAllOutcome, StopOutcome};
use traffic_vision::{
    DashboardConfig, DashboardError, LocalFileHandle, ModelCatalog, ModelProfile, OverlayCanvas, OverlayRenderer,
    SourceRef, StreamManager, Theme,
};

fn manager() -> StreamManager {
    let config = DashboardConfig {
        seed: Some(2024),
        ..DashboardConfig::default()
    };
    StreamManager::new(config, ModelCatalog::builtin())
}

fn remote(url: &str) -> SourceRef {
    SourceRef::parse(url).expect("non-blank url")
}

fn counted_file(path: &str) -> (LocalFileHandle, Arc<AtomicUsize>) {
    let releases = Arc::new(AtomicUsize::new(0));
    let r = releases.clone();
    let handle = LocalFileHandle::new(path).with_release_hook(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    (handle, releases)
}

async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn fifth_stream_exceeds_capacity_without_touching_slots() {
    let mut m = manager();
    for i in 0..4 {
        assert_eq!(m.start_stream(remote(&format!("rtsp://cam/{i}"))).unwrap(), i);
    }
    let before = m.slots();

    let err = m.start_stream(remote("rtsp://cam/overflow")).unwrap_err();
    assert!(matches!(err, DashboardError::CapacityExceeded { capacity: 4 }));
    assert_eq!(m.slots(), before);
}

#[tokio::test(start_paused = true)]
async fn blank_source_is_rejected_without_state_change() {
    let mut m = manager();
    let err = m.start_stream(SourceRef::Remote("   ".into())).unwrap_err();
    assert!(matches!(err, DashboardError::EmptySource));
    assert!(matches!(m.stage_url(""), Err(DashboardError::EmptySource)));
    assert_eq!(m.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn gate_holds_simulation_for_warmup_then_opens() {
    let mut m = manager();
    let slot = m.start_stream(remote("rtsp://cam/gate")).unwrap();

    wait(2400).await;
    let frame = m.latest(slot).expect("frame for occupied slot");
    assert!(frame.is_connecting());
    assert!(frame.objects.is_empty());
    assert_eq!(frame.snapshot.total, 0);

    let mut canvas = OverlayCanvas::new(OverlayRenderer::new(), 320, 180, Theme::Light);
    canvas.apply(&frame);
    assert!(canvas.image().pixels().all(|p| p.0[3] == 0));

    wait(1000).await;
    let frame = m.latest(slot).unwrap();
    assert_eq!(frame.phase, GatePhase::Open);
    assert!(frame.tick > 0);
    assert!(frame.snapshot.total > 0);
    let sum: u32 = frame.snapshot.breakdown.iter().map(|c| c.count).sum();
    assert_eq!(sum, frame.snapshot.total);

    canvas.apply(&frame);
    assert!(canvas.image().pixels().any(|p| p.0[3] != 0));
    assert_eq!(canvas.labels().len(), frame.objects.len());
}

#[tokio::test(start_paused = true)]
async fn pausing_during_warmup_restarts_the_full_delay() {
    let mut m = manager();
    let slot = m.start_stream(remote("rtsp://cam/pause")).unwrap();

    wait(2000).await;
    assert!(m.set_inferencing(slot, false).unwrap());
    assert!(m.latest(slot).is_none());
    assert!(!m.slot_status(slot).unwrap().is_inferencing);
    assert!(!m.set_inferencing(slot, false).unwrap());

    assert!(m.set_inferencing(slot, true).unwrap());
    wait(2000).await;
    assert!(m.latest(slot).unwrap().is_connecting());

    wait(1000).await;
    let frame = m.latest(slot).unwrap();
    assert_eq!(frame.phase, GatePhase::Open);
    assert!(!frame.objects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pausing_discards_tracks_but_keeps_the_source() {
    let mut m = manager();
    let (handle, releases) = counted_file("/tmp/paused.mp4");
    let slot = m.start_stream(SourceRef::LocalFile(handle)).unwrap();
    wait(3000).await;
    assert!(!m.latest(slot).unwrap().objects.is_empty());

    m.set_inferencing(slot, false).unwrap();
    assert_eq!(m.active_count(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    m.set_inferencing(slot, true).unwrap();
    let resumed = m.latest(slot).unwrap();
    assert!(resumed.objects.is_empty());
    assert_eq!(resumed.tick, 0);

    m.stop_stream(slot).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_local_file_once_and_is_idempotent() {
    let mut m = manager();
    let (handle, releases) = counted_file("/tmp/uploaded.mp4");
    let slot = m.start_stream(SourceRef::LocalFile(handle)).unwrap();
    wait(3000).await;

    let first = m.stop_stream(slot).unwrap();
    assert_eq!(
        first,
        StopOutcome {
            was_active: true,
            released_handle: true
        }
    );
    let status = m.slot_status(slot).unwrap();
    assert!(status.source_label.is_none());
    assert!(!status.is_inferencing);
    assert!(m.latest(slot).is_none());

    let generation = status.generation;
    let second = m.stop_stream(slot).unwrap();
    assert!(!second.was_active && !second.released_handle);
    assert_eq!(m.slot_status(slot).unwrap().generation, generation);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reused_slot_ignores_frames_from_previous_occupant() {
    let mut m = manager();
    let mut bus = m.subscribe();
    let slot = m.start_stream(remote("rtsp://cam/old")).unwrap();
    wait(3000).await;
    m.stop_stream(slot).unwrap();
    assert_eq!(m.start_stream(remote("rtsp://cam/new")).unwrap(), slot);

    let mut saw_stale = false;
    while let Ok(frame) = bus.try_recv() {
        if frame.generation == 1 {
            saw_stale = true;
            assert!(!m.is_current(&frame));
        }
    }
    assert!(saw_stale);

    let latest = m.latest(slot).unwrap();
    assert_eq!(latest.generation, m.slot_status(slot).unwrap().generation);
    assert_eq!(latest.source_label.as_deref(), Some("rtsp://cam/new"));
    assert_eq!(latest.phase, GatePhase::Connecting);
    assert!(latest.objects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn skip_frame_change_rearms_the_ticker() {
    let mut m = manager();
    m.set_model("YOLOv8m"); // 60 fps
    m.set_skip_frames(5).unwrap(); // 100 ms
    let slot = m.start_stream(remote("rtsp://cam/cadence")).unwrap();

    wait(2500).await;
    let opened = m.latest(slot).unwrap().stats.ticks;
    wait(1000).await;
    let slow = m.latest(slot).unwrap().stats.ticks - opened;
    assert!((9..=11).contains(&slow), "{slow}");

    m.set_skip_frames(0).unwrap(); // ~16.7 ms
    let rearmed = m.latest(slot).unwrap().stats.ticks;
    wait(1000).await;
    let fast = m.latest(slot).unwrap().stats.ticks - rearmed;
    assert!((55..=61).contains(&fast), "{fast}");
}

#[tokio::test(start_paused = true)]
async fn unknown_model_pauses_ticks_and_keeps_tracks() {
    let mut m = manager();
    let slot = m.start_stream(remote("rtsp://cam/model")).unwrap();
    wait(3500).await;
    let before = m.latest(slot).unwrap();
    assert!(!before.objects.is_empty());

    m.set_model("not-a-model");
    wait(2000).await;
    let during = m.latest(slot).unwrap();
    assert_eq!(during.tick, before.tick);
    assert_eq!(during.objects, before.objects);

    m.set_model("YOLOv8n");
    wait(500).await;
    let after = m.latest(slot).unwrap();
    assert!(after.tick > before.tick);
    assert_eq!(after.model_name, "YOLOv8n");
}

#[tokio::test(start_paused = true)]
async fn stop_all_asks_for_confirmation() {
    let mut m = manager();
    let (handle, releases) = counted_file("/tmp/a.mp4");
    m.start_stream(SourceRef::LocalFile(handle)).unwrap();
    m.start_stream(remote("rtsp://cam/b")).unwrap();

    let declined = m.stop_all_streams(|n| {
        assert_eq!(n, 2);
        false
    });
    assert_eq!(declined.unwrap(), StopAllOutcome::Declined);
    assert_eq!(m.active_count(), 2);

    let stopped = m.stop_all_streams(|_| true).unwrap();
    assert_eq!(
        stopped,
        StopAllOutcome::Stopped {
            streams: 2,
            released_handles: 1
        }
    );
    assert_eq!(m.active_count(), 0);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn staged_file_bound_to_a_slot_is_not_released_on_supersession() {
    let mut m = manager();
    let (handle, releases) = counted_file("/tmp/clip.mp4");
    m.stage_local_file(handle);
    let slot = m.start_staged().unwrap();

    m.stage_url("rtsp://cam/next").unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    m.stop_stream(slot).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn session_summarizes_active_slots() {
    let mut m = manager();
    m.start_stream(remote("rtsp://cam/1")).unwrap();
    m.start_stream(remote("rtsp://cam/2")).unwrap();
    wait(4000).await;

    let frames: Vec<_> = (0..2).map(|i| m.latest(i).unwrap()).collect();
    let mut store = MemoryStore::new();
    let record = SessionRecorder::save("Rush hour", &m, &mut store).unwrap();

    let expected_total: u32 = frames.iter().map(|f| f.snapshot.total).sum();
    assert_eq!(record.total_vehicles, expected_total);
    assert_eq!(record.vehicle_counts.iter().map(|c| c.count).sum::<u32>(), expected_total);
    assert_eq!(record.duration, "00:00:04");
    assert_eq!(record.model_used, "YOLO-FDE (Ours)");
    assert_eq!(record.source_label, "Rush hour");
    assert!(record.avg_fps > 0.0);
    assert!(record.id.starts_with("sess_"));
    let saved = store.load_sessions().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, record.id);

    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn warming_slot_does_not_drag_session_fps_down() {
    let mut m = manager();
    m.start_stream(remote("rtsp://cam/steady")).unwrap();
    wait(4000).await;
    let steady = m.latest(0).unwrap();
    assert!(steady.stats.ticks > 0);

    let warming = m.start_stream(remote("rtsp://cam/fresh")).unwrap();
    assert!(m.latest(warming).unwrap().is_connecting());

    let record = SessionRecorder::capture("Mixed", &m).unwrap();
    let expected = (steady.stats.avg_fps() * 10.0).round() / 10.0;
    assert_eq!(record.avg_fps, expected);
    assert_eq!(record.total_vehicles, steady.snapshot.total);
}

#[tokio::test(start_paused = true)]
async fn extreme_model_rate_keeps_the_slot_ticking() {
    let config = DashboardConfig {
        seed: Some(7),
        default_model: "fast".into(),
        ..DashboardConfig::default()
    };
    let catalog = ModelCatalog::from_profiles(vec![ModelProfile::new("fast", 50.0, 1e13)]);
    let mut m = StreamManager::new(config, catalog);
    assert_eq!(m.current_interval(), Some(MIN_TICK_INTERVAL));
    let slot = m.start_stream(remote("rtsp://cam/fast")).unwrap();

    wait(2550).await;
    let first = m.latest(slot).unwrap();
    assert_eq!(first.phase, GatePhase::Open);
    assert!(first.tick > 0);

    wait(50).await;
    let later = m.latest(slot).unwrap();
    assert!(later.tick > first.tick, "{} -> {}", first.tick, later.tick);
}

#[tokio::test(start_paused = true)]
async fn released_staged_file_cannot_be_started_again() {
    let mut m = manager();
    let (handle, releases) = counted_file("/tmp/once.mp4");
    m.stage_local_file(handle);
    let slot = m.start_staged().unwrap();
    m.stop_stream(slot).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert!(m.staged().is_none());

    assert!(matches!(m.start_staged(), Err(DashboardError::EmptySource)));
    assert_eq!(m.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn released_handle_is_rejected_by_start() {
    let mut m = manager();
    let handle = LocalFileHandle::new("/tmp/gone.mp4");
    assert!(handle.release());
    let err = m.start_stream(SourceRef::LocalFile(handle)).unwrap_err();
    assert!(matches!(err, DashboardError::ReleasedSource { .. }));
    assert_eq!(m.active_count(), 0);
}
