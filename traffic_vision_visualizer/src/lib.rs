// THEORY:
// The visualizer is the network face of the dashboard. A single actor task owns the
// `StreamManager`; everything else talks to it through a `ControlHandle` and reads
// its output from a `FrameBus`.
//
// Key architectural principles:
// 1.  **Single Owner**: Slot lifecycle calls need `&mut StreamManager`, so only the
//     actor touches it. HTTP handlers send commands and await a oneshot reply.
// 2.  **Render Once, Fan Out**: The actor paints each current slot frame into that
//     slot's overlay canvas, encodes it to PNG once and broadcasts the bytes. Any
//     number of WebSocket clients share the same encoded frame.
// 3.  **Stale Frames Never Leave**: Frames from a stopped occupant are filtered with
//     `is_current` before painting, so clients only ever see the live generation.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use traffic_vision::core_modules::gate::GatePhase;
use traffic_vision::core_modules::slot::SlotStatus;
use traffic_vision::stream_manager::StopOutcome;
use traffic_vision::{
    AggregateSnapshot, DashboardError, OverlayCanvas, OverlayRenderer, SlotFrame, SourceRef,
    StreamManager, Theme,
};

/// One slot's overlay layer, PNG encoded.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub slot: usize,
    pub generation: u64,
    pub ts_millis: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl FramePacket {
    /// Wire form for binary WebSocket messages: one slot byte, then the PNG.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 1);
        out.push(self.slot as u8);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Display metadata for one slot frame.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub slot: usize,
    pub generation: u64,
    pub phase: GatePhase,
    pub is_inferencing: bool,
    pub model_name: String,
    pub source_label: Option<String>,
    pub tick: u64,
    pub object_count: usize,
    pub snapshot: AggregateSnapshot,
    pub avg_fps: f64,
}

impl Meta {
    pub fn from_frame(frame: &SlotFrame) -> Self {
        Self {
            slot: frame.slot,
            generation: frame.generation,
            phase: frame.phase,
            is_inferencing: frame.is_inferencing,
            model_name: frame.model_name.clone(),
            source_label: frame.source_label.clone(),
            tick: frame.tick,
            object_count: frame.objects.len(),
            snapshot: frame.snapshot.clone(),
            avg_fps: frame.stats.avg_fps(),
        }
    }
}

#[derive(Clone)]
pub struct FrameBus {
    pub frames_tx: broadcast::Sender<FramePacket>,
    pub meta_tx: broadcast::Sender<Meta>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (meta_tx, _) = broadcast::channel::<Meta>(capacity.max(1));
        Self { frames_tx, meta_tx }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Overlay canvas size every slot is rendered at.
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub theme: Theme,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            canvas_width: 640,
            canvas_height: 360,
            theme: Theme::Light,
        }
    }
}

impl ServerConfig {
    /// Defaults with `TV_BIND` applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(bind) = std::env::var("TV_BIND") {
            if !bind.trim().is_empty() {
                cfg.bind_addr = bind.trim().to_string();
            }
        }
        cfg
    }
}

/// A slot's status together with its latest metadata, as served by `/api/slots`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub status: SlotStatus,
    pub meta: Option<Meta>,
}

enum ControlCommand {
    Start {
        source: String,
        reply: oneshot::Sender<Result<usize, DashboardError>>,
    },
    Stop {
        slot: usize,
        reply: oneshot::Sender<Result<StopOutcome, DashboardError>>,
    },
    Slots {
        reply: oneshot::Sender<Vec<SlotView>>,
    },
}

#[derive(Clone)]
pub struct ControlHandle {
    cmd_tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    /// Starts a typed source in the first free slot.
    pub async fn start(&self, source: impl Into<String>) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Start {
            source: source.into(),
            reply,
        })
        .await?;
        Ok(rx.await.context("dashboard actor dropped the reply")??)
    }

    pub async fn stop(&self, slot: usize) -> anyhow::Result<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Stop { slot, reply }).await?;
        Ok(rx.await.context("dashboard actor dropped the reply")??)
    }

    pub async fn slots(&self) -> anyhow::Result<Vec<SlotView>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Slots { reply }).await?;
        rx.await.context("dashboard actor dropped the reply")
    }

    async fn send(&self, cmd: ControlCommand) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("dashboard actor is not running"))
    }
}

/// Encodes an overlay layer as PNG.
pub fn encode_png(image: &RgbaImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .context("encode overlay png")?;
    Ok(buf.into_inner())
}

/// Spawns the actor that owns `manager`. Must be called from within a tokio runtime.
pub fn spawn_dashboard(
    manager: StreamManager,
    bus: FrameBus,
    renderer: OverlayRenderer,
    cfg: &ServerConfig,
) -> (ControlHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let canvases = (0..manager.capacity())
        .map(|_| OverlayCanvas::new(renderer.clone(), cfg.canvas_width, cfg.canvas_height, cfg.theme))
        .collect();
    let task = tokio::spawn(run_dashboard(manager, cmd_rx, bus, canvases));
    (ControlHandle { cmd_tx }, task)
}

async fn run_dashboard(
    mut manager: StreamManager,
    mut cmd_rx: mpsc::Receiver<ControlCommand>,
    bus: FrameBus,
    mut canvases: Vec<OverlayCanvas>,
) {
    let mut frames = manager.subscribe();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut manager, cmd),
                None => break,
            },
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if !manager.is_current(&frame) {
                        continue;
                    }
                    if let Some(canvas) = canvases.get_mut(frame.slot) {
                        publish_frame(&bus, canvas, &frame);
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "slot frames lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    manager.shutdown().await;
    info!("dashboard actor stopped");
}

fn handle_command(manager: &mut StreamManager, cmd: ControlCommand) {
    match cmd {
        ControlCommand::Start { source, reply } => {
            let res = SourceRef::parse(&source).and_then(|s| manager.start_stream(s));
            let _ = reply.send(res);
        }
        ControlCommand::Stop { slot, reply } => {
            let _ = reply.send(manager.stop_stream(slot));
        }
        ControlCommand::Slots { reply } => {
            let views = manager
                .slots()
                .into_iter()
                .map(|status| SlotView {
                    meta: manager.latest(status.index).as_ref().map(Meta::from_frame),
                    status,
                })
                .collect();
            let _ = reply.send(views);
        }
    }
}

fn publish_frame(bus: &FrameBus, canvas: &mut OverlayCanvas, frame: &SlotFrame) {
    canvas.apply(frame);
    let _ = bus.meta_tx.send(Meta::from_frame(frame));

    // Encoding is the expensive part; skip it with nobody watching.
    if bus.frames_tx.receiver_count() == 0 {
        return;
    }
    match encode_png(canvas.image()) {
        Ok(png) => {
            let (width, height) = canvas.image().dimensions();
            let _ = bus.frames_tx.send(FramePacket {
                slot: frame.slot,
                generation: frame.generation,
                ts_millis: now_millis(),
                width,
                height,
                data: Arc::from(png),
            });
        }
        Err(e) => warn!(slot = frame.slot, error = %e, "overlay frame dropped"),
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(feature = "web")]
pub async fn start_server(
    bus: FrameBus,
    cfg: ServerConfig,
    control: ControlHandle,
) -> anyhow::Result<JoinHandle<()>> {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[derive(Clone)]
    struct AppState {
        bus: FrameBus,
        control: ControlHandle,
    }

    fn error_response(err: anyhow::Error) -> Response {
        let status = match err.downcast_ref::<DashboardError>() {
            Some(DashboardError::CapacityExceeded { .. }) => StatusCode::CONFLICT,
            Some(
                DashboardError::EmptySource
                | DashboardError::ReleasedSource { .. }
                | DashboardError::InvalidSlot { .. },
            ) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, err.to_string()).into_response()
    }

    async fn slots(State(state): State<AppState>) -> Response {
        match state.control.slots().await {
            Ok(views) => Json(views).into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn start(State(state): State<AppState>, body: String) -> Response {
        match state.control.start(body).await {
            Ok(slot) => Json(serde_json::json!({ "slot": slot })).into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn stop(State(state): State<AppState>, Path(slot): Path<usize>) -> Response {
        match state.control.stop(slot).await {
            Ok(outcome) => Json(serde_json::json!({
                "was_active": outcome.was_active,
                "released_handle": outcome.released_handle,
            }))
            .into_response(),
            Err(e) => error_response(e),
        }
    }

    async fn ws_meta(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
        let rx = state.bus.meta_tx.subscribe();
        ws.on_upgrade(move |socket| forward_meta(socket, rx))
    }

    async fn forward_meta(mut socket: WebSocket, mut rx: broadcast::Receiver<Meta>) {
        loop {
            match rx.recv().await {
                Ok(meta) => {
                    let Ok(txt) = serde_json::to_string(&meta) else { continue };
                    if socket.send(Message::Text(txt)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn ws_frames(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
        let rx = state.bus.frames_tx.subscribe();
        ws.on_upgrade(move |socket| forward_frames(socket, rx))
    }

    async fn forward_frames(mut socket: WebSocket, mut rx: broadcast::Receiver<FramePacket>) {
        loop {
            match rx.recv().await {
                Ok(pkt) => {
                    if socket.send(Message::Binary(pkt.to_wire())).await.is_err() {
                        break;
                    }
                }
                // Overlay frames are replaceable; a slow client just misses some.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/slots", get(slots))
        .route("/control/start", post(start))
        .route("/control/stop/:slot", post(stop))
        .route("/ws/meta", get(ws_meta))
        .route("/ws/frames", get(ws_frames))
        .with_state(AppState { bus, control });

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "visualizer server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "visualizer server exited");
        }
    });
    Ok(server)
}

#[cfg(not(feature = "web"))]
pub async fn start_server(
    _bus: FrameBus,
    _cfg: ServerConfig,
    _control: ControlHandle,
) -> anyhow::Result<JoinHandle<()>> {
    Err(anyhow::anyhow!("web feature not enabled for traffic_vision_visualizer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use traffic_vision::{DashboardConfig, ModelCatalog};

    fn dashboard(bus: &FrameBus) -> (ControlHandle, JoinHandle<()>) {
        let config = DashboardConfig {
            seed: Some(9),
            ..DashboardConfig::default()
        };
        let manager = StreamManager::new(config, ModelCatalog::builtin());
        let cfg = ServerConfig {
            canvas_width: 160,
            canvas_height: 90,
            ..ServerConfig::default()
        };
        spawn_dashboard(manager, bus.clone(), OverlayRenderer::new(), &cfg)
    }

    #[test]
    fn png_encoding_produces_png_signature() {
        let png = encode_png(&RgbaImage::new(4, 4)).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn packet_timestamps_are_unix_millis() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let ts = now_millis();
        // 2020-01-01T00:00:00Z
        assert!(ts >= 1_577_836_800_000);
        assert!(ts >= before);
    }

    #[test]
    fn wire_form_prefixes_slot_index() {
        let pkt = FramePacket {
            slot: 3,
            generation: 1,
            ts_millis: 0,
            width: 1,
            height: 1,
            data: Arc::from(vec![7u8, 8]),
        };
        assert_eq!(pkt.to_wire(), vec![3, 7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn control_handle_drives_slots_and_frames() {
        let bus = FrameBus::new(64);
        let mut frames = bus.frames_tx.subscribe();
        let (control, task) = dashboard(&bus);

        assert!(control.start("   ").await.is_err());
        assert_eq!(control.start("rtsp://cam/1").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        let views = control.slots().await.unwrap();
        let meta = views[0].meta.as_ref().expect("meta for running slot");
        assert_eq!(meta.phase, GatePhase::Open);
        assert!(meta.object_count > 0);
        assert!(views[1].meta.is_none());

        let pkt = frames.recv().await.unwrap();
        assert_eq!(pkt.slot, 0);
        assert_eq!((pkt.width, pkt.height), (160, 90));

        let outcome = control.stop(0).await.unwrap();
        assert!(outcome.was_active);
        let err = control.stop(9).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DashboardError>(),
            Some(DashboardError::InvalidSlot { .. })
        ));

        drop(control);
        task.await.unwrap();
    }
}
