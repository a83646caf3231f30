use anyhow::Context;
use clap::{Parser, ValueEnum};
use image::{Rgba, RgbaImage};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use traffic_vision::core_modules::overlay::compose_onto;
use traffic_vision::session::{count_for, JsonFileStore, SessionRecorder, SessionStore};
use traffic_vision::stream_manager::StopAllOutcome;
use traffic_vision::{
    DashboardConfig, LocalFileHandle, ModelCatalog, OverlayCanvas, OverlayRenderer, SourceRef,
    StreamManager, Theme, VehicleClass,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ThemeArg {
    Light,
    Dark,
}

impl From<ThemeArg> for Theme {
    fn from(t: ThemeArg) -> Self {
        match t {
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
        }
    }
}

/// Runs the simulated detection dashboard headless and optionally writes overlay snapshots.
#[derive(Debug, Parser)]
#[command(name = "dashboard_runner")]
struct Args {
    /// Stream sources. Existing paths are treated as uploaded files, anything else as a URL.
    #[arg(required = true)]
    sources: Vec<String>,

    /// JSON config file; `TV_*` env vars and the flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    skip_frames: Option<u32>,

    #[arg(long)]
    confidence: Option<u32>,

    #[arg(long)]
    image_size: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    /// How long to run, in seconds.
    #[arg(long, default_value_t = 10.0)]
    duration_secs: f64,

    #[arg(long, default_value_t = 1000)]
    snapshot_every_ms: u64,

    /// Directory for composited PNG snapshots. Nothing is written when unset.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 360)]
    height: u32,

    #[arg(long, value_enum, default_value_t = ThemeArg::Light)]
    theme: ThemeArg,

    /// TTF/OTF font for label text.
    #[arg(long)]
    font: Option<PathBuf>,

    /// Save a session under this name before exiting.
    #[arg(long)]
    session_name: Option<String>,

    #[arg(long, default_value = "traffic_sessions.json")]
    session_store: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // --- 1. Argument Parsing & Logging ---
    let args = Args::parse();
    let level = args.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    // --- 2. Configuration ---
    let mut config = match &args.config {
        Some(path) => DashboardConfig::from_json_file(path)?,
        None => DashboardConfig::default(),
    };
    config.apply_env()?;
    if let Some(model) = &args.model {
        config.default_model = model.clone();
    }
    if let Some(skip) = args.skip_frames {
        config.skip_frames = skip;
    }
    if let Some(confidence) = args.confidence {
        config.confidence_threshold = confidence;
    }
    if let Some(px) = args.image_size {
        config.image_size = px;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;

    // --- 3. Dashboard Initialization ---
    let catalog = ModelCatalog::builtin();
    if catalog.resolve(&config.default_model).is_none() {
        warn!(model = %config.default_model, "model not in catalog; slots will not tick");
    }
    let mut manager = StreamManager::new(config, catalog);

    let renderer = match &args.font {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
            OverlayRenderer::with_font_bytes(bytes).with_context(|| format!("parse font {}", path.display()))?
        }
        None => OverlayRenderer::new(),
    };
    let mut canvases: Vec<OverlayCanvas> = (0..manager.capacity())
        .map(|_| OverlayCanvas::new(renderer.clone(), args.width, args.height, args.theme.into()))
        .collect();

    for raw in &args.sources {
        let source = if Path::new(raw).exists() {
            let handle = LocalFileHandle::new(raw).with_release_hook(|path| {
                info!(path = %path.display(), "local source released");
            });
            SourceRef::LocalFile(handle)
        } else {
            match SourceRef::parse(raw) {
                Ok(source) => source,
                Err(e) => {
                    warn!(source = %raw, error = %e, "source skipped");
                    continue;
                }
            }
        };
        if let Err(e) = manager.start_stream(source) {
            warn!(source = %raw, error = %e, "source not started");
        }
    }
    if manager.active_count() == 0 {
        anyhow::bail!("no stream could be started");
    }

    if let Some(dir) = &args.out_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    // --- 4. Main Loop ---
    let run_for = Duration::from_secs_f64(args.duration_secs.max(0.0));
    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);
    let mut snapshots = tokio::time::interval(Duration::from_millis(args.snapshot_every_ms.max(1)));
    let mut snapshot_no = 0u32;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = snapshots.tick() => {
                snapshot(&manager, &mut canvases, args.out_dir.as_deref(), snapshot_no)?;
                snapshot_no += 1;
            }
        }
    }

    // --- 5. Session & Shutdown ---
    if let Some(name) = &args.session_name {
        let mut store = JsonFileStore::new(&args.session_store);
        let record = SessionRecorder::save(name, &manager, &mut store)?;
        info!(
            id = %record.id,
            total = record.total_vehicles,
            duration = %record.duration,
            avg_fps = record.avg_fps,
            saved = store.load_sessions()?.len(),
            store = %store.path().display(),
            "session saved"
        );
        for class in VehicleClass::ALL {
            info!(class = ?class, count = count_for(&record, class), "session class count");
        }
    }

    if let StopAllOutcome::Stopped { streams, released_handles } = manager.stop_all_streams(|_| true)? {
        info!(streams, released_handles, "all streams stopped");
    }
    manager.shutdown().await;
    Ok(())
}

/// Logs every active slot and, with an output directory, writes one composited PNG per slot.
fn snapshot(
    manager: &StreamManager,
    canvases: &mut [OverlayCanvas],
    out_dir: Option<&Path>,
    n: u32,
) -> anyhow::Result<()> {
    for active in manager.active_streams() {
        let Some(frame) = active.frame else { continue };
        info!(
            slot = frame.slot,
            phase = ?frame.phase,
            total = frame.snapshot.total,
            fps = frame.snapshot.fps,
            "slot snapshot"
        );

        let Some(dir) = out_dir else { continue };
        let canvas = &mut canvases[frame.slot];
        canvas.apply(&frame);
        let mut composed = road_background(canvas.image().width(), canvas.image().height(), frame.slot);
        compose_onto(&mut composed, canvas.image());
        let path = dir.join(format!("slot{}_{:04}.png", frame.slot, n));
        composed
            .save(&path)
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// A plain stand-in for a decoded video frame: asphalt with dashed lane lines.
fn road_background(width: u32, height: u32, slot: usize) -> RgbaImage {
    let shade = 60 + (slot as u8) * 8;
    let lanes = 4;
    RgbaImage::from_fn(width, height, |x, y| {
        let lane_w = (width / lanes).max(1);
        let on_line = x % lane_w < 2 && x >= lane_w && (y / 12) % 2 == 0;
        if on_line {
            Rgba([230, 230, 230, 255])
        } else {
            let g = shade + ((y * 30) / height.max(1)) as u8;
            Rgba([g, g, g, 255])
        }
    })
}
