use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use traffic_vision::{DashboardConfig, ModelCatalog, OverlayRenderer, StreamManager};
use traffic_vision_visualizer::{FrameBus, ServerConfig, spawn_dashboard, start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("TV_LOG")
        .ok()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let mut config = DashboardConfig::default();
    config.apply_env()?;
    let server_cfg = ServerConfig::from_env();

    let bus = FrameBus::new(config.frame_bus_capacity);
    let manager = StreamManager::new(config, ModelCatalog::builtin());
    let (control, actor) = spawn_dashboard(manager, bus.clone(), OverlayRenderer::new(), &server_cfg);

    let server = start_server(bus, server_cfg, control).await?;
    info!("dashboard running; POST a source to /control/start");
    server.await.ok();
    actor.abort();
    Ok(())
}
