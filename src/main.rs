//! Inkboard display server binary.
//!
//! Wires the canvas engine, clock manager, panel sink and update socket
//! together and runs until interrupted.

use anyhow::{Context, Result};
use inkboard::clock::ClockManager;
use inkboard::config::Config;
use inkboard::render::color::parse_color;
use inkboard::render::{BlockRasterizer, DisplayEngine, RenderSettings};
use inkboard::server::SocketServer;
use inkboard::sink::{NullPanel, PanelSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "inkboard=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Inkboard display server");

    let config = Config::load()?;

    let background = parse_color(&config.screen.background)
        .with_context(|| format!("Invalid background color {}", config.screen.background))?;
    let foreground = parse_color(&config.screen.foreground)
        .with_context(|| format!("Invalid foreground color {}", config.screen.foreground))?;
    let state_dir = config.storage.state_dir()?;

    let settings = RenderSettings::new(
        config.screen.width,
        config.screen.height,
        config.screen.rotation,
        background,
        foreground,
        &state_dir,
    )
    .context("Invalid screen configuration")?
    .with_splash(config.screen.splash.as_ref().map(PathBuf::from))
    .with_include_command(config.server.include_commands);

    let engine = Arc::new(
        DisplayEngine::new(settings, Box::new(BlockRasterizer))
            .context("Failed to create display engine")?,
    );

    // Panel and socket subscribe before restore so the initial state
    // reaches them as ordinary change notifications.
    if config.panel.driver != "none" {
        warn!(driver = %config.panel.driver, "Unknown panel driver, running without hardware");
    }
    let panel = NullPanel::new(config.screen.width, config.screen.height);
    let _sink = PanelSink::start(
        Arc::clone(&engine),
        Box::new(panel),
        config.panel.refresh_time()?,
    );
    let server = SocketServer::start(Arc::clone(&engine), config.server.listen_addr()?)
        .await
        .context("Failed to start update socket")?;

    engine.restore().context("State restore failed")?;
    let clocks = ClockManager::new(Arc::clone(&engine));
    clocks.import().await.context("Clock restore failed")?;

    info!(addr = %server.local_addr(), "Inkboard ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("Shutting down");

    Ok(())
}
