//! keyline
//!
//! Broadcast graphics playout renderer. Two off-screen surfaces (preview and
//! program) render HTML templates; their frames are captured as BGRA at the
//! broadcast rate, blended during MIX transitions, and fanned out to SDI,
//! NDI and window sinks while a WebSocket control plane drives the show.

mod asrun;
mod capture;
mod config;
mod control;
mod crash;
mod engine;
mod error;
mod health;
mod logging;
mod mix;
mod output;
mod pipeline;
mod surface;
mod template;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::asrun::AsRunLog;
use crate::config::Config;
use crate::control::{ControlContext, ControlServer};
use crate::engine::PlayoutEngine;
use crate::health::{HealthState, PlayoutStats};
use crate::output::{OutputManager, SdiConfigView, SdiHardware, SdiOutput, SdiPort};
use crate::pipeline::PlayoutPipeline;
use crate::surface::{HeadlessSurface, SurfaceHandle};
use crate::template::Compositor;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging()?;
    info!("keyline {} starting...", env!("CARGO_PKG_VERSION"));

    match logging::get_log_dir().and_then(|dir| Ok(crash::init_crash_handler(&dir)?)) {
        Ok(path) => info!("Crash log at {:?}", path),
        Err(err) => warn!("Failed to install crash handler: {err}"),
    }

    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    let size = config.video.size();
    let frame_rate = config.video.frame_rate;

    // Headless surface pair until a rendering engine binding is integrated.
    let pvw = Arc::new(HeadlessSurface::new("surface-a", size, frame_rate));
    let pgm = Arc::new(HeadlessSurface::new("surface-b", size, frame_rate));
    let pvw_handle: SurfaceHandle = pvw;
    let pgm_handle: SurfaceHandle = pgm;

    let engine = PlayoutEngine::new();
    engine
        .attach_surfaces(pvw_handle.clone(), pgm_handle.clone())
        .await;

    let manager = Arc::new(OutputManager::new());
    register_outputs(&config, &manager);
    info!("Active outputs: {:?}", manager.active_outputs());

    let (notices_tx, notices_rx) = mpsc::unbounded_channel();
    let server = ControlServer::new(
        ControlContext {
            engine: engine.clone(),
            manager: manager.clone(),
            compositor: StdMutex::new(Compositor::new(
                config.templates.cache_max_bytes as usize,
            )),
            auth_token: config.control.auth_token.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resolution: size,
            frame_rate,
        },
        notices_tx,
    );
    let _control_task = server.clone().serve(config.control.port).await?;

    let stats = Arc::new(PlayoutStats::default());
    if config.health.port != 0 {
        let state = Arc::new(HealthState {
            engine: engine.clone(),
            stats: stats.clone(),
            started: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        let _health_task = health::serve(state, config.health.port).await?;
    } else {
        info!("Health endpoint disabled");
    }

    let asrun = AsRunLog::open(asrun::default_asrun_dir()?);

    let playout = PlayoutPipeline::new(
        engine,
        manager,
        server,
        asrun,
        stats,
        size,
        frame_rate,
        notices_rx,
    );
    playout.watch_surface(&pvw_handle);
    playout.watch_surface(&pgm_handle);

    // Ctrl+C drains the pipeline before the process exits.
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
            let _ = shutdown_tx.send(()).await;
        }
    });

    playout.run(shutdown_rx).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Try each configured sink factory once. A factory that fails leaves a
/// reduced mode behind, never a dead process.
fn register_outputs(config: &Config, manager: &OutputManager) {
    if config.outputs.sdi.enabled {
        let view = SdiConfigView {
            fill_device: config.outputs.sdi.fill_device,
            key_device: config.outputs.sdi.key_device,
            display_mode: config.outputs.sdi.display_mode.clone(),
        };
        match SdiOutput::open(&UnboundSdi, &view) {
            Ok(out) => manager.add_output(Box::new(out)),
            Err(err) => warn!("SDI output unavailable: {err}"),
        }
    }
    if config.outputs.ndi.enabled {
        warn!(
            sender = %config.outputs.ndi.sender_name,
            "NDI output enabled but no sender binding is integrated"
        );
    }
    if config.outputs.rgb_monitor >= 0 || config.outputs.alpha_monitor >= 0 {
        warn!("window outputs enabled but no display binding is integrated");
    }
}

/// Placeholder SDI hardware for builds without a vendor binding; every open
/// fails cleanly and the manager runs without the sink.
struct UnboundSdi;

impl SdiHardware for UnboundSdi {
    fn open_port(&self, device_index: u32, _display_mode: &str) -> anyhow::Result<Box<dyn SdiPort>> {
        anyhow::bail!("no SDI device binding compiled into this build (device {device_index})")
    }
}

fn print_help() {
    println!("keyline - broadcast graphics playout renderer");
    println!();
    println!("USAGE:");
    println!("    keyline [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help    Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g. debug, info, warn)");
    println!("    KEYLINE_LOG_PATH    Override the log directory");
}
