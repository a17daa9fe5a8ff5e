//! Health endpoint
//!
//! A minimal HTTP listener on its own port: `GET /health` answers with a
//! JSON summary (503 when the engine is on air but frames stopped flowing),
//! `GET /metrics` with a Prometheus text exposition of the same measurements.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::{EngineState, PlayoutEngine};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared observability counters, written by the wiring layer and read by
/// the health handlers and the control broadcasts.
#[derive(Default)]
pub struct PlayoutStats {
    fps_millis: AtomicU64,
    dropped: AtomicU64,
    total_frames: AtomicU64,
    clients: AtomicUsize,
}

impl PlayoutStats {
    pub fn record_capture(&self, fps: f64, dropped: u64, total_frames: u64) {
        self.fps_millis
            .store((fps * 1000.0) as u64, Ordering::Relaxed);
        self.dropped.store(dropped, Ordering::Relaxed);
        self.total_frames.store(total_frames, Ordering::Relaxed);
    }

    /// Output stopped; the measured rate is zero until capture resumes.
    pub fn reset_rate(&self) {
        self.fps_millis.store(0, Ordering::Relaxed);
    }

    pub fn set_clients(&self, clients: usize) {
        self.clients.store(clients, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        self.fps_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

pub struct HealthState {
    pub engine: Arc<PlayoutEngine>,
    pub stats: Arc<PlayoutStats>,
    pub started: Instant,
    pub version: String,
}

/// Bind and serve. A port of zero disables the endpoint; callers check that
/// before calling here.
pub async fn serve(state: Arc<HealthState>, port: u16) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state);
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "health endpoint terminated");
        }
    }))
}

async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let engine_state = state.engine.snapshot().await.state;
    let (degraded, body) = summarize(
        engine_state,
        state.stats.fps(),
        state.stats.dropped(),
        state.stats.total_frames(),
        state.started.elapsed().as_secs(),
        state.stats.clients(),
        &state.version,
    );
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, response_headers("application/json"), body.to_string())
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let engine_state = state.engine.snapshot().await.state;
    let body = render_metrics(
        engine_state,
        state.stats.fps(),
        state.stats.dropped(),
        state.stats.total_frames(),
        state.started.elapsed().as_secs(),
        state.stats.clients(),
    );
    (
        StatusCode::OK,
        response_headers(METRICS_CONTENT_TYPE),
        body,
    )
}

fn response_headers(content_type: &'static str) -> [(HeaderName, &'static str); 3] {
    [
        (header::CONTENT_TYPE, content_type),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::CACHE_CONTROL, "no-cache"),
    ]
}

/// An on-air engine with zero measured output is a stall.
fn summarize(
    state: EngineState,
    fps: f64,
    dropped: u64,
    total_frames: u64,
    uptime_sec: u64,
    clients: usize,
    version: &str,
) -> (bool, serde_json::Value) {
    let degraded = state.is_on_air() && fps == 0.0;
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "engine": state.as_str(),
        "fps": fps,
        "dropped": dropped,
        "totalFrames": total_frames,
        "uptimeSec": uptime_sec,
        "clients": clients,
        "version": version,
    });
    (degraded, body)
}

fn render_metrics(
    state: EngineState,
    fps: f64,
    dropped: u64,
    total_frames: u64,
    uptime_sec: u64,
    clients: usize,
) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(1024);
    let mut metric = |name: &str, help: &str, kind: &str, value: String| {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    };
    metric(
        "keyline_output_fps",
        "Measured output frame rate over the last second.",
        "gauge",
        format!("{fps}"),
    );
    metric(
        "keyline_frames_total",
        "Frames emitted by the capture pipeline.",
        "counter",
        format!("{total_frames}"),
    );
    metric(
        "keyline_frames_dropped_total",
        "Paint events discarded as unusable.",
        "counter",
        format!("{dropped}"),
    );
    metric(
        "keyline_uptime_seconds",
        "Seconds since the renderer started.",
        "gauge",
        format!("{uptime_sec}"),
    );
    metric(
        "keyline_control_clients",
        "Connected control-plane sessions.",
        "gauge",
        format!("{clients}"),
    );
    metric(
        "keyline_on_air",
        "1 while a template is on program output.",
        "gauge",
        format!("{}", u8::from(state.is_on_air())),
    );
    out
}
