//! Playout wiring
//!
//! The coordinator that owns the moving parts around the engine: it binds
//! frame capture to whichever surface is currently program, swaps in the
//! black burst generator while idle, orchestrates MIX transitions, feeds the
//! as-run log, fans state and frame stats out to control clients, and runs
//! crash recovery when a renderer dies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::asrun::{AsRunEntry, AsRunEvent, AsRunLog};
use crate::capture::{CaptureStats, FrameCapture, FrameData};
use crate::control::{ControlServer, ServerNotice};
use crate::engine::{EngineEvent, EngineState, PlayoutEngine};
use crate::health::PlayoutStats;
use crate::mix::MixSession;
use crate::output::{BlackBurst, OutputManager};
use crate::surface::{Size, SurfaceFailure, SurfaceHandle};

/// A failure signal raised by one of the surfaces.
#[derive(Debug)]
pub struct SurfaceIncident {
    pub label: String,
    pub failure: SurfaceFailure,
}

pub struct PlayoutPipeline {
    engine: Arc<PlayoutEngine>,
    manager: Arc<OutputManager>,
    server: Arc<ControlServer>,
    asrun: AsRunLog,
    stats: Arc<PlayoutStats>,
    black_burst: BlackBurst,
    size: Size,

    pgm_capture: Option<FrameCapture>,
    mix: Option<(MixSession, Duration)>,
    last_state: EngineState,

    engine_rx: broadcast::Receiver<EngineEvent>,
    stats_tx: mpsc::UnboundedSender<CaptureStats>,
    stats_rx: mpsc::UnboundedReceiver<CaptureStats>,
    notices_rx: mpsc::UnboundedReceiver<ServerNotice>,
    failures_tx: mpsc::UnboundedSender<SurfaceIncident>,
    failures_rx: mpsc::UnboundedReceiver<SurfaceIncident>,
}

impl PlayoutPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<PlayoutEngine>,
        manager: Arc<OutputManager>,
        server: Arc<ControlServer>,
        asrun: AsRunLog,
        stats: Arc<PlayoutStats>,
        size: Size,
        frame_rate: f64,
        notices_rx: mpsc::UnboundedReceiver<ServerNotice>,
    ) -> Self {
        let engine_rx = engine.subscribe();
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            black_burst: BlackBurst::new(size, frame_rate),
            engine,
            manager,
            server,
            asrun,
            stats,
            size,
            pgm_capture: None,
            mix: None,
            last_state: EngineState::Idle,
            engine_rx,
            stats_tx,
            stats_rx,
            notices_rx,
            failures_tx,
            failures_rx,
        }
    }

    /// Route a surface's failure signals into the pipeline.
    pub fn watch_surface(&self, surface: &SurfaceHandle) {
        let tx = self.failures_tx.clone();
        let label = surface.label().to_string();
        surface.set_failure_listener(Some(Box::new(move |failure| {
            let _ = tx.send(SurfaceIncident {
                label: label.clone(),
                failure,
            });
        })));
    }

    /// Main loop. Returns after a shutdown message arrives.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!("playout pipeline starting");
        // Idle at boot: black burst keeps the outputs locked.
        self.enter_idle();

        loop {
            tokio::select! {
                event = self.engine_rx.recv() => match event {
                    Ok(event) => self.handle_engine_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "engine event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(stats) = self.stats_rx.recv() => self.handle_stats(stats),
                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice),
                Some(incident) = self.failures_rx.recv() => self.handle_incident(incident).await,
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::State(snapshot) => {
                let state = snapshot.state;
                crate::crash::note_playout(&snapshot);
                self.server.broadcast_state(snapshot);
                if state == EngineState::Idle && self.last_state != EngineState::Idle {
                    self.enter_idle();
                }
                self.last_state = state;
            }
            EngineEvent::Load(payload) => {
                self.asrun
                    .write(AsRunEntry::new(AsRunEvent::Load).with_template(&payload));
            }
            EngineEvent::Update(variables) => {
                self.asrun
                    .write(AsRunEntry::new(AsRunEvent::Update).with_variables(variables));
            }
            EngineEvent::UpdatePgm(variables) => {
                self.asrun
                    .write(AsRunEntry::new(AsRunEvent::UpdatePgm).with_variables(variables));
            }
            EngineEvent::Take => {
                let mix_duration = self.mix.take().map(|(session, duration)| {
                    session.finish();
                    duration
                });
                self.black_burst.stop();
                self.rebind_program_capture().await;

                let mut entry = AsRunEntry::new(AsRunEvent::Take);
                if let Some(template) = self.engine.snapshot().await.pgm_template.as_ref() {
                    entry = entry.with_template(template);
                }
                if let Some(duration) = mix_duration {
                    entry = entry.with_duration_ms(duration.as_millis() as u64);
                }
                self.asrun.write(entry);
            }
            EngineEvent::Clear => {
                self.asrun.write(AsRunEntry::new(AsRunEvent::Clear));
            }
            EngineEvent::Freeze(frozen) => {
                if let Some(capture) = self.pgm_capture.as_ref() {
                    capture.set_frozen(frozen);
                }
                let event = if frozen {
                    AsRunEvent::Freeze
                } else {
                    AsRunEvent::Unfreeze
                };
                self.asrun.write(AsRunEntry::new(event));
            }
            EngineEvent::MixStart { duration, .. } => self.begin_mix(duration).await,
            EngineEvent::MixCancel => {
                if let Some((session, _)) = self.mix.take() {
                    session.finish();
                    self.restore_capture_routing();
                }
            }
            EngineEvent::Next => {}
        }
    }

    fn handle_stats(&self, stats: CaptureStats) {
        self.stats
            .record_capture(stats.fps, stats.dropped, stats.total_frames);
        self.server.broadcast_stats(stats.fps, stats.dropped);
    }

    fn handle_notice(&mut self, notice: ServerNotice) {
        match notice {
            ServerNotice::ClientConnected { total_clients }
            | ServerNotice::ClientDisconnected { total_clients } => {
                self.stats.set_clients(total_clients);
            }
            // Advisory by design decision; the payload is surfaced, not applied.
            ServerNotice::SetOutput(value) => {
                info!(payload = %value, "setOutput received");
            }
        }
    }

    /// Crash recovery: record the incident, reload the dead surface and drop
    /// back to black when the program side died on air.
    async fn handle_incident(&mut self, incident: SurfaceIncident) {
        match incident.failure {
            SurfaceFailure::RendererGone { reason } => {
                error!(surface = %incident.label, reason = %reason, "renderer gone, recovering");
                self.asrun.write(
                    AsRunEntry::new(AsRunEvent::CrashRecovery)
                        .with_details(format!("{}: {}", incident.label, reason)),
                );

                let pgm = self.engine.pgm_surface().await;
                let failed_is_pgm = pgm
                    .as_ref()
                    .map(|s| s.label() == incident.label)
                    .unwrap_or(false);
                let failed = if failed_is_pgm {
                    pgm
                } else {
                    self.engine
                        .pvw_surface()
                        .await
                        .filter(|s| s.label() == incident.label)
                };
                if let Some(surface) = failed {
                    if let Err(err) = surface.reload().await {
                        error!(surface = %incident.label, error = %err, "surface reload failed");
                    }
                }

                if failed_is_pgm && self.engine.snapshot().await.state == EngineState::OnAir {
                    if let Err(err) = self.engine.clear().await {
                        error!(error = %err, "clear after renderer loss failed");
                    }
                }

                self.server.broadcast_state(self.engine.snapshot().await);
            }
            SurfaceFailure::Unresponsive => {
                warn!(surface = %incident.label, "surface unresponsive");
                self.asrun.write(
                    AsRunEntry::new(AsRunEvent::Error)
                        .with_details(format!("{} unresponsive", incident.label)),
                );
            }
        }
    }

    async fn begin_mix(&mut self, duration: Duration) {
        let Some(incoming) = self.engine.pvw_surface().await else {
            return;
        };
        self.black_burst.stop();
        if self.pgm_capture.is_none() {
            if let Some(pgm) = self.engine.pgm_surface().await {
                self.pgm_capture = Some(self.attach_capture(pgm));
            }
        }
        let Some(capture) = self.pgm_capture.as_ref() else {
            return;
        };
        let session = MixSession::begin(
            capture,
            incoming,
            self.manager.clone(),
            self.size,
            duration,
        );
        self.mix = Some((session, duration));
    }

    /// After TAKE the single capture follows whichever surface is now
    /// program. Captures only re-attach after destroy, so the old one goes
    /// first.
    async fn rebind_program_capture(&mut self) {
        if let Some(old) = self.pgm_capture.take() {
            old.destroy();
        }
        if let Some(pgm) = self.engine.pgm_surface().await {
            self.pgm_capture = Some(self.attach_capture(pgm));
        }
    }

    fn attach_capture(&self, surface: SurfaceHandle) -> FrameCapture {
        let manager = self.manager.clone();
        FrameCapture::attach(
            surface,
            Box::new(move |frame: FrameData<'_>| {
                manager.push_frame(frame.buffer, Size::new(frame.width, frame.height));
            }),
            Some(self.stats_tx.clone()),
            None,
        )
    }

    fn restore_capture_routing(&self) {
        if let Some(capture) = self.pgm_capture.as_ref() {
            let manager = self.manager.clone();
            capture.set_sink(Box::new(move |frame: FrameData<'_>| {
                manager.push_frame(frame.buffer, Size::new(frame.width, frame.height));
            }));
        }
    }

    fn enter_idle(&mut self) {
        if let Some((session, _)) = self.mix.take() {
            session.finish();
        }
        if let Some(capture) = self.pgm_capture.take() {
            capture.destroy();
        }
        self.stats.reset_rate();
        let manager = self.manager.clone();
        self.black_burst
            .start(move |frame, size| manager.push_frame(frame, size));
    }

    async fn shutdown(mut self) {
        if let Some((session, _)) = self.mix.take() {
            session.finish();
        }
        if let Some(capture) = self.pgm_capture.take() {
            capture.destroy();
        }
        self.black_burst.stop();
        self.manager.shutdown();
        self.asrun.close().await;
        info!("playout pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlContext;
    use crate::output::test_support::TestSink;
    use crate::surface::HeadlessSurface;
    use crate::template::{Compositor, TemplatePayload};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct Stack {
        engine: Arc<PlayoutEngine>,
        a: Arc<HeadlessSurface>,
        frames: Arc<StdMutex<Vec<Vec<u8>>>>,
        shutdown_tx: mpsc::Sender<()>,
        task: tokio::task::JoinHandle<Result<()>>,
        asrun_dir: std::path::PathBuf,
    }

    async fn stack() -> Stack {
        let size = Size::new(2, 2);
        let engine = PlayoutEngine::new();
        let a = Arc::new(HeadlessSurface::new("surface-a", size, 25.0));
        let b = Arc::new(HeadlessSurface::new("surface-b", size, 25.0));
        engine.attach_surfaces(a.clone(), b.clone()).await;

        let manager = Arc::new(OutputManager::new());
        let sink = TestSink::new("spy");
        let frames = sink.frames.clone();
        manager.add_output(Box::new(sink));

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let server = ControlServer::new(
            ControlContext {
                engine: engine.clone(),
                manager: manager.clone(),
                compositor: StdMutex::new(Compositor::new(0)),
                auth_token: None,
                version: "test".to_string(),
                resolution: size,
                frame_rate: 25.0,
            },
            notices_tx,
        );

        let asrun_dir =
            std::env::temp_dir().join(format!("keyline-pipeline-{}", uuid::Uuid::new_v4()));
        let asrun = AsRunLog::open(asrun_dir.clone());
        let stats = Arc::new(PlayoutStats::default());

        let pipeline = PlayoutPipeline::new(
            engine.clone(),
            manager.clone(),
            server,
            asrun,
            stats,
            size,
            25.0,
            notices_rx,
        );
        let handle_a: SurfaceHandle = a.clone();
        let handle_b: SurfaceHandle = b.clone();
        pipeline.watch_surface(&handle_a);
        pipeline.watch_surface(&handle_b);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(pipeline.run(shutdown_rx));
        settle().await;

        Stack {
            engine,
            a,
            frames,
            shutdown_tx,
            task,
            asrun_dir,
        }
    }

    impl Stack {
        async fn stop(self) -> Vec<serde_json::Value> {
            let _ = self.shutdown_tx.send(()).await;
            let _ = self.task.await;
            let day = chrono::Utc::now().date_naive();
            let path = self
                .asrun_dir
                .join(format!("as-run-{}.jsonl", day.format("%Y-%m-%d")));
            let entries = std::fs::read_to_string(&path)
                .map(|contents| {
                    contents
                        .lines()
                        .map(|l| serde_json::from_str(l).unwrap())
                        .collect()
                })
                .unwrap_or_default();
            let _ = std::fs::remove_dir_all(&self.asrun_dir);
            entries
        }
    }

    /// Let the pipeline task drain its event queue (paused-clock friendly).
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    fn payload(body: &str) -> TemplatePayload {
        TemplatePayload {
            body: body.to_string(),
            stylesheet: None,
            variables: HashMap::new(),
            template_id: Some("t-1".to_string()),
            dialect: Default::default(),
            manifest: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_output_is_black_burst() {
        let stack = stack().await;
        tokio::time::sleep(Duration::from_millis(125)).await;

        {
            let frames = stack.frames.lock().unwrap();
            assert!(frames.len() >= 2, "black burst must feed the outputs while idle");
            assert!(frames.iter().all(|f| f.iter().all(|&b| b == 0)));
        }
        stack.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn take_switches_the_outputs_from_burst_to_program() {
        let stack = stack().await;
        stack.engine.load(payload("<div>Hi</div>")).await.unwrap();
        stack.engine.take().await.unwrap();
        settle().await;

        stack.frames.lock().unwrap().clear();
        stack.a.paint_now();
        tokio::time::sleep(Duration::from_millis(125)).await;

        {
            let frames = stack.frames.lock().unwrap();
            assert!(!frames.is_empty(), "program frames must reach the sink");
            assert!(
                frames.iter().any(|f| f.iter().any(|&b| b != 0)),
                "program output is the loaded document, not black"
            );
        }

        let entries = stack.stop().await;
        assert!(entries.iter().any(|e| e["event"] == "load"));
        assert!(entries
            .iter()
            .any(|e| e["event"] == "take" && e["templateId"] == "t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_returns_the_outputs_to_black() {
        let stack = stack().await;
        stack.engine.load(payload("x")).await.unwrap();
        stack.engine.take().await.unwrap();
        tokio::time::sleep(Duration::from_millis(85)).await;

        stack.engine.clear().await.unwrap();
        settle().await;
        stack.frames.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(125)).await;

        {
            let frames = stack.frames.lock().unwrap();
            assert!(!frames.is_empty());
            assert!(
                frames.iter().all(|f| f.iter().all(|&b| b == 0)),
                "after clear only black burst frames flow"
            );
        }
        let entries = stack.stop().await;
        assert!(entries.iter().any(|e| e["event"] == "clear"));
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_gone_on_air_recovers_to_idle() {
        let stack = stack().await;
        stack.engine.load(payload("x")).await.unwrap();
        stack.engine.take().await.unwrap();
        settle().await;

        // Surface A is now program; kill its renderer.
        stack.a.inject_failure(SurfaceFailure::RendererGone {
            reason: "compositor crashed".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stack.engine.snapshot().await.state, EngineState::Idle);
        assert!(!stack.a.is_loaded(), "failed surface must be reloaded blank");

        let entries = stack.stop().await;
        let crash: Vec<_> = entries
            .iter()
            .filter(|e| e["event"] == "crash-recovery")
            .collect();
        assert_eq!(crash.len(), 1);
        assert!(crash[0]["details"]
            .as_str()
            .unwrap()
            .contains("compositor crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_event_freezes_the_program_capture() {
        let stack = stack().await;
        stack.engine.load(payload("frozen-doc")).await.unwrap();
        stack.engine.take().await.unwrap();
        settle().await;
        stack.a.set_pixel([1, 2, 3, 0xFF]);
        stack.a.paint_now();
        tokio::time::sleep(Duration::from_millis(85)).await;

        stack.engine.freeze().await.unwrap();
        settle().await;
        stack.frames.lock().unwrap().clear();

        // New paints with a different fill must not reach the output.
        stack.a.set_pixel([0xEE, 0xEE, 0xEE, 0xFF]);
        tokio::time::sleep(Duration::from_millis(125)).await;

        {
            let frames = stack.frames.lock().unwrap();
            assert!(!frames.is_empty(), "held frame keeps being emitted");
            assert!(
                frames.iter().all(|f| &f[..4] == [1, 2, 3, 0xFF]),
                "held frame must predate the freeze"
            );
        }
        let entries = stack.stop().await;
        assert!(entries.iter().any(|e| e["event"] == "freeze"));
    }

    #[tokio::test(start_paused = true)]
    async fn mix_completion_logs_a_take_with_duration() {
        let stack = stack().await;
        stack.engine.load(payload("one")).await.unwrap();
        stack.engine.take().await.unwrap();
        stack.engine.load(payload("two")).await.unwrap();
        settle().await;

        stack
            .engine
            .take_mix(Duration::from_millis(500))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(stack.engine.snapshot().await.state, EngineState::OnAir);
        assert!(!stack.engine.snapshot().await.mixing);

        let entries = stack.stop().await;
        let mix_take = entries
            .iter()
            .find(|e| e["event"] == "take" && e.get("duration").is_some());
        assert_eq!(mix_take.unwrap()["duration"], 500);
    }
}
