//! The playout state machine

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::surface::{SurfaceHandle, TemplateHook};
use crate::template::TemplatePayload;

use super::{EngineEvent, EngineSnapshot, EngineState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One of the two template slots. TAKE swaps whole slots, so the surface
/// handle and the template it shows always travel together.
struct Slot {
    surface: Option<SurfaceHandle>,
    template: Option<TemplatePayload>,
    ready: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            surface: None,
            template: None,
            ready: false,
        }
    }
}

struct MixTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

struct Inner {
    state: EngineState,
    pvw: Slot,
    pgm: Slot,
    mixing: bool,
    mix_timer: Option<MixTimer>,
    mix_generation: u64,
}

/// The playout engine. Construct once, attach the two surfaces, then drive
/// it with operator commands; subscribers receive [`EngineEvent`]s in the
/// order the engine emitted them.
pub struct PlayoutEngine {
    inner: Mutex<Inner>,
    events: broadcast::Sender<EngineEvent>,
    /// Handed to mix timers so a fired timer can complete the swap.
    weak_self: Weak<PlayoutEngine>,
}

impl PlayoutEngine {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                pvw: Slot::empty(),
                pgm: Slot::empty(),
                mixing: false,
                mix_timer: None,
                mix_generation: 0,
            }),
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Hand the engine its two surfaces. The engine holds exactly these two
    /// for its lifetime; TAKE relabels which is preview and which is program.
    pub async fn attach_surfaces(&self, pvw: SurfaceHandle, pgm: SurfaceHandle) {
        let mut inner = self.inner.lock().await;
        info!(pvw = pvw.label(), pgm = pgm.label(), "surfaces attached");
        inner.pvw.surface = Some(pvw);
        inner.pgm.surface = Some(pgm);
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let inner = self.inner.lock().await;
        snapshot_of(&inner)
    }

    /// Surface currently labeled program.
    pub async fn pgm_surface(&self) -> Option<SurfaceHandle> {
        self.inner.lock().await.pgm.surface.clone()
    }

    /// Surface currently labeled preview.
    pub async fn pvw_surface(&self) -> Option<SurfaceHandle> {
        self.inner.lock().await.pvw.surface.clone()
    }

    /// Load a payload into preview and autoplay it. Permitted in any state;
    /// moves `idle` to `pvw-loaded`, otherwise leaves the state alone.
    pub async fn load(&self, payload: TemplatePayload) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let surface = inner
            .pvw
            .surface
            .clone()
            .ok_or(EngineError::NotAttached("preview"))?;

        surface
            .load_document(&payload)
            .await
            .map_err(|e| EngineError::surface("load", e))?;
        if let Err(err) = surface.call_hook(TemplateHook::Play, None).await {
            warn!(error = %err, "autoplay rejected after load");
        }

        inner.pvw.template = Some(payload.clone());
        inner.pvw.ready = true;
        if inner.state == EngineState::Idle {
            inner.state = EngineState::PvwLoaded;
        }
        info!(template = ?payload.template_id, "preview loaded");
        self.emit(EngineEvent::Load(payload));
        self.emit_state(&inner);
        Ok(())
    }

    /// Replace the preview template's variables and forward them to the
    /// loaded document.
    pub async fn update(&self, variables: HashMap<String, String>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if !inner.pvw.ready {
            return Err(EngineError::PreviewNotReady);
        }
        if let Some(template) = inner.pvw.template.as_mut() {
            template.variables = variables.clone();
        }
        if let Some(surface) = inner.pvw.surface.clone() {
            if let Err(err) = surface
                .call_hook(TemplateHook::Update, Some(vars_json(&variables)))
                .await
            {
                warn!(error = %err, "preview update hook rejected");
            }
        }
        self.emit(EngineEvent::Update(variables));
        self.emit_state(&inner);
        Ok(())
    }

    /// Replace the program template's variables. No-op unless on air.
    pub async fn update_pgm(&self, variables: HashMap<String, String>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_on_air() {
            return Ok(());
        }
        if let Some(template) = inner.pgm.template.as_mut() {
            template.variables = variables.clone();
        }
        if let Some(surface) = inner.pgm.surface.clone() {
            if let Err(err) = surface
                .call_hook(TemplateHook::Update, Some(vars_json(&variables)))
                .await
            {
                warn!(error = %err, "program update hook rejected");
            }
        }
        self.emit(EngineEvent::UpdatePgm(variables));
        self.emit_state(&inner);
        Ok(())
    }

    /// Invoke the preview document's play hook. No state change.
    pub async fn play(&self) -> Result<(), EngineError> {
        let inner = self.inner.lock().await;
        let surface = inner
            .pvw
            .surface
            .clone()
            .ok_or(EngineError::NotAttached("preview"))?;
        surface
            .call_hook(TemplateHook::Play, None)
            .await
            .map_err(|e| EngineError::surface("play", e))
    }

    /// Invoke the preview document's stop hook. No state change.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let inner = self.inner.lock().await;
        let surface = inner
            .pvw
            .surface
            .clone()
            .ok_or(EngineError::NotAttached("preview"))?;
        surface
            .call_hook(TemplateHook::Stop, None)
            .await
            .map_err(|e| EngineError::surface("stop", e))
    }

    /// Cut: swap the preview and program slots. O(1), the incoming document
    /// keeps its running animation.
    pub async fn take(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        self.take_locked(&mut inner).await
    }

    /// Timed crossfade: marks the engine mixing, starts the incoming
    /// document and schedules the swap. `take`, `clear` or another
    /// `take_mix` issued before the timer fires cancels it.
    pub async fn take_mix(&self, duration: Duration) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let incoming = inner
            .pvw
            .surface
            .clone()
            .filter(|_| inner.pvw.ready)
            .ok_or(EngineError::TakeNotReady)?;
        let outgoing = inner.pgm.surface.clone().ok_or(EngineError::TakeNotReady)?;

        self.cancel_mix_locked(&mut inner, false);
        inner.mixing = true;
        inner.mix_generation += 1;
        let generation = inner.mix_generation;

        if let Err(err) = incoming.call_hook(TemplateHook::Play, None).await {
            inner.mixing = false;
            return Err(EngineError::surface("play", err));
        }

        let engine = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(engine) = engine.upgrade() {
                engine.complete_mix(generation).await;
            }
        });
        inner.mix_timer = Some(MixTimer { handle, generation });

        info!(?duration, "mix started");
        self.emit(EngineEvent::MixStart {
            duration,
            outgoing: outgoing.label().to_string(),
            incoming: incoming.label().to_string(),
        });
        self.emit_state(&inner);
        Ok(())
    }

    /// Return the program to black. Cancels a running mix (emitting
    /// `MixCancel`), clears the program slot and goes idle.
    pub async fn clear(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        self.cancel_mix_locked(&mut inner, true);
        if let Some(surface) = inner.pgm.surface.clone() {
            if let Err(err) = surface.call_hook(TemplateHook::Clear, None).await {
                warn!(error = %err, "program clear hook rejected");
            }
        }
        inner.pgm.template = None;
        inner.pgm.ready = false;
        inner.state = EngineState::Idle;
        info!("program cleared");
        self.emit(EngineEvent::Clear);
        self.emit_state(&inner);
        Ok(())
    }

    /// Step the program document. No-op unless on air.
    pub async fn next(&self) -> Result<(), EngineError> {
        let inner = self.inner.lock().await;
        if !inner.state.is_on_air() {
            return Ok(());
        }
        let Some(surface) = inner.pgm.surface.clone() else {
            return Ok(());
        };
        surface
            .call_hook(TemplateHook::Next, None)
            .await
            .map_err(|e| EngineError::surface("next", e))?;
        self.emit(EngineEvent::Next);
        Ok(())
    }

    /// Toggle between on-air and frozen. No-op in other states.
    pub async fn freeze(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let frozen = match inner.state {
            EngineState::OnAir => {
                inner.state = EngineState::Frozen;
                true
            }
            EngineState::Frozen => {
                inner.state = EngineState::OnAir;
                false
            }
            _ => return Ok(()),
        };
        if let Some(surface) = inner.pgm.surface.clone() {
            surface.set_freeze_hint(frozen);
        }
        info!(frozen, "freeze toggled");
        self.emit(EngineEvent::Freeze(frozen));
        self.emit_state(&inner);
        Ok(())
    }

    async fn take_locked(&self, inner: &mut Inner) -> Result<(), EngineError> {
        if !inner.pvw.ready {
            return Err(EngineError::TakeNotReady);
        }
        let incoming = inner.pvw.surface.clone().ok_or(EngineError::TakeNotReady)?;
        let outgoing = inner.pgm.surface.clone().ok_or(EngineError::TakeNotReady)?;

        self.cancel_mix_locked(inner, false);

        std::mem::swap(&mut inner.pvw, &mut inner.pgm);
        inner.pgm.ready = true;
        inner.pvw.ready = false;
        inner.state = EngineState::OnAir;

        // Play on the new program is mandatory; stop on the outgoing
        // document is best-effort.
        let play_result = incoming.call_hook(TemplateHook::Play, None).await;
        if let Err(err) = outgoing.call_hook(TemplateHook::Stop, None).await {
            warn!(error = %err, "stop hook rejected on outgoing surface");
        }

        info!(pgm = incoming.label(), "take");
        self.emit(EngineEvent::Take);
        self.emit_state(inner);

        play_result.map_err(|e| EngineError::surface("play", e))
    }

    async fn complete_mix(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        let current = inner
            .mix_timer
            .as_ref()
            .map(|t| t.generation == generation)
            .unwrap_or(false);
        if !current || !inner.mixing {
            return;
        }
        inner.mix_timer = None;
        inner.mixing = false;
        debug!("mix timer fired, swapping");
        if let Err(err) = self.take_locked(&mut inner).await {
            warn!(error = %err, "take at end of mix failed");
        }
    }

    /// Clears the pending mix timer and the mixing flag before the caller's
    /// operation proceeds. Cancellation is synchronous from the engine's
    /// view.
    fn cancel_mix_locked(&self, inner: &mut Inner, emit_cancel: bool) {
        if let Some(timer) = inner.mix_timer.take() {
            timer.handle.abort();
        }
        if inner.mixing {
            inner.mixing = false;
            if emit_cancel {
                info!("mix cancelled");
                self.emit(EngineEvent::MixCancel);
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, inner: &Inner) {
        let _ = self.events.send(EngineEvent::State(snapshot_of(inner)));
    }
}

fn snapshot_of(inner: &Inner) -> EngineSnapshot {
    EngineSnapshot {
        state: inner.state,
        pvw_template: inner.pvw.template.clone(),
        pgm_template: inner.pgm.template.clone(),
        pvw_ready: inner.pvw.ready,
        pgm_ready: inner.pgm.ready,
        mixing: inner.mixing,
    }
}

fn vars_json(variables: &HashMap<String, String>) -> serde_json::Value {
    serde_json::json!({ "variables": variables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{HeadlessSurface, Size};

    fn payload(body: &str) -> TemplatePayload {
        TemplatePayload {
            body: body.to_string(),
            stylesheet: None,
            variables: HashMap::new(),
            template_id: None,
            dialect: Default::default(),
            manifest: None,
        }
    }

    struct Rig {
        engine: Arc<PlayoutEngine>,
        a: Arc<HeadlessSurface>,
        b: Arc<HeadlessSurface>,
        events: broadcast::Receiver<EngineEvent>,
    }

    async fn rig() -> Rig {
        let engine = PlayoutEngine::new();
        let a = Arc::new(HeadlessSurface::new("surface-a", Size::new(4, 2), 25.0));
        let b = Arc::new(HeadlessSurface::new("surface-b", Size::new(4, 2), 25.0));
        let events = engine.subscribe();
        engine.attach_surfaces(a.clone(), b.clone()).await;
        Rig { engine, a, b, events }
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn count_takes(events: &[EngineEvent]) -> usize {
        events.iter().filter(|e| matches!(e, EngineEvent::Take)).count()
    }

    #[tokio::test]
    async fn load_moves_idle_to_pvw_loaded() {
        let mut rig = rig().await;
        rig.engine.load(payload("<div>Hi</div>")).await.unwrap();

        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.state, EngineState::PvwLoaded);
        assert!(snap.pvw_ready && !snap.pgm_ready);
        assert!(snap.pvw_template.is_some());

        let events = drain(&mut rig.events);
        assert!(matches!(events[0], EngineEvent::Load(_)));
        assert!(matches!(events[1], EngineEvent::State(_)));
    }

    #[tokio::test]
    async fn load_without_surfaces_is_not_attached() {
        let engine = PlayoutEngine::new();
        let err = engine.load(payload("x")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotAttached("preview")));
        assert_eq!(engine.snapshot().await.state, EngineState::Idle);
    }

    #[tokio::test]
    async fn cold_take_swaps_surfaces_and_goes_on_air() {
        let mut rig = rig().await;
        let p1 = payload("<div>Hi</div>");
        rig.engine.load(p1.clone()).await.unwrap();
        rig.engine.take().await.unwrap();

        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.state, EngineState::OnAir);
        assert_eq!(snap.pgm_template, Some(p1));
        assert!(snap.pgm_ready && !snap.pvw_ready);

        // Surface A (old preview) is now program; B received the stop hook.
        let pgm = rig.engine.pgm_surface().await.unwrap();
        assert_eq!(pgm.label(), "surface-a");
        assert!(rig.b.hooks_seen().contains(&TemplateHook::Stop));
        assert_eq!(count_takes(&drain(&mut rig.events)), 1);
    }

    #[tokio::test]
    async fn take_without_loaded_preview_changes_nothing() {
        let mut rig = rig().await;
        let before = rig.engine.snapshot().await;
        let err = rig.engine.take().await.unwrap_err();
        assert!(matches!(err, EngineError::TakeNotReady));
        assert_eq!(rig.engine.snapshot().await, before);
        assert_eq!(count_takes(&drain(&mut rig.events)), 0);
    }

    #[tokio::test]
    async fn take_then_clear_round_trip() {
        let rig = rig().await;
        rig.engine.load(payload("<p>One</p>")).await.unwrap();
        rig.engine.take().await.unwrap();
        rig.engine.clear().await.unwrap();

        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.state, EngineState::Idle);
        assert_eq!(snap.pgm_template, None);
        assert!(!snap.pgm_ready);
    }

    #[tokio::test]
    async fn freeze_twice_returns_to_the_pre_call_state() {
        let rig = rig().await;
        rig.engine.load(payload("x")).await.unwrap();
        rig.engine.take().await.unwrap();

        rig.engine.freeze().await.unwrap();
        assert_eq!(rig.engine.snapshot().await.state, EngineState::Frozen);
        let pgm = rig.engine.pgm_surface().await.unwrap();
        assert_eq!(pgm.label(), "surface-a");
        assert!(rig.a.frozen_hint());

        rig.engine.freeze().await.unwrap();
        assert_eq!(rig.engine.snapshot().await.state, EngineState::OnAir);
        assert!(!rig.a.frozen_hint());
    }

    #[tokio::test]
    async fn freeze_outside_on_air_is_a_no_op() {
        let rig = rig().await;
        rig.engine.freeze().await.unwrap();
        assert_eq!(rig.engine.snapshot().await.state, EngineState::Idle);
    }

    #[tokio::test]
    async fn update_requires_a_ready_preview() {
        let rig = rig().await;
        let vars = HashMap::from([("h".to_string(), "A".to_string())]);
        assert!(matches!(
            rig.engine.update(vars.clone()).await,
            Err(EngineError::PreviewNotReady)
        ));

        rig.engine.load(payload("x")).await.unwrap();
        rig.engine.update(vars.clone()).await.unwrap();
        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.pvw_template.unwrap().variables, vars);
    }

    #[tokio::test]
    async fn update_pgm_is_a_no_op_off_air() {
        let rig = rig().await;
        rig.engine.load(payload("x")).await.unwrap();
        let vars = HashMap::from([("k".to_string(), "v".to_string())]);
        rig.engine.update_pgm(vars.clone()).await.unwrap();
        assert_eq!(rig.engine.snapshot().await.pgm_template, None);

        rig.engine.take().await.unwrap();
        rig.engine.update_pgm(vars.clone()).await.unwrap();
        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.pgm_template.unwrap().variables, vars);
    }

    #[tokio::test(start_paused = true)]
    async fn mix_completes_after_its_duration() {
        let mut rig = rig().await;
        rig.engine.load(payload("<div>Hi</div>")).await.unwrap();
        rig.engine.take().await.unwrap();
        let p2 = payload("<p>Two</p>");
        rig.engine.load(p2.clone()).await.unwrap();
        drain(&mut rig.events);

        rig.engine.take_mix(Duration::from_millis(500)).await.unwrap();
        let snap = rig.engine.snapshot().await;
        assert!(snap.mixing);
        assert_eq!(snap.state, EngineState::OnAir);

        let events = drain(&mut rig.events);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::MixStart { duration, .. } if *duration == Duration::from_millis(500)
        )));

        tokio::time::sleep(Duration::from_millis(520)).await;

        let snap = rig.engine.snapshot().await;
        assert!(!snap.mixing);
        assert_eq!(snap.state, EngineState::OnAir);
        assert_eq!(snap.pgm_template, Some(p2));
        assert_eq!(count_takes(&drain(&mut rig.events)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_mid_mix_cancels_exactly_once_and_suppresses_the_take() {
        let mut rig = rig().await;
        rig.engine.load(payload("one")).await.unwrap();
        rig.engine.take().await.unwrap();
        rig.engine.load(payload("two")).await.unwrap();
        drain(&mut rig.events);

        rig.engine.take_mix(Duration::from_millis(1000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.engine.clear().await.unwrap();

        let snap = rig.engine.snapshot().await;
        assert!(!snap.mixing);
        assert_eq!(snap.state, EngineState::Idle);
        assert_eq!(snap.pgm_template, None);

        // Past the original deadline: the cancelled timer must stay dead.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let events = drain(&mut rig.events);
        let cancels = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::MixCancel))
            .count();
        assert_eq!(cancels, 1);
        assert_eq!(count_takes(&events), 0);
        assert_eq!(rig.engine.snapshot().await.state, EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn take_during_mix_overrides_the_timer() {
        let mut rig = rig().await;
        rig.engine.load(payload("one")).await.unwrap();
        rig.engine.take().await.unwrap();
        rig.engine.load(payload("two")).await.unwrap();
        drain(&mut rig.events);

        rig.engine.take_mix(Duration::from_millis(800)).await.unwrap();
        rig.engine.take().await.unwrap();
        assert!(!rig.engine.snapshot().await.mixing);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(count_takes(&drain(&mut rig.events)), 1, "timer take must not fire");
    }

    #[tokio::test]
    async fn mandatory_play_failure_propagates_but_state_stays_consistent() {
        let rig = rig().await;
        rig.engine.load(payload("x")).await.unwrap();
        rig.a.fail_next_hook(TemplateHook::Play, "script threw");

        let err = rig.engine.take().await.unwrap_err();
        assert!(matches!(err, EngineError::Surface { op: "play", .. }));
        let snap = rig.engine.snapshot().await;
        assert_eq!(snap.state, EngineState::OnAir);
        assert!(snap.pgm_ready);
    }

    #[tokio::test]
    async fn next_reaches_the_program_document_only_on_air() {
        let rig = rig().await;
        rig.engine.load(payload("x")).await.unwrap();
        rig.engine.next().await.unwrap();
        assert!(!rig.b.hooks_seen().contains(&TemplateHook::Next));

        rig.engine.take().await.unwrap();
        rig.engine.next().await.unwrap();
        assert!(rig.a.hooks_seen().contains(&TemplateHook::Next));
    }
}
