//! Output fan-out
//!
//! The [`OutputManager`] holds the named sink set and distributes each
//! captured BGRA frame. The alpha-as-luma key companion is computed only when
//! at least one sink currently asks for it, a failing sink can never keep the
//! others from receiving the frame, and a clock mode buffers one frame and
//! repeats it on an internal tick for genlocked sinks.

mod black_burst;
mod ndi;
mod sdi;
mod window;

pub use black_burst::BlackBurst;
pub use ndi::{FourCc, NdiOutput, NdiSender, NdiVideoFrame};
pub use sdi::{SdiConfigView, SdiHardware, SdiOutput, SdiPort};
pub use window::{WindowOutput, WindowPresenter};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::surface::Size;

/// Ten consecutive failures disable a sink.
const SINK_ERROR_LIMIT: u32 = 10;
/// Only the first few failures of a sink are logged verbatim.
const SINK_ERRORS_LOGGED: u32 = 3;

/// One downstream frame sink.
///
/// `push_frame`/`push_key_frame` are synchronous from the manager's view;
/// drivers wrapping native hardware may spawn their own asynchronous work but
/// must not block the caller.
pub trait OutputDriver: Send {
    fn name(&self) -> &str;

    /// True when the sink has a separate key input at all.
    fn has_key_input(&self) -> bool {
        false
    }

    /// Whether the sink wants the key companion right now. Evaluated every
    /// frame; meaningful only when [`has_key_input`](Self::has_key_input).
    fn needs_key_frame(&self) -> bool {
        self.has_key_input()
    }

    fn push_frame(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()>;

    fn push_key_frame(&mut self, _key: &[u8], _size: Size) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self);
}

struct SinkEntry {
    driver: Box<dyn OutputDriver>,
    consecutive_errors: u32,
    logged: u32,
}

struct HeldFrame {
    buffer: Vec<u8>,
    size: Size,
}

struct ManagerInner {
    sinks: Vec<SinkEntry>,
    key_buf: Vec<u8>,
    held: Option<HeldFrame>,
    clocked: bool,
}

/// Named sink set with per-sink error isolation and optional frame-hold.
pub struct OutputManager {
    inner: Arc<Mutex<ManagerInner>>,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                sinks: Vec::new(),
                key_buf: Vec::new(),
                held: None,
                clocked: false,
            })),
            clock: Mutex::new(None),
        }
    }

    pub fn add_output(&self, driver: Box<dyn OutputDriver>) {
        info!(sink = driver.name(), "output registered");
        self.inner.lock().unwrap().sinks.push(SinkEntry {
            driver,
            consecutive_errors: 0,
            logged: 0,
        });
    }

    /// Remove and destroy the named sink. Returns false when unknown.
    pub fn remove_output(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.sinks.iter().position(|s| s.driver.name() == name) {
            let mut entry = inner.sinks.remove(idx);
            entry.driver.destroy();
            info!(sink = name, "output removed");
            true
        } else {
            false
        }
    }

    pub fn active_outputs(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sinks
            .iter()
            .map(|s| s.driver.name().to_string())
            .collect()
    }

    /// Distribute one frame, or buffer it when the clock is running.
    pub fn push_frame(&self, bgra: &[u8], size: Size) {
        let mut inner = self.inner.lock().unwrap();
        if inner.clocked {
            let held = inner.held.get_or_insert_with(|| HeldFrame {
                buffer: Vec::new(),
                size,
            });
            held.buffer.clear();
            held.buffer.extend_from_slice(bgra);
            held.size = size;
            return;
        }
        distribute(&mut inner, bgra, size);
    }

    /// Switch to buffered mode: frames are held and distributed on an
    /// internal tick at `fps`, repeating the last frame when no fresh one
    /// arrived (frame hold for genlocked sinks).
    pub fn start_clock(&self, fps: f64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.clocked {
                return;
            }
            inner.clocked = true;
        }
        let shared = self.inner.clone();
        let mut clock = self.clock.lock().unwrap();
        *clock = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / fps.max(1.0)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let mut inner = shared.lock().unwrap();
                if let Some(held) = inner.held.take() {
                    distribute(&mut inner, &held.buffer, held.size);
                    inner.held = Some(held);
                }
            }
        }));
        info!(fps, "output clock started");
    }

    /// Revert to immediate distribution and clear the held frame.
    pub fn stop_clock(&self) {
        if let Some(task) = self.clock.lock().unwrap().take() {
            task.abort();
        }
        let mut inner = self.inner.lock().unwrap();
        inner.clocked = false;
        inner.held = None;
        info!("output clock stopped");
    }

    /// Destroy every sink and stop the clock.
    pub fn shutdown(&self) {
        self.stop_clock();
        let mut inner = self.inner.lock().unwrap();
        for mut entry in inner.sinks.drain(..) {
            entry.driver.destroy();
        }
    }
}

fn distribute(inner: &mut ManagerInner, bgra: &[u8], size: Size) {
    let needs_key = inner
        .sinks
        .iter()
        .any(|s| s.driver.has_key_input() && s.driver.needs_key_frame());
    if needs_key {
        extract_key(&mut inner.key_buf, bgra);
    }

    // The key buffer is taken out for the duration of the loop so sinks can
    // borrow it while the sink list is borrowed mutably.
    let key_buf = std::mem::take(&mut inner.key_buf);
    let mut evict = Vec::new();

    for (idx, entry) in inner.sinks.iter_mut().enumerate() {
        let mut failed = false;
        if let Err(err) = entry.driver.push_frame(bgra, size) {
            failed = true;
            note_failure(entry, &err);
        }
        if needs_key && entry.driver.has_key_input() && entry.driver.needs_key_frame() {
            if let Err(err) = entry.driver.push_key_frame(&key_buf[..bgra.len()], size) {
                failed = true;
                note_failure(entry, &err);
            }
        }
        if !failed {
            entry.consecutive_errors = 0;
        } else if entry.consecutive_errors >= SINK_ERROR_LIMIT {
            evict.push(idx);
        }
    }

    inner.key_buf = key_buf;

    for idx in evict.into_iter().rev() {
        let mut entry = inner.sinks.remove(idx);
        warn!(
            sink = entry.driver.name(),
            errors = entry.consecutive_errors,
            "disabling output after repeated failures"
        );
        entry.driver.destroy();
    }
}

fn note_failure(entry: &mut SinkEntry, err: &anyhow::Error) {
    entry.consecutive_errors += 1;
    if entry.logged < SINK_ERRORS_LOGGED {
        entry.logged += 1;
        warn!(sink = entry.driver.name(), error = %err, "output push failed");
    }
}

/// Alpha-as-luma: each output pixel carries the input alpha in B, G and R
/// with full alpha, producing the grayscale key signal hardware keyers expect.
fn extract_key(key: &mut Vec<u8>, bgra: &[u8]) {
    if key.len() < bgra.len() {
        key.resize(bgra.len(), 0);
    }
    for (k, src) in key.chunks_exact_mut(4).zip(bgra.chunks_exact(4)) {
        let a = src[3];
        k[0] = a;
        k[1] = a;
        k[2] = a;
        k[3] = 0xFF;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable sink used across the output and mix tests.
    pub struct TestSink {
        pub name: String,
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        pub keys: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail_pushes: Arc<AtomicBool>,
        pub destroyed: Arc<AtomicUsize>,
        pub key_input: bool,
        pub wants_key: Arc<AtomicBool>,
    }

    impl TestSink {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                frames: Arc::new(Mutex::new(Vec::new())),
                keys: Arc::new(Mutex::new(Vec::new())),
                fail_pushes: Arc::new(AtomicBool::new(false)),
                destroyed: Arc::new(AtomicUsize::new(0)),
                key_input: false,
                wants_key: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn with_key_input(mut self) -> Self {
            self.key_input = true;
            self
        }
    }

    impl OutputDriver for TestSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn has_key_input(&self) -> bool {
            self.key_input
        }

        fn needs_key_frame(&self) -> bool {
            self.key_input && self.wants_key.load(Ordering::Relaxed)
        }

        fn push_frame(&mut self, bgra: &[u8], _size: Size) -> anyhow::Result<()> {
            if self.fail_pushes.load(Ordering::Relaxed) {
                anyhow::bail!("simulated sink failure");
            }
            self.frames.lock().unwrap().push(bgra.to_vec());
            Ok(())
        }

        fn push_key_frame(&mut self, key: &[u8], _size: Size) -> anyhow::Result<()> {
            if self.fail_pushes.load(Ordering::Relaxed) {
                anyhow::bail!("simulated sink failure");
            }
            self.keys.lock().unwrap().push(key.to_vec());
            Ok(())
        }

        fn destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
