//! Black burst idle source
//!
//! Keeps downstream equipment locked while the engine is idle by pushing an
//! all-black BGRA frame at the target rate. This is a frame source driving
//! the output manager, not an output driver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::surface::Size;

pub struct BlackBurst {
    frame: Arc<Vec<u8>>,
    size: Size,
    fps: f64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BlackBurst {
    pub fn new(size: Size, fps: f64) -> Self {
        Self {
            frame: Arc::new(vec![0u8; size.byte_len()]),
            size,
            fps,
            task: Mutex::new(None),
        }
    }

    /// Start pushing black frames into `sink`. Idempotent.
    pub fn start(&self, sink: impl Fn(&[u8], Size) + Send + 'static) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let frame = self.frame.clone();
        let size = self.size;
        let fps = self.fps.max(1.0);
        *task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / fps));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sink(&frame, size);
            }
        }));
        info!(fps, "black burst started");
    }

    /// Stop the generator. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            info!("black burst stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for BlackBurst {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn pushes_all_black_frames_at_rate() {
        let burst = BlackBurst::new(Size::new(2, 2), 25.0);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        burst.start(move |frame, size| {
            assert_eq!(frame.len(), size.byte_len());
            assert!(frame.iter().all(|&b| b == 0));
            seen.fetch_add(1, Ordering::Relaxed);
        });

        tokio::time::sleep(Duration::from_millis(125)).await;
        let n = count.load(Ordering::Relaxed);
        assert!((3..=5).contains(&n), "expected ~4 frames in 125ms, got {n}");
        burst.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_cancels_cleanly() {
        let burst = BlackBurst::new(Size::new(1, 1), 25.0);
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        burst.start(move |_, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        // Second start must not spawn a second timer.
        let seen = count.clone();
        burst.start(move |_, _| {
            seen.fetch_add(1000, Ordering::Relaxed);
        });
        assert!(burst.is_running());

        tokio::time::sleep(Duration::from_millis(85)).await;
        assert!(count.load(Ordering::Relaxed) < 1000, "second sink must not run");

        burst.stop();
        assert!(!burst.is_running());
        let settled = count.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(85)).await;
        assert_eq!(count.load(Ordering::Relaxed), settled, "no timers left after stop");
    }
}
