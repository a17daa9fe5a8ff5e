//! Frame capture
//!
//! Converts asynchronous paint events from one surface into a fixed-rate
//! stream of BGRA frames and a once-per-second stats report.
//!
//! The producer (paint callback) and the consumer (output tick) run on
//! decoupled clocks: the paint callback only copies the bitmap into a
//! pre-allocated, grow-only buffer so the compositor thread is free to start
//! the next paint, while a periodic task at exactly the target rate reads the
//! held frame and emits it downstream. A second periodic task at twice the
//! target rate asks the surface to repaint so static content keeps producing
//! fresh bitmaps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::surface::{Size, SurfaceHandle};

/// One captured frame. The buffer is owned by the capture and reused every
/// paint; consumers must finish with it before returning or copy.
pub struct FrameData<'a> {
    pub buffer: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

/// Once-per-second capture report. Totals are monotonically non-decreasing;
/// `fps` is a one-second moving measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureStats {
    pub fps: f64,
    pub dropped: u64,
    pub total_frames: u64,
}

/// Downstream frame consumer, called synchronously from the output tick.
pub type FrameSink = Box<dyn FnMut(FrameData<'_>) + Send>;

/// Advisory preview thumbnail consumer.
pub type ThumbnailSink = Box<dyn FnMut(&[u8], Size) + Send>;

const THUMBNAIL_EVERY_NTH_PAINT: u64 = 30;
const THUMBNAIL_DECIMATION: u32 = 8;

struct FrameSlot {
    buffer: Vec<u8>,
    size: Size,
    timestamp: Instant,
    have_frame: bool,
    paints: u64,
}

struct Shared {
    slot: Mutex<FrameSlot>,
    sink: Mutex<FrameSink>,
    frozen: AtomicBool,
    ticked: AtomicU64,
    dropped: AtomicU64,
    total: AtomicU64,
}

/// Fixed-rate capture bound to one surface.
pub struct FrameCapture {
    surface: SurfaceHandle,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl FrameCapture {
    /// Bind to a surface and begin production. Re-attaching a surface is
    /// permitted only after [`destroy`](Self::destroy).
    pub fn attach(
        surface: SurfaceHandle,
        sink: FrameSink,
        stats_tx: Option<mpsc::UnboundedSender<CaptureStats>>,
        mut thumbnail: Option<ThumbnailSink>,
    ) -> Self {
        let size = surface.size();
        let shared = Arc::new(Shared {
            slot: Mutex::new(FrameSlot {
                buffer: Vec::new(),
                size,
                timestamp: Instant::now(),
                have_frame: false,
                paints: 0,
            }),
            sink: Mutex::new(sink),
            frozen: AtomicBool::new(false),
            ticked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total: AtomicU64::new(0),
        });

        // Producer: copy is the only heavy work allowed in the paint path.
        let producer = shared.clone();
        let mut thumb_buf = Vec::new();
        surface.set_paint_listener(Some(Box::new(move |bitmap, size| {
            if bitmap.is_empty() {
                producer.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let mut slot = producer.slot.lock().unwrap();
            slot.paints += 1;
            if !producer.frozen.load(Ordering::Relaxed) {
                if slot.buffer.len() < bitmap.len() {
                    slot.buffer.resize(bitmap.len(), 0);
                }
                slot.buffer[..bitmap.len()].copy_from_slice(bitmap);
                slot.size = size;
                slot.timestamp = Instant::now();
                slot.have_frame = true;
            }
            if let Some(thumb) = thumbnail.as_mut() {
                if slot.paints % THUMBNAIL_EVERY_NTH_PAINT == 0 {
                    if let Some(thumb_size) =
                        derive_thumbnail(bitmap, size, THUMBNAIL_DECIMATION, &mut thumb_buf)
                    {
                        thumb(&thumb_buf, thumb_size);
                    }
                }
            }
        })));

        let fps = surface.frame_rate().max(1.0);
        let mut tasks = Vec::with_capacity(3);

        // Consumer: exactly-target-rate emission regardless of paint jitter.
        let consumer = shared.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / fps));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let slot = consumer.slot.lock().unwrap();
                if !slot.have_frame {
                    continue;
                }
                let len = slot.size.byte_len().min(slot.buffer.len());
                let frame = FrameData {
                    buffer: &slot.buffer[..len],
                    width: slot.size.width,
                    height: slot.size.height,
                    timestamp: slot.timestamp,
                };
                let mut sink = consumer.sink.lock().unwrap();
                (sink)(frame);
                drop(sink);
                drop(slot);
                consumer.ticked.fetch_add(1, Ordering::Relaxed);
                consumer.total.fetch_add(1, Ordering::Relaxed);
            }
        }));

        // Force-invalidate: keep static content painting at the declared rate.
        let invalidate_surface = surface.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / (fps * 2.0)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                invalidate_surface.invalidate();
            }
        }));

        if let Some(tx) = stats_tx {
            let stats = shared.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                tick.tick().await;
                let mut last = tokio::time::Instant::now();
                loop {
                    tick.tick().await;
                    let elapsed = last.elapsed().as_secs_f64();
                    last = tokio::time::Instant::now();
                    let ticked = stats.ticked.swap(0, Ordering::Relaxed);
                    let fps = if elapsed > 0.0 { ticked as f64 / elapsed } else { 0.0 };
                    let report = CaptureStats {
                        fps,
                        dropped: stats.dropped.load(Ordering::Relaxed),
                        total_frames: stats.total.load(Ordering::Relaxed),
                    };
                    if tx.send(report).is_err() {
                        break;
                    }
                }
            }));
        }

        debug!(surface = surface.label(), fps, "frame capture attached");

        Self { surface, shared, tasks }
    }

    /// While frozen, paints no longer overwrite the held frame but the output
    /// tick keeps emitting it. Unfreezing resumes on the next paint.
    pub fn set_frozen(&self, frozen: bool) {
        self.shared.frozen.store(frozen, Ordering::Relaxed);
    }

    /// Swap the downstream consumer. Takes effect on the next output tick.
    pub fn set_sink(&self, sink: FrameSink) {
        *self.shared.sink.lock().unwrap() = sink;
    }

    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn total_frames(&self) -> u64 {
        self.shared.total.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Cancel all timers, deregister the paint listener and release the
    /// frame buffer.
    pub fn destroy(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.surface.set_paint_listener(None);
        let mut slot = self.shared.slot.lock().unwrap();
        slot.buffer = Vec::new();
        slot.have_frame = false;
        debug!(surface = self.surface.label(), "frame capture destroyed");
    }
}

/// Nearest-neighbor decimation into `out`. Returns the thumbnail size, or
/// `None` when the input is too small to decimate.
fn derive_thumbnail(bitmap: &[u8], size: Size, factor: u32, out: &mut Vec<u8>) -> Option<Size> {
    let tw = size.width / factor;
    let th = size.height / factor;
    if tw == 0 || th == 0 || bitmap.len() < size.byte_len() {
        return None;
    }
    let thumb = Size::new(tw, th);
    out.resize(thumb.byte_len(), 0);
    for y in 0..th {
        for x in 0..tw {
            let src = ((y * factor) as usize * size.width as usize + (x * factor) as usize) * 4;
            let dst = (y as usize * tw as usize + x as usize) * 4;
            out[dst..dst + 4].copy_from_slice(&bitmap[src..src + 4]);
        }
    }
    Some(thumb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::HeadlessSurface;

    fn collecting_sink(frames: Arc<Mutex<Vec<Vec<u8>>>>) -> FrameSink {
        Box::new(move |frame: FrameData<'_>| {
            frames.lock().unwrap().push(frame.buffer.to_vec());
        })
    }

    #[tokio::test(start_paused = true)]
    async fn no_emission_before_first_paint() {
        let surface = Arc::new(HeadlessSurface::new("pgm", Size::new(2, 2), 25.0));
        surface.set_pixel([1, 2, 3, 4]);
        let frames = Arc::new(Mutex::new(Vec::new()));
        // Detach the invalidate path by never painting: a bare surface whose
        // invalidate is a no-op would be the real-world equivalent, so only
        // check ticks before the very first invalidate fires.
        let capture = FrameCapture::attach(surface.clone(), collecting_sink(frames.clone()), None, None);

        // First output tick fires at t=0 with an empty slot.
        tokio::task::yield_now().await;
        assert!(frames.lock().unwrap().is_empty());
        capture.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn emits_at_target_rate_after_paint() {
        let surface = Arc::new(HeadlessSurface::new("pgm", Size::new(2, 2), 25.0));
        surface.set_pixel([9, 9, 9, 0xFF]);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let capture = FrameCapture::attach(surface.clone(), collecting_sink(frames.clone()), None, None);

        surface.paint_now();
        tokio::time::sleep(Duration::from_millis(125)).await;

        let count = frames.lock().unwrap().len();
        assert!((2..=4).contains(&count), "expected ~3 ticks in 125ms at 25fps, got {count}");
        capture.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_frames_are_bit_identical() {
        let surface = Arc::new(HeadlessSurface::new("pgm", Size::new(2, 2), 25.0));
        surface.set_pixel([0x10, 0x20, 0x30, 0xFF]);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let capture = FrameCapture::attach(surface.clone(), collecting_sink(frames.clone()), None, None);

        surface.paint_now();
        tokio::time::sleep(Duration::from_millis(45)).await;
        let reference = frames.lock().unwrap().last().unwrap().clone();

        capture.set_frozen(true);
        surface.set_pixel([0xAA, 0xBB, 0xCC, 0xFF]);
        tokio::time::sleep(Duration::from_millis(125)).await;

        let held: Vec<_> = frames.lock().unwrap().iter().skip(1).cloned().collect();
        assert!(held.len() >= 3);
        for frame in &held {
            assert_eq!(frame, &reference, "held frame must stay bit-identical");
        }

        // Unfreezing resumes buffer updates on the next paint.
        capture.set_frozen(false);
        surface.paint_now();
        tokio::time::sleep(Duration::from_millis(45)).await;
        let last = frames.lock().unwrap().last().unwrap().clone();
        assert_eq!(&last[..4], &[0xAA, 0xBB, 0xCC, 0xFF]);
        capture.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_paint_counts_as_dropped_and_emits_nothing() {
        let surface = Arc::new(HeadlessSurface::new("pgm", Size::new(2, 2), 25.0));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let capture = FrameCapture::attach(surface.clone(), collecting_sink(frames.clone()), None, None);

        surface.paint_empty();
        surface.paint_empty();
        tokio::task::yield_now().await;

        assert_eq!(capture.dropped(), 2);
        assert!(frames.lock().unwrap().is_empty());
        capture.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_measured_rate_and_totals() {
        let surface = Arc::new(HeadlessSurface::new("pgm", Size::new(2, 2), 25.0));
        surface.set_pixel([1, 1, 1, 0xFF]);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel();
        let capture =
            FrameCapture::attach(surface.clone(), collecting_sink(frames.clone()), Some(stats_tx), None);

        surface.paint_now();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let report = stats_rx.recv().await.expect("one stats report");
        assert!(report.fps > 20.0 && report.fps < 30.0, "fps {}", report.fps);
        assert_eq!(report.dropped, 0);
        assert!(report.total_frames >= 20);
        capture.destroy();
    }

    #[test]
    fn thumbnail_decimates_by_factor() {
        let size = Size::new(16, 8);
        let mut bitmap = vec![0u8; size.byte_len()];
        for (i, px) in bitmap.chunks_exact_mut(4).enumerate() {
            px[0] = i as u8;
        }
        let mut out = Vec::new();
        let thumb = derive_thumbnail(&bitmap, size, 8, &mut out).unwrap();
        assert_eq!(thumb, Size::new(2, 1));
        assert_eq!(out.len(), thumb.byte_len());
        assert_eq!(out[0], 0); // pixel (0,0)
        assert_eq!(out[4], 8); // pixel (8,0)
    }
}
