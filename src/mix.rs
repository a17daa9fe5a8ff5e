//! MIX transition blending
//!
//! [`crossfade_bgra`] is the per-pixel linear crossfade applied during a MIX;
//! [`MixSession`] is the orchestration around it: while a mix runs, the
//! program capture is redirected into an outgoing copy buffer, a second
//! capture taps the incoming surface, and every incoming frame is blended
//! against the outgoing one and pushed to the output manager.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::{FrameCapture, FrameData, FrameSink};
use crate::output::OutputManager;
use crate::surface::{Size, SurfaceHandle};

/// Linear crossfade of two equally-sized BGRA buffers into `out`.
///
/// `f = 0` yields `from`, `f = 1` yields `to`. Fixed-point 8-bit fractional
/// arithmetic; the output buffer is pre-allocated and reused across a
/// transition.
pub fn crossfade_bgra(out: &mut [u8], from: &[u8], to: &[u8], f: f32) -> anyhow::Result<()> {
    anyhow::ensure!(
        out.len() == from.len() && out.len() == to.len(),
        "crossfade_bgra expects equal-length buffers"
    );
    let t = ((f.clamp(0.0, 1.0) * 255.0).round() as i32).clamp(0, 255) as u16;
    let it = 255u16 - t;
    for ((o, a), b) in out.iter_mut().zip(from.iter()).zip(to.iter()) {
        *o = mul_div255(u16::from(*a), it).saturating_add(mul_div255(u16::from(*b), t));
    }
    Ok(())
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

/// One running MIX transition.
pub struct MixSession {
    incoming: FrameCapture,
}

impl MixSession {
    /// Start blending. Redirects `pgm_capture` into the outgoing copy buffer
    /// (the capture reuses its own buffer, so the frame must be copied) and
    /// attaches a second capture to the incoming surface whose frames are
    /// blended and pushed to the manager.
    pub fn begin(
        pgm_capture: &FrameCapture,
        incoming_surface: SurfaceHandle,
        manager: Arc<OutputManager>,
        size: Size,
        duration: Duration,
    ) -> Self {
        let frame_len = size.byte_len();
        let outgoing = Arc::new(Mutex::new(vec![0u8; frame_len]));

        let copy_target = outgoing.clone();
        pgm_capture.set_sink(Box::new(move |frame: FrameData<'_>| {
            let mut out = copy_target.lock().unwrap();
            if out.len() != frame.buffer.len() {
                out.resize(frame.buffer.len(), 0);
            }
            out.copy_from_slice(frame.buffer);
        }));

        let blend_source = outgoing.clone();
        let started = tokio::time::Instant::now();
        let mut blend_buf = vec![0u8; frame_len];
        let sink: FrameSink = Box::new(move |frame: FrameData<'_>| {
            let f = if duration.is_zero() {
                1.0
            } else {
                (started.elapsed().as_secs_f32() / duration.as_secs_f32()).clamp(0.0, 1.0)
            };
            let out = blend_source.lock().unwrap();
            if out.len() != frame.buffer.len() || blend_buf.len() != frame.buffer.len() {
                return;
            }
            if crossfade_bgra(&mut blend_buf, &out, frame.buffer, f).is_ok() {
                manager.push_frame(&blend_buf, Size::new(frame.width, frame.height));
            }
        });
        let incoming = FrameCapture::attach(incoming_surface, sink, None, None);

        Self { incoming }
    }

    /// Tear down the second capture and release the transition buffers. The
    /// caller restores normal single-capture routing on whichever surface is
    /// now program.
    pub fn finish(self) {
        self.incoming.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::test_support::TestSink;
    use crate::surface::HeadlessSurface;

    #[test]
    fn crossfade_endpoints_are_exact() {
        let from = [10u8, 20, 30, 40];
        let to = [200u8, 210, 220, 230];
        let mut out = [0u8; 4];

        crossfade_bgra(&mut out, &from, &to, 0.0).unwrap();
        assert_eq!(out, from);
        crossfade_bgra(&mut out, &from, &to, 1.0).unwrap();
        assert_eq!(out, to);
    }

    #[test]
    fn crossfade_midpoint_is_the_average() {
        let from = [0u8, 0, 100, 255];
        let to = [200u8, 50, 100, 55];
        let mut out = [0u8; 4];
        crossfade_bgra(&mut out, &from, &to, 0.5).unwrap();
        for i in 0..4 {
            let expected = (u16::from(from[i]) + u16::from(to[i])) / 2;
            assert!((i32::from(out[i]) - i32::from(expected as u8)).abs() <= 1);
        }
    }

    #[test]
    fn crossfade_factor_is_clamped() {
        let from = [1u8, 2, 3, 4];
        let to = [5u8, 6, 7, 8];
        let mut out = [0u8; 4];
        crossfade_bgra(&mut out, &from, &to, -3.0).unwrap();
        assert_eq!(out, from);
        crossfade_bgra(&mut out, &from, &to, 7.5).unwrap();
        assert_eq!(out, to);
    }

    #[test]
    fn crossfade_rejects_mismatched_lengths() {
        let mut out = [0u8; 4];
        assert!(crossfade_bgra(&mut out, &[0; 4], &[0; 8], 0.5).is_err());
        assert!(crossfade_bgra(&mut out, &[0; 8], &[0; 8], 0.5).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_blends_outgoing_and_incoming_frames() {
        let size = Size::new(2, 1);
        let pgm = Arc::new(HeadlessSurface::new("pgm", size, 25.0));
        pgm.set_pixel([200, 200, 200, 255]);
        let pvw = Arc::new(HeadlessSurface::new("pvw", size, 25.0));
        pvw.set_pixel([0, 0, 0, 255]);

        let manager = Arc::new(OutputManager::new());
        let sink = TestSink::new("spy");
        let frames = sink.frames.clone();
        manager.add_output(Box::new(sink));

        // Main capture on PGM, initially routed nowhere interesting.
        let pgm_capture = FrameCapture::attach(pgm.clone(), Box::new(|_| {}), None, None);
        pgm.paint_now();
        tokio::time::sleep(Duration::from_millis(45)).await;

        let session = MixSession::begin(
            &pgm_capture,
            pvw.clone(),
            manager.clone(),
            size,
            Duration::from_millis(400),
        );

        // Let both captures run through most of the transition.
        pgm.paint_now();
        pvw.paint_now();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mid = {
            let frames = frames.lock().unwrap();
            assert!(!frames.is_empty(), "blended frames must reach the manager");
            frames.last().unwrap().clone()
        };
        // Halfway through a 200->0 fade the output sits between the sources.
        assert!(mid[0] < 200 && mid[0] > 0, "expected a mid-fade value, got {}", mid[0]);
        assert_eq!(mid[3], 255);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let end = frames.lock().unwrap().last().unwrap().clone();
        assert_eq!(&end[..4], &[0, 0, 0, 255], "fade completes on the incoming frame");

        session.finish();
        pgm_capture.destroy();
    }
}
