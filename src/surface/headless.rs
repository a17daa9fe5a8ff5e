//! Headless rendering surface
//!
//! A dependency-free [`RenderSurface`] implementation that fills its canvas
//! with a solid color derived from the loaded document and repaints on
//! `invalidate()`. The shipped binary runs on a pair of these until a real
//! rendering engine is bound; the test suite drives the playout pipeline
//! through them as well, so they expose failure-injection helpers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SurfaceError;
use crate::template::TemplatePayload;

use super::{FailureListener, PaintListener, RenderSurface, Size, SurfaceFailure, TemplateHook};

pub struct HeadlessSurface {
    label: String,
    size: Size,
    frame_rate: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    pixel: [u8; 4],
    buffer: Vec<u8>,
    paint_listener: Option<PaintListener>,
    failure_listener: Option<FailureListener>,
    frozen_hint: bool,
    hooks_seen: Vec<(TemplateHook, Option<serde_json::Value>)>,
    hook_failures: HashMap<&'static str, String>,
    fail_next_load: Option<String>,
    loaded: bool,
}

impl HeadlessSurface {
    pub fn new(label: impl Into<String>, size: Size, frame_rate: f64) -> Self {
        Self {
            label: label.into(),
            size,
            frame_rate,
            inner: Mutex::new(Inner {
                pixel: [0, 0, 0, 0],
                buffer: vec![0; size.byte_len()],
                paint_listener: None,
                failure_listener: None,
                frozen_hint: false,
                hooks_seen: Vec::new(),
                hook_failures: HashMap::new(),
                fail_next_load: None,
                loaded: false,
            }),
        }
    }

    /// Synthesize one paint with the current fill color.
    pub fn paint_now(&self) {
        let mut inner = self.inner.lock().unwrap();
        let pixel = inner.pixel;
        let len = self.size.byte_len();
        if inner.buffer.len() != len {
            inner.buffer.resize(len, 0);
        }
        for px in inner.buffer.chunks_exact_mut(4) {
            px.copy_from_slice(&pixel);
        }
        let size = self.size;
        let Inner { buffer, paint_listener, .. } = &mut *inner;
        if let Some(listener) = paint_listener.as_mut() {
            listener(buffer, size);
        }
    }

    /// Override the fill color (BGRA). Useful for pixel-exact tests.
    pub fn set_pixel(&self, pixel: [u8; 4]) {
        self.inner.lock().unwrap().pixel = pixel;
    }

    /// Deliver a zero-length bitmap, as a misbehaving compositor would.
    pub fn paint_empty(&self) {
        let mut inner = self.inner.lock().unwrap();
        let size = self.size;
        if let Some(listener) = inner.paint_listener.as_mut() {
            listener(&[], size);
        }
    }

    /// Raise a failure signal as if the renderer died or hung.
    pub fn inject_failure(&self, failure: SurfaceFailure) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listener) = inner.failure_listener.as_mut() {
            listener(failure);
        }
    }

    /// Make the named hook reject once with the given message.
    pub fn fail_next_hook(&self, hook: TemplateHook, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .hook_failures
            .insert(hook.name(), message.into());
    }

    /// Make the next `load_document` reject with the given message.
    pub fn fail_next_load(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_load = Some(message.into());
    }

    /// Hooks invoked on this surface, in order.
    pub fn hooks_seen(&self) -> Vec<TemplateHook> {
        self.inner
            .lock()
            .unwrap()
            .hooks_seen
            .iter()
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn frozen_hint(&self) -> bool {
        self.inner.lock().unwrap().frozen_hint
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().unwrap().loaded
    }
}

#[async_trait]
impl RenderSurface for HeadlessSurface {
    fn label(&self) -> &str {
        &self.label
    }

    fn size(&self) -> Size {
        self.size
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    async fn load_document(&self, payload: &TemplatePayload) -> Result<(), SurfaceError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_next_load.take() {
                return Err(SurfaceError::LoadFailed(message));
            }
            inner.pixel = pixel_for(&payload.body);
            inner.loaded = true;
        }
        self.paint_now();
        Ok(())
    }

    async fn call_hook(
        &self,
        hook: TemplateHook,
        arg: Option<serde_json::Value>,
    ) -> Result<(), SurfaceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.hook_failures.remove(hook.name()) {
            return Err(SurfaceError::HookRejected(hook.name(), message));
        }
        inner.hooks_seen.push((hook, arg));
        Ok(())
    }

    fn set_paint_listener(&self, listener: Option<PaintListener>) {
        self.inner.lock().unwrap().paint_listener = listener;
    }

    fn invalidate(&self) {
        self.paint_now();
    }

    fn set_freeze_hint(&self, frozen: bool) {
        self.inner.lock().unwrap().frozen_hint = frozen;
    }

    fn set_failure_listener(&self, listener: Option<FailureListener>) {
        self.inner.lock().unwrap().failure_listener = listener;
    }

    async fn reload(&self) -> Result<(), SurfaceError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pixel = [0, 0, 0, 0];
            inner.loaded = false;
        }
        self.paint_now();
        Ok(())
    }
}

/// Derive a stable opaque fill color from the document body.
fn pixel_for(body: &str) -> [u8; 4] {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    let h = hasher.finish();
    [h as u8, (h >> 8) as u8, (h >> 16) as u8, 0xFF]
}
