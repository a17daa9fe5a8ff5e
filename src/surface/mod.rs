//! Rendering surface contract
//!
//! A surface is one off-screen canvas at a fixed resolution and frame rate.
//! The engine owns exactly two of them (preview and program) and is the only
//! component allowed to invoke surface operations; frame capture merely
//! observes paint events through the registered listener.
//!
//! Binding this trait to a concrete rendering engine (an embedded web engine,
//! a headless browser, ...) is the integrator's responsibility. The binding
//! must hand over contiguous BGRA bitmaps, converting if its compositor
//! delivers any other arrangement.

mod headless;

pub use headless::HeadlessSurface;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SurfaceError;
use crate::template::TemplatePayload;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one BGRA frame at this size.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// The closed set of template-level hooks a loaded document exposes.
///
/// Hook absence in the document is a no-op, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateHook {
    Play,
    Stop,
    Next,
    Update,
    Clear,
}

impl TemplateHook {
    pub fn name(&self) -> &'static str {
        match self {
            TemplateHook::Play => "play",
            TemplateHook::Stop => "stop",
            TemplateHook::Next => "next",
            TemplateHook::Update => "update",
            TemplateHook::Clear => "clear",
        }
    }
}

/// Failure signals a surface can raise outside of any operation.
#[derive(Debug, Clone)]
pub enum SurfaceFailure {
    /// The underlying renderer process or context died.
    RendererGone { reason: String },
    /// The renderer stopped answering but may still recover.
    Unresponsive,
}

/// Paint listener: invoked on the compositor's thread for every rendered
/// frame with the contiguous BGRA bitmap. Must complete in bounded time.
pub type PaintListener = Box<dyn FnMut(&[u8], Size) + Send>;

/// Failure listener: invoked when the renderer dies or hangs.
pub type FailureListener = Box<dyn FnMut(SurfaceFailure) + Send>;

/// One off-screen rendering canvas.
///
/// All operations are single-threaded with respect to the surface. Document
/// and hook operations marshal into the rendering context and therefore
/// suspend; callers must not assume synchronous completion.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    /// Stable label for logs and mix events.
    fn label(&self) -> &str;

    /// Canvas size, fixed at creation.
    fn size(&self) -> Size;

    /// Declared frame rate, fixed at creation.
    fn frame_rate(&self) -> f64;

    /// Replace the surface's contents with the document derived from the
    /// payload.
    async fn load_document(&self, payload: &TemplatePayload) -> Result<(), SurfaceError>;

    /// Invoke a template hook on the loaded document.
    async fn call_hook(
        &self,
        hook: TemplateHook,
        arg: Option<serde_json::Value>,
    ) -> Result<(), SurfaceError>;

    /// Register (or clear) the single paint listener slot.
    fn set_paint_listener(&self, listener: Option<PaintListener>);

    /// Ask the surface to repaint even if content has not changed.
    ///
    /// This is the force-invalidate path frame capture leans on to keep
    /// static content producing fresh bitmaps at the declared rate.
    fn invalidate(&self);

    /// Advisory freeze hint; freeze semantics live in frame capture.
    fn set_freeze_hint(&self, frozen: bool);

    /// Register (or clear) the failure listener slot.
    fn set_failure_listener(&self, listener: Option<FailureListener>);

    /// Re-initialize the surface to its blank host state.
    async fn reload(&self) -> Result<(), SurfaceError>;
}

/// Shared handle to a surface.
pub type SurfaceHandle = Arc<dyn RenderSurface>;
