//! On-screen window output
//!
//! Presents the fill picture full-screen on a chosen display, with an
//! optional second window monitoring the key signal. Window creation and
//! presentation sit behind [`WindowPresenter`]; the window runs at the
//! display's native refresh independent of the capture clock.

use crate::surface::Size;

use super::OutputDriver;

/// A full-screen presentation target on one display.
pub trait WindowPresenter: Send {
    fn present(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
}

pub struct WindowOutput {
    fill: Box<dyn WindowPresenter>,
    alpha: Option<Box<dyn WindowPresenter>>,
}

impl WindowOutput {
    pub fn new(fill: Box<dyn WindowPresenter>, alpha: Option<Box<dyn WindowPresenter>>) -> Self {
        Self { fill, alpha }
    }
}

impl OutputDriver for WindowOutput {
    fn name(&self) -> &str {
        "window"
    }

    fn has_key_input(&self) -> bool {
        self.alpha.is_some()
    }

    /// Key demand tracks the alpha window: it is only worth extracting while
    /// that window is actually open.
    fn needs_key_frame(&self) -> bool {
        self.alpha.as_ref().map(|w| w.is_open()).unwrap_or(false)
    }

    fn push_frame(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()> {
        self.fill.present(bgra, size)
    }

    fn push_key_frame(&mut self, key: &[u8], size: Size) -> anyhow::Result<()> {
        match self.alpha.as_mut() {
            Some(window) if window.is_open() => window.present(key, size),
            _ => Ok(()),
        }
    }

    fn destroy(&mut self) {
        self.fill.close();
        if let Some(alpha) = self.alpha.as_mut() {
            alpha.close();
        }
    }
}
