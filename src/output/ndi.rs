//! NDI network output
//!
//! Sends a single BGRA stream with native alpha; no separate key channel.
//! The SDK binding sits behind [`NdiSender`] so the core builds without the
//! NDI runtime.

use crate::surface::Size;

use super::OutputDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FourCc {
    Bgra,
}

/// Per-frame metadata the NDI SDK expects alongside the pixel data.
pub struct NdiVideoFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row; BGRA is tightly packed.
    pub stride: u32,
    pub frame_rate: f64,
    pub four_cc: FourCc,
    pub data: &'a [u8],
}

/// The network sender binding.
pub trait NdiSender: Send {
    fn send_video(&mut self, frame: &NdiVideoFrame<'_>) -> anyhow::Result<()>;
    fn close(&mut self);
}

pub struct NdiOutput {
    frame_rate: f64,
    sender: Box<dyn NdiSender>,
}

impl NdiOutput {
    pub fn new(frame_rate: f64, sender: Box<dyn NdiSender>) -> Self {
        Self { frame_rate, sender }
    }
}

impl OutputDriver for NdiOutput {
    fn name(&self) -> &str {
        "ndi"
    }

    fn push_frame(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()> {
        self.sender.send_video(&NdiVideoFrame {
            width: size.width,
            height: size.height,
            stride: size.width * 4,
            frame_rate: self.frame_rate,
            four_cc: FourCc::Bgra,
            data: bgra,
        })
    }

    fn destroy(&mut self) {
        self.sender.close();
    }
}
