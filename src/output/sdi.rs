//! SDI fill + key output
//!
//! Drives two scheduled-playback channels on an SDI card: the fill picture
//! and the alpha-as-luma key signal hardware keyers expect. The actual card
//! access sits behind [`SdiHardware`]/[`SdiPort`] so the playout core builds
//! without a vendor SDK; the integrator supplies the binding.

use tracing::warn;

use crate::surface::Size;

use super::OutputDriver;

/// Opens playout ports on an SDI device.
pub trait SdiHardware: Send + Sync {
    fn open_port(&self, device_index: u32, display_mode: &str) -> anyhow::Result<Box<dyn SdiPort>>;
}

/// One playout channel. `display_frame` is fire-and-forget; hardware errors
/// surface asynchronously through the driver's push results.
pub trait SdiPort: Send {
    fn display_frame(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()>;
    fn stop(&mut self);
}

/// The slice of configuration the driver needs to open its channels.
#[derive(Debug, Clone)]
pub struct SdiConfigView {
    pub fill_device: u32,
    pub key_device: u32,
    pub display_mode: String,
}

pub struct SdiOutput {
    fill: Box<dyn SdiPort>,
    key: Option<Box<dyn SdiPort>>,
}

impl SdiOutput {
    /// Open fill and key channels. A key device that cannot be opened while
    /// fill succeeds puts the driver into fill-only mode; that is a mode,
    /// not an error.
    pub fn open(hardware: &dyn SdiHardware, cfg: &SdiConfigView) -> anyhow::Result<Self> {
        let fill = hardware.open_port(cfg.fill_device, &cfg.display_mode)?;
        let key = match hardware.open_port(cfg.key_device, &cfg.display_mode) {
            Ok(port) => Some(port),
            Err(err) => {
                warn!(
                    device = cfg.key_device,
                    error = %err,
                    "SDI key device unavailable, running fill-only"
                );
                None
            }
        };
        Ok(Self { fill, key })
    }

    pub fn fill_only(&self) -> bool {
        self.key.is_none()
    }
}

impl OutputDriver for SdiOutput {
    fn name(&self) -> &str {
        "sdi"
    }

    fn has_key_input(&self) -> bool {
        self.key.is_some()
    }

    fn push_frame(&mut self, bgra: &[u8], size: Size) -> anyhow::Result<()> {
        self.fill.display_frame(bgra, size)
    }

    fn push_key_frame(&mut self, key: &[u8], size: Size) -> anyhow::Result<()> {
        match self.key.as_mut() {
            Some(port) => port.display_frame(key, size),
            None => Ok(()),
        }
    }

    fn destroy(&mut self) {
        self.fill.stop();
        if let Some(key) = self.key.as_mut() {
            key.stop();
        }
    }
}
