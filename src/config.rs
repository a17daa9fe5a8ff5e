//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::surface::Size;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control channel configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Health endpoint configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Surface and output frame format
    #[serde(default)]
    pub video: VideoConfig,

    /// Output sink configuration
    #[serde(default)]
    pub outputs: OutputsConfig,

    /// Template handling configuration
    #[serde(default)]
    pub templates: TemplateConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Listen port for the control WebSocket
    #[serde(default = "default_control_port")]
    pub port: u16,

    /// If set, connections must carry this token
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Listen port for the health endpoint (0 = disabled)
    #[serde(default = "default_health_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Target output frame rate for capture and black burst
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,
}

impl VideoConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    /// Display index for the fill window (-1 = disabled)
    #[serde(default = "default_monitor")]
    pub rgb_monitor: i32,

    /// Display index for the alpha-monitoring window (-1 = disabled)
    #[serde(default = "default_monitor")]
    pub alpha_monitor: i32,

    #[serde(default)]
    pub sdi: SdiConfig,

    #[serde(default)]
    pub ndi: NdiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub fill_device: u32,

    #[serde(default = "default_key_device")]
    pub key_device: u32,

    #[serde(default = "default_display_mode")]
    pub display_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sender_name")]
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Byte ceiling for the composed-document memo
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
}

// Default value functions
fn default_control_port() -> u16 {
    9710
}

fn default_health_port() -> u16 {
    9711
}

fn default_frame_rate() -> f64 {
    25.0
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_monitor() -> i32 {
    -1
}

fn default_key_device() -> u32 {
    1
}

fn default_display_mode() -> String {
    "1080i50".to_string()
}

fn default_sender_name() -> String {
    "keyline".to_string()
}

fn default_cache_max_bytes() -> u64 {
    8 * 1024 * 1024
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
            auth_token: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            rgb_monitor: default_monitor(),
            alpha_monitor: default_monitor(),
            sdi: SdiConfig::default(),
            ndi: NdiConfig::default(),
        }
    }
}

impl Default for SdiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fill_device: 0,
            key_device: default_key_device(),
            display_mode: default_display_mode(),
        }
    }
}

impl Default for NdiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender_name: default_sender_name(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: default_cache_max_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            health: HealthConfig::default(),
            video: VideoConfig::default(),
            outputs: OutputsConfig::default(),
            templates: TemplateConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match self.config_path.clone() {
            Some(path) => path,
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match self.config_path.clone() {
            Some(path) => Ok(path),
            None => Self::default_config_path(),
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("tv", "keyline", "keyline")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_full_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.control.port, 9710);
        assert_eq!(config.health.port, 9711);
        assert_eq!(config.video.frame_rate, 25.0);
        assert_eq!(config.video.size(), Size::new(1920, 1080));
        assert_eq!(config.outputs.rgb_monitor, -1);
        assert!(!config.outputs.sdi.enabled);
        assert_eq!(config.outputs.sdi.display_mode, "1080i50");
        assert_eq!(config.outputs.ndi.sender_name, "keyline");
        assert!(config.control.auth_token.is_none());
    }

    #[test]
    fn partial_sections_keep_unrelated_defaults() {
        let config: Config = toml::from_str(
            r#"
            [control]
            port = 7000
            auth_token = "s3cret"

            [outputs.sdi]
            enabled = true
            fill_device = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.control.port, 7000);
        assert_eq!(config.control.auth_token.as_deref(), Some("s3cret"));
        assert!(config.outputs.sdi.enabled);
        assert_eq!(config.outputs.sdi.fill_device, 2);
        assert_eq!(config.outputs.sdi.key_device, 1, "unset fields stay default");
        assert_eq!(config.video.width, 1920);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.video.frame_rate = 50.0;
        config.health.port = 0;

        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.video.frame_rate, 50.0);
        assert_eq!(back.health.port, 0);
    }
}
