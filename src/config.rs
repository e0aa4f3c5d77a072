// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors, and
// clamps out-of-range values instead of rejecting the whole file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use winit::keyboard::KeyCode;

use crate::frame::{DrainPolicy, FrameSettings};
use crate::scene::{Sample, LIGHT_STEEL_BLUE};

pub const MIN_BACK_BUFFERS: u32 = 2;
pub const MAX_BACK_BUFFERS: u32 = 16;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pipeline".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub sample: Sample,
    pub back_buffer_count: u32,
    /// 0 presents immediately, N waits for N vertical blanks.
    pub vsync_interval: u32,
    pub clear_color: [f32; 4],
    pub depth_stencil: bool,
    pub drain_policy: DrainPolicy,
    pub fence_initial_value: u64,
    pub fence_timeout_ms: u64,
    pub shader_dir: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            sample: Sample::Triangle,
            back_buffer_count: MIN_BACK_BUFFERS,
            vsync_interval: 0,
            clear_color: LIGHT_STEEL_BLUE,
            depth_stencil: true,
            drain_policy: DrainPolicy::Strict,
            fence_initial_value: 0,
            fence_timeout_ms: 5000,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Re-wait once with a longer budget when a fence wait times out.
    pub diagnose_stalls: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "frame_pipeline.log".to_string(),
            show_fps: true,
            diagnose_stalls: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl ControlsConfig {
    pub fn fullscreen(&self) -> KeyCode {
        parse_key(&self.fullscreen_key).unwrap_or_else(|| {
            log::warn!("Unknown fullscreen key '{}', using F11", self.fullscreen_key);
            KeyCode::F11
        })
    }

    pub fn quit(&self) -> KeyCode {
        parse_key(&self.quit_key).unwrap_or_else(|| {
            log::warn!("Unknown quit key '{}', using Escape", self.quit_key);
            KeyCode::Escape
        })
    }
}

/// Map a key name from the config file to a winit key code.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "enter" | "return" => KeyCode::Enter,
        "space" => KeyCode::Space,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "f" => KeyCode::KeyF,
        "q" => KeyCode::KeyQ,
        "x" => KeyCode::KeyX,
        _ => return None,
    };
    Some(key)
}

/// Where the configuration came from and what had to be adjusted.
///
/// Config is read before the logger exists, so nothing is logged while
/// loading. `log` replays the outcome once logging is initialized.
#[derive(Debug)]
pub struct LoadReport {
    pub source: ConfigSource,
    pub adjustments: Vec<String>,
}

#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, anyhow::Error),
}

impl LoadReport {
    pub fn log(&self) {
        match &self.source {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(path, e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e)
            }
        }
        for adjustment in &self.adjustments {
            log::warn!("{}", adjustment);
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if missing or invalid
    pub fn load() -> (Self, LoadReport) {
        Self::load_at("config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_at<P: AsRef<Path>>(path: P) -> (Self, LoadReport) {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let report = LoadReport {
                source: ConfigSource::Missing(path),
                adjustments: Vec::new(),
            };
            return (Config::default(), report);
        }

        match Self::read(&path) {
            Ok((config, adjustments)) => {
                let report = LoadReport {
                    source: ConfigSource::File(path),
                    adjustments,
                };
                (config, report)
            }
            Err(e) => {
                let report = LoadReport {
                    source: ConfigSource::Invalid(path, e),
                    adjustments: Vec::new(),
                };
                (Config::default(), report)
            }
        }
    }

    fn read(path: &Path) -> Result<(Self, Vec<String>)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Parse and validate a TOML document, returning the clamped values
    /// as human-readable notes.
    pub fn parse(content: &str) -> Result<(Self, Vec<String>)> {
        let mut config: Config = toml::from_str(content)?;
        let adjustments = config.validate();
        Ok((config, adjustments))
    }

    /// Clamp values the frame pipeline cannot run with.
    pub fn validate(&mut self) -> Vec<String> {
        let mut adjustments = Vec::new();
        let graphics = &mut self.graphics;

        let count = graphics
            .back_buffer_count
            .clamp(MIN_BACK_BUFFERS, MAX_BACK_BUFFERS);
        if count != graphics.back_buffer_count {
            adjustments.push(format!(
                "back_buffer_count {} out of range {}..={}, using {}",
                graphics.back_buffer_count, MIN_BACK_BUFFERS, MAX_BACK_BUFFERS, count
            ));
            graphics.back_buffer_count = count;
        }

        if graphics.fence_initial_value > 1 {
            adjustments.push(format!(
                "fence_initial_value {} must be 0 or 1, using 1",
                graphics.fence_initial_value
            ));
            graphics.fence_initial_value = 1;
        }

        if graphics.fence_timeout_ms == 0 {
            adjustments.push("fence_timeout_ms must be positive, using 1".to_string());
            graphics.fence_timeout_ms = 1;
        }

        if graphics.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            adjustments.push(format!(
                "clear_color {:?} clamped to 0..=1",
                graphics.clear_color
            ));
            for channel in graphics.clear_color.iter_mut() {
                *channel = channel.clamp(0.0, 1.0);
            }
        }

        adjustments
    }

    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            drain_policy: self.graphics.drain_policy,
            vsync_interval: self.graphics.vsync_interval,
            fence_timeout: Duration::from_millis(self.graphics.fence_timeout_ms),
            fence_initial_value: self.graphics.fence_initial_value,
            diagnose_stalls: self.debug.diagnose_stalls,
        }
    }
}
