//! Renderer configuration
//!
//! Configuration structures that applications use to customize device
//! behavior without hardcoding values in the rendering core itself.
//! Supports loading and saving from TOML and RON files.

use ash::vk;
use serde::{Deserialize, Serialize};

/// Smallest supported frame ring
pub const MIN_FRAMES_IN_FLIGHT: usize = 1;
/// Largest supported frame ring
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// Preferred presentation mode, resolved against what the surface supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentModePreference {
    /// FIFO, always available, vsync-locked
    Vsync,
    /// Mailbox if available, falling back to FIFO
    Mailbox,
    /// Immediate if available, falling back to FIFO
    Immediate,
}

impl PresentModePreference {
    /// Resolve the preference against the modes the surface reports
    pub fn resolve(self, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        let wanted = match self {
            Self::Vsync => vk::PresentModeKHR::FIFO,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        };
        if available.contains(&wanted) {
            wanted
        } else {
            vk::PresentModeKHR::FIFO
        }
    }
}

/// Configuration for the render device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Number of frames allowed in flight
    pub frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers (None = auto-detect from build type)
    pub enable_validation: Option<bool>,
    /// Preferred presentation mode
    pub present_mode: PresentModePreference,
    /// Background clear color [R, G, B, A] (0.0-1.0 range)
    pub clear_color: [f32; 4],
}

impl RendererConfig {
    /// Create a new configuration with defaults for the given application name
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            frames_in_flight: 2,
            enable_validation: None,
            present_mode: PresentModePreference::Mailbox,
            clear_color: [0.005, 0.005, 0.005, 1.0],
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set the number of frames in flight, clamped to a sane range
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        self
    }

    /// Enable or disable Vulkan validation layers
    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = Some(enable);
        self
    }

    /// Set the preferred presentation mode
    pub fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.present_mode = mode;
        self
    }

    /// Set background clear color [R, G, B, A] (0.0-1.0 range)
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Whether validation should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Frames in flight clamped to the supported range
    ///
    /// The field is public and deserializable, so out-of-range values from
    /// config files are re-clamped here, at the point of use.
    pub fn frames_in_flight_clamped(&self) -> usize {
        self.frames_in_flight
            .clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT)
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("render_device application")
    }
}

impl Config for RendererConfig {}

/// Configuration trait for file-backed settings
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.application_version, (1, 0, 0));
        assert_eq!(config.present_mode, PresentModePreference::Mailbox);
        assert!(config.enable_validation.is_none());
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert_eq!(config.frames_in_flight, 1);

        let config = RendererConfig::default().with_frames_in_flight(64);
        assert_eq!(config.frames_in_flight, 8);
    }

    #[test]
    fn toml_round_trip() {
        let config = RendererConfig::new("test app")
            .with_version(2, 1, 0)
            .with_frames_in_flight(3)
            .with_validation(false);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: RendererConfig = toml::from_str(&text).unwrap();

        assert_eq!(parsed.application_name, "test app");
        assert_eq!(parsed.application_version, (2, 1, 0));
        assert_eq!(parsed.frames_in_flight, 3);
        assert_eq!(parsed.enable_validation, Some(false));
    }

    #[test]
    fn deserialized_out_of_range_frames_are_reclamped() {
        let text = r#"
            application_name = "test app"
            application_version = [1, 0, 0]
            frames_in_flight = 0
            present_mode = "Vsync"
            clear_color = [0.0, 0.0, 0.0, 1.0]
        "#;
        let parsed: RendererConfig = toml::from_str(text).unwrap();
        assert_eq!(parsed.frames_in_flight, 0);
        assert_eq!(parsed.frames_in_flight_clamped(), MIN_FRAMES_IN_FLIGHT);

        let oversized = RendererConfig {
            frames_in_flight: 64,
            ..RendererConfig::default()
        };
        assert_eq!(oversized.frames_in_flight_clamped(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn present_mode_resolution_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            PresentModePreference::Mailbox.resolve(&available),
            vk::PresentModeKHR::FIFO
        );

        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            PresentModePreference::Mailbox.resolve(&available),
            vk::PresentModeKHR::MAILBOX
        );
    }
}
