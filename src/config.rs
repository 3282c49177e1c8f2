// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use vk_present::{DeviceOptions, ExtensionPolicy, SessionConfig};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "VulkanPractice".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub preferred_format: String,
    pub clear_color: [f32; 4],
    /// Bound on acquire / fence waits. Absent means wait forever.
    pub wait_timeout_ms: Option<u64>,
    pub extension_policy: ExtensionPolicy,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            preferred_format: "B8G8R8A8_UNORM".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            wait_timeout_ms: None,
            extension_policy: ExtensionPolicy::All,
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
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the preferred swapchain format as Vulkan enum
    pub fn preferred_format(&self) -> Result<vk::Format> {
        parse_format(&self.graphics.preferred_format)
            .with_context(|| format!("Unknown surface format '{}'", self.graphics.preferred_format))
    }

    /// Settings for opening the GPU session.
    ///
    /// Validation only applies to debug builds.
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            application_label: self.window.title.clone(),
            preferred_format: self.preferred_format()?,
            clear_color: self.graphics.clear_color,
            wait_timeout: self.graphics.wait_timeout_ms.map(Duration::from_millis),
            device: DeviceOptions {
                validation: cfg!(debug_assertions) && self.debug.validation_layers,
                extension_policy: self.graphics.extension_policy,
            },
        })
    }
}

fn parse_format(name: &str) -> Option<vk::Format> {
    let format = match name.to_ascii_uppercase().as_str() {
        "B8G8R8A8_UNORM" => vk::Format::B8G8R8A8_UNORM,
        "B8G8R8A8_SRGB" => vk::Format::B8G8R8A8_SRGB,
        "R8G8B8A8_UNORM" => vk::Format::R8G8B8A8_UNORM,
        "R8G8B8A8_SRGB" => vk::Format::R8G8B8A8_SRGB,
        "A2B10G10R10_UNORM_PACK32" => vk::Format::A2B10G10R10_UNORM_PACK32,
        "A2R10G10B10_UNORM_PACK32" => vk::Format::A2R10G10B10_UNORM_PACK32,
        "R16G16B16A16_SFLOAT" => vk::Format::R16G16B16A16_SFLOAT,
        _ => return None,
    };
    Some(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from_path(dir.path().join("config.toml")).unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.extension_policy, ExtensionPolicy::All);
        assert_eq!(config.graphics.wait_timeout_ms, None);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[window]
title = "Present Test"

[graphics]
preferred_format = "r8g8b8a8_srgb"
wait_timeout_ms = 250
extension_policy = "required"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.window.title, "Present Test");
        assert_eq!(config.window.height, 720);

        let session = config.session_config().unwrap();
        assert_eq!(session.application_label, "Present Test");
        assert_eq!(session.preferred_format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(session.wait_timeout, Some(Duration::from_millis(250)));
        assert_eq!(session.device.extension_policy, ExtensionPolicy::Required);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut config = Config::default();
        config.graphics.preferred_format = "R5G6B5".to_string();
        assert!(config.session_config().is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[graphics]\nextension_policy = \"some\"\n").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
