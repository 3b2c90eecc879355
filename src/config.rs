// =============================================================================
// CONFIGURATION - config.toml
// =============================================================================
//
// Window, presentation, memory block sizes, camera tuning and the mesh list.
// A missing or broken file falls back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::mesh::{UpAxis, UvOrigin};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub memory: MemoryConfig,
    pub camera: CameraConfig,
    pub scene: SceneConfig,
    pub debug: DebugConfig,
}

/// Window settings. The window is fixed-size: there is no swapchain recreation.
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
            title: "Ekko Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Declare a depth attachment next to the swapchain image
    pub depth: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth: true,
        }
    }
}

/// Sizes of the two memory regions every GPU resource is carved out of
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub host_block_size: u64,
    pub local_block_size: u64,
    /// Staging buffer used for image uploads, lives in the host region
    pub staging_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            host_block_size: 128_000_000,
            local_block_size: 256_000_000,
            staging_size: 50_000_000,
        }
    }
}

/// First-person camera settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CameraConfig {
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// Radians per pixel of mouse motion
    pub sensitivity: f32,
    pub speed: f32,
    pub sprint_speed: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 70.0,
            near: 0.1,
            far: 1000.0,
            sensitivity: 0.001,
            speed: 0.1,
            sprint_speed: 100.0,
        }
    }
}

/// What to draw
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub asset_dir: PathBuf,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub meshes: Vec<MeshConfig>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from("assets"),
            vertex_shader: PathBuf::from("shaders/mesh.vert.spv"),
            fragment_shader: PathBuf::from("shaders/mesh.frag.spv"),
            meshes: Vec::new(),
        }
    }
}

/// A single mesh file, relative to `scene.asset_dir`
#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    pub path: PathBuf,
    /// Overrides the up axis the importer reports
    #[serde(default)]
    pub up_axis: Option<UpAxis>,
    /// Overrides the texture coordinate origin the importer reports
    #[serde(default)]
    pub uv_origin: Option<UvOrigin>,
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "ekko_debug.log".to_string(),
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}
