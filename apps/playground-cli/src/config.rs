use anyhow::Context;
use playground_render::PipelineCacheConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings shared by every subcommand. Command-line flags override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineCacheConfig,
    /// Directory holding `scene.wgsl` and its includes; built-in shaders
    /// are used when unset.
    pub shader_dir: Option<PathBuf>,
    /// Where compiled SPIR-V is cached between runs.
    pub artifact_dir: Option<PathBuf>,
    /// Linear RGBA.
    pub clear_color: [f64; 4],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineCacheConfig::default(),
            shader_dir: None,
            artifact_dir: None,
            clear_color: [0.1, 0.1, 0.15, 1.0],
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}
