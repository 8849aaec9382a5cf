//! Backend-agnostic rendering core: pipeline descriptors, the pipeline
//! cache, shader providers and the scene-to-draw seam.
//!
//! # Invariants
//! - The pipeline cache holds one entry per canonical descriptor.
//! - Renderers read draw lists; they never mutate the world.

pub mod descriptor;
pub mod headless;
pub mod pipeline;
mod renderer;
pub mod scene;
pub mod shader;

pub use descriptor::{PipelineDescriptor, PipelineKey};
pub use headless::{BackendCounters, HeadlessBackend, HeadlessPipeline};
pub use pipeline::{
    CacheStats, FrameReport, PipelineBackend, PipelineCache, PipelineCacheConfig, PipelineError,
    PipelineHandle, PipelineInfo,
};
pub use renderer::{DebugTextRenderer, RenderView, Renderer};
pub use scene::{DrawItem, DrawList, FrameContext, MeshInfo, MeshTable, collect_draws, draw_items};
pub use shader::{ShaderArtifact, ShaderError, ShaderProvider, ShaderRequest, ShaderStage};

pub fn crate_info() -> &'static str {
    "playground-render v0.1.0"
}
