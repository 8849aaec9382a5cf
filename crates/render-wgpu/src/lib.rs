//! wgpu backend for the playground pipeline cache.
//!
//! Builds render pipelines from SPIR-V artifacts and draws one indexed mesh
//! per draw item into an offscreen target.
//!
//! # Invariants
//! - Renderer never mutates world state; it only sees draw lists.
//! - Pipeline creation errors surface as `ResourceCreation`, never panics.

mod backend;
mod conversions;
mod gpu;
mod shaders;

pub use backend::WgpuPipelineBackend;
pub use conversions::{
    blend_state, color_format, color_target, depth_format, depth_stencil, multisample,
    primitive_state, vertex_format,
};
pub use gpu::{FrameImage, FrameStats, GpuContext, GpuError, SceneRenderer};
pub use shaders::{
    COLOR_FORMAT, COMMON_SHADER, DEPTH_FORMAT, SCENE_SHADER, builtin_sources,
    scene_pipeline_descriptor,
};
