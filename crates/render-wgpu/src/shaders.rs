use playground_render::descriptor::{
    ColorFormat, CullMode, DepthFormat, DepthStencilState, PipelineDescriptor, VertexAttribute,
    VertexBufferLayout, VertexFormat, VertexLayout, VertexStepMode,
};
use playground_render::shader::{MemorySource, ResourceCounts, ShaderRequest};

pub const COLOR_FORMAT: ColorFormat = ColorFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: DepthFormat = DepthFormat::Depth32Float;

/// Per-draw uniforms and lighting shared by the built-in shaders.
pub const COMMON_SHADER: &str = r#"
struct DrawUniforms {
    mvp: mat4x4<f32>,
    model: mat4x4<f32>,
    color: vec4<f32>,
};

@group(0) @binding(0)
var<uniform> uniforms: DrawUniforms;

fn lambert(normal: vec3<f32>, base: vec3<f32>) -> vec3<f32> {
    let light_dir = normalize(vec3<f32>(0.3, 1.0, 0.5));
    let diffuse = max(dot(normalize(normal), light_dir), 0.0);
    return base * (0.3 + diffuse * 0.7);
}
"#;

/// Lit, uniformly colored meshes.
pub const SCENE_SHADER: &str = r#"
#include "common.wgsl"

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
};

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
};

@vertex
fn vs_main(vertex: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = uniforms.mvp * vec4<f32>(vertex.position, 1.0);
    out.world_normal = (uniforms.model * vec4<f32>(vertex.normal, 0.0)).xyz;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(lambert(in.world_normal, uniforms.color.rgb), uniforms.color.a);
}
"#;

/// In-memory source tree holding `common.wgsl` and `scene.wgsl`.
pub fn builtin_sources() -> MemorySource {
    MemorySource::new()
        .with("common.wgsl", COMMON_SHADER)
        .with("scene.wgsl", SCENE_SHADER)
}

/// Pipeline for [`SCENE_SHADER`] over `position, normal` vertices.
pub fn scene_pipeline_descriptor(cull_mode: CullMode) -> PipelineDescriptor {
    let uniforms = ResourceCounts {
        uniform_buffers: 1,
        ..ResourceCounts::default()
    };
    let mut descriptor = PipelineDescriptor::new(
        ShaderRequest::new("scene.wgsl", "vs_main").with_resources(uniforms),
        ShaderRequest::new("scene.wgsl", "fs_main").with_resources(uniforms),
        COLOR_FORMAT,
    )
    .with_label("scene");
    descriptor.vertex_layout = VertexLayout {
        buffers: vec![VertexBufferLayout {
            slot: 0,
            stride: 24,
            step_mode: VertexStepMode::Vertex,
        }],
        attributes: vec![
            VertexAttribute {
                location: 0,
                buffer_slot: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                buffer_slot: 0,
                format: VertexFormat::Float32x3,
                offset: 12,
            },
        ],
    };
    descriptor.rasterizer.cull_mode = cull_mode;
    descriptor.depth_stencil = Some(DepthStencilState::depth(DEPTH_FORMAT));
    descriptor
}
