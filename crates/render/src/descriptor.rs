//! Pipeline descriptors and their canonical identity.
//!
//! Every field that affects the compiled pipeline object takes part in
//! equality and hashing: both shader requests (source, entry point, resource
//! counts), vertex buffers and attributes, topology, rasterizer state,
//! multisampling, depth/stencil state and every color target. The label is
//! for diagnostics only and is cleared by [`PipelineDescriptor::canonical`].
//!
//! # Invariants
//! - Field-wise equal descriptors have equal canonical forms and keys.
//! - Canonical forms do not depend on buffer or attribute declaration order.

use crate::shader::ShaderRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x4,
    Sint32,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 | Self::Unorm8x4 => 4,
            Self::Float32x2 | Self::Uint32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexBufferLayout {
    pub slot: u32,
    pub stride: u64,
    pub step_mode: VertexStepMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexAttribute {
    pub location: u32,
    pub buffer_slot: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Buffer descriptions plus the attributes read from them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexLayout {
    pub buffers: Vec<VertexBufferLayout>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Attributes belonging to buffer `slot`, by location.
    pub fn attributes_of(&self, slot: u32) -> impl Iterator<Item = &VertexAttribute> + '_ {
        self.attributes.iter().filter(move |a| a.buffer_slot == slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillMode {
    #[default]
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultisampleState {
    pub count: u32,
    pub alpha_to_coverage: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            count: 1,
            alpha_to_coverage: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepthFormat {
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
}

impl DepthFormat {
    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthStencilState {
    pub format: DepthFormat,
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareFunction,
    pub stencil_enabled: bool,
}

impl DepthStencilState {
    /// Depth test and write with `Less`, stencil off.
    pub fn depth(format: DepthFormat) -> Self {
        Self {
            format,
            depth_test: true,
            depth_write: true,
            compare: CompareFunction::Less,
            stencil_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendMode {
    Replace,
    Alpha,
    Additive,
}

/// RGBA write mask; bit layout R=1, G=2, B=4, A=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorWrites(pub u8);

impl ColorWrites {
    pub const ALL: Self = Self(0b1111);
    pub const COLOR: Self = Self(0b0111);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorTargetState {
    pub format: ColorFormat,
    pub blend: Option<BlendMode>,
    pub write_mask: ColorWrites,
}

impl ColorTargetState {
    pub fn opaque(format: ColorFormat) -> Self {
        Self {
            format,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

/// Everything that determines a compiled graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    #[serde(default)]
    pub label: String,
    pub vertex_shader: ShaderRequest,
    pub fragment_shader: ShaderRequest,
    #[serde(default)]
    pub vertex_layout: VertexLayout,
    #[serde(default)]
    pub primitive: PrimitiveTopology,
    #[serde(default)]
    pub rasterizer: RasterizerState,
    #[serde(default)]
    pub multisample: MultisampleState,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

impl PipelineDescriptor {
    /// Descriptor with default fixed-function state and one opaque target.
    pub fn new(
        vertex_shader: ShaderRequest,
        fragment_shader: ShaderRequest,
        color_format: ColorFormat,
    ) -> Self {
        Self {
            label: String::new(),
            vertex_shader,
            fragment_shader,
            vertex_layout: VertexLayout::default(),
            primitive: PrimitiveTopology::default(),
            rasterizer: RasterizerState::default(),
            multisample: MultisampleState::default(),
            depth_stencil: None,
            color_targets: vec![ColorTargetState::opaque(color_format)],
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Identity form: label cleared, buffers sorted by slot, attributes
    /// sorted by location.
    pub fn canonical(&self) -> Self {
        let mut canonical = self.clone();
        canonical.label.clear();
        canonical.vertex_layout.buffers.sort_by_key(|b| b.slot);
        canonical
            .vertex_layout
            .attributes
            .sort_by_key(|a| (a.location, a.buffer_slot));
        canonical
    }

    /// Stable FNV-1a digest of the canonical form.
    pub fn key(&self) -> PipelineKey {
        let mut hasher = FnvHasher::default();
        self.canonical().hash(&mut hasher);
        PipelineKey(hasher.finish())
    }

    /// Name for logs: the label, or the shader sources if unlabeled.
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            format!("{}+{}", self.vertex_shader.source, self.fragment_shader.source)
        } else {
            self.label.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(pub u64);

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325) // FNV offset basis
    }
}

impl Hasher for FnvHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> PipelineDescriptor {
        let mut d = PipelineDescriptor::new(
            ShaderRequest::new("shaders/scene.wgsl", "vs_main"),
            ShaderRequest::new("shaders/scene.wgsl", "fs_main"),
            ColorFormat::Bgra8UnormSrgb,
        )
        .with_label("scene");
        d.vertex_layout = VertexLayout {
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
        d.depth_stencil = Some(DepthStencilState::depth(DepthFormat::Depth24PlusStencil8));
        d
    }

    #[test]
    fn equal_descriptors_share_key() {
        assert_eq!(sample().key(), sample().key());
        assert_eq!(sample().canonical(), sample().canonical());
    }

    #[test]
    fn label_is_not_identity() {
        let a = sample();
        let b = sample().with_label("other");
        assert_ne!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn attribute_order_is_not_identity() {
        let a = sample();
        let mut b = sample();
        b.vertex_layout.attributes.reverse();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn shader_path_spelling_is_not_identity() {
        let a = sample();
        let mut b = sample();
        b.vertex_shader = ShaderRequest::new("./shaders/x/../scene.wgsl", "vs_main");
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn descriptor_loaded_from_json_shares_key() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["vertex_shader"]["source"] = "./shaders/extra/../scene.wgsl".into();
        value["fragment_shader"]["source"] = "shaders\\scene.wgsl".into();
        let loaded: PipelineDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(loaded.key(), sample().key());
    }

    #[test]
    fn every_state_field_changes_key() {
        let base = sample().key();
        let mut variants: Vec<PipelineDescriptor> = Vec::new();

        let mut d = sample();
        d.rasterizer.cull_mode = CullMode::Front;
        variants.push(d);
        let mut d = sample();
        d.rasterizer.fill_mode = FillMode::Line;
        variants.push(d);
        let mut d = sample();
        d.rasterizer.front_face = FrontFace::Clockwise;
        variants.push(d);
        let mut d = sample();
        d.primitive = PrimitiveTopology::LineList;
        variants.push(d);
        let mut d = sample();
        d.multisample.count = 4;
        variants.push(d);
        let mut d = sample();
        d.multisample.alpha_to_coverage = true;
        variants.push(d);
        let mut d = sample();
        d.depth_stencil = Some(DepthStencilState::depth(DepthFormat::Depth32Float));
        variants.push(d);
        let mut d = sample();
        d.depth_stencil = None;
        variants.push(d);
        let mut d = sample();
        d.color_targets[0].blend = Some(BlendMode::Alpha);
        variants.push(d);
        let mut d = sample();
        d.color_targets[0].write_mask = ColorWrites::COLOR;
        variants.push(d);
        let mut d = sample();
        d.vertex_layout.buffers[0].stride = 32;
        variants.push(d);
        let mut d = sample();
        d.vertex_layout.attributes[1].offset = 16;
        variants.push(d);
        let mut d = sample();
        d.fragment_shader.entry_point = "fs_alt".into();
        variants.push(d);
        let mut d = sample();
        d.vertex_shader.resources.uniform_buffers = 1;
        variants.push(d);

        let mut keys: Vec<PipelineKey> = variants.iter().map(PipelineDescriptor::key).collect();
        assert!(keys.iter().all(|k| *k != base));
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), variants.len());
    }

    #[test]
    fn display_name_falls_back_to_sources() {
        let mut d = sample();
        assert_eq!(d.display_name(), "scene");
        d.label.clear();
        assert_eq!(d.display_name(), "shaders/scene.wgsl+shaders/scene.wgsl");
    }

    #[test]
    fn vertex_format_sizes() {
        assert_eq!(VertexFormat::Float32x3.size(), 12);
        assert_eq!(VertexFormat::Unorm8x4.size(), 4);
    }
}
