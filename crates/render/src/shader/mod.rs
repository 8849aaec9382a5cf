//! Shader requests, compiled artifacts and the providers that resolve one
//! into the other.
//!
//! A [`ShaderProvider`] has exactly one operation, [`ShaderProvider::resolve_shader`].
//! Two variants exist: [`PrecompiledShaderProvider`] serves bytecode
//! registered ahead of time, [`CompilingShaderProvider`] compiles WGSL on
//! demand and caches by content fingerprint.

pub(crate) mod compiler;
mod compiling;
mod precompiled;
mod source;
mod store;

pub use compiler::{CompiledShader, ComposedSource, compile_wgsl, compose};
pub use compiling::{CompileStats, CompilingShaderProvider};
pub use precompiled::PrecompiledShaderProvider;
pub use source::{FileSource, MemorySource, ShaderSource};
pub use store::{ArtifactKey, ArtifactStore, DiskArtifactStore, MemoryArtifactStore, StoreError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Magic word at the start of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// Short suffix used in precompiled file names (`name.vert.spv`).
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
        })
    }
}

/// Normalized, forward-slash identifier of a shader source.
///
/// `./a/../b\\c.wgsl` and `b/c.wgsl` name the same source. Deserialized
/// ids are normalized the same way as constructed ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().replace('\\', "/");
        let absolute = raw.starts_with('/');
        let mut parts: Vec<&str> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.last().is_some_and(|p| *p != "..") {
                        parts.pop();
                    } else if !absolute {
                        parts.push("..");
                    }
                }
                other => parts.push(other),
            }
        }
        let joined = parts.join("/");
        Self(if absolute { format!("/{joined}") } else { joined })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve `include` relative to the directory holding this source.
    pub fn join_relative(&self, include: &str) -> Self {
        if include.starts_with('/') {
            return Self::new(include);
        }
        match self.0.rsplit_once('/') {
            Some((dir, _)) => Self::new(format!("{dir}/{include}")),
            None if self.0.starts_with('/') => Self::new(format!("/{include}")),
            None => Self::new(include),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for SourceId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

/// Truncated SHA-256 of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(head))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Bindable resources a shader stage uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub uniform_buffers: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
    pub storage_textures: u32,
}

impl ResourceCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ResourceCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uniforms={} samplers={} storage_buffers={} storage_textures={}",
            self.uniform_buffers, self.samplers, self.storage_buffers, self.storage_textures
        )
    }
}

/// A logical shader: which source, which entry point, which resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderRequest {
    pub source: SourceId,
    pub entry_point: String,
    #[serde(default)]
    pub resources: ResourceCounts,
}

impl ShaderRequest {
    pub fn new(source: impl AsRef<str>, entry_point: impl Into<String>) -> Self {
        Self {
            source: SourceId::new(source),
            entry_point: entry_point.into(),
            resources: ResourceCounts::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceCounts) -> Self {
        self.resources = resources;
        self
    }
}

/// Compiled SPIR-V for one stage of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderArtifact {
    pub source: SourceId,
    pub entry_point: String,
    pub stage: ShaderStage,
    /// Fingerprint of the input the bytecode was built from.
    pub fingerprint: Fingerprint,
    pub resources: ResourceCounts,
    pub spirv: Arc<[u32]>,
}

/// Errors from resolving a shader request.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("no precompiled {stage} shader registered for '{id}'")]
    NotFound { id: SourceId, stage: ShaderStage },
    #[error("failed to read shader source '{id}': {source}")]
    Io {
        id: SourceId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compile {stage} shader '{id}': {diagnostic}")]
    Compile {
        id: SourceId,
        stage: ShaderStage,
        diagnostic: String,
    },
    #[error("invalid SPIR-V for '{id}': {reason}")]
    InvalidBytecode { id: SourceId, reason: String },
}

/// Resolves logical shader requests into bytecode.
pub trait ShaderProvider {
    fn resolve_shader(
        &mut self,
        request: &ShaderRequest,
        stage: ShaderStage,
    ) -> Result<Arc<ShaderArtifact>, ShaderError>;
}

impl<P: ShaderProvider + ?Sized> ShaderProvider for Box<P> {
    fn resolve_shader(
        &mut self,
        request: &ShaderRequest,
        stage: ShaderStage,
    ) -> Result<Arc<ShaderArtifact>, ShaderError> {
        (**self).resolve_shader(request, stage)
    }
}
