//! Bytecode registered ahead of time; never compiles.

use super::{
    Fingerprint, SPIRV_MAGIC, ShaderArtifact, ShaderError, ShaderProvider, ShaderRequest,
    ShaderStage, SourceId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

struct Registered {
    spirv: Arc<[u32]>,
    fingerprint: Fingerprint,
    /// Last artifact handed out, reused while the request matches.
    last: Option<Arc<ShaderArtifact>>,
}

/// Serves SPIR-V looked up by `(source, stage)`.
#[derive(Default)]
pub struct PrecompiledShaderProvider {
    registry: HashMap<(SourceId, ShaderStage), Registered>,
}

impl PrecompiledShaderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) bytecode for `source` at `stage`.
    ///
    /// Replacing bytecode changes the fingerprint, so pipelines built from the
    /// old version are rebuilt at the next end of frame.
    pub fn insert(
        &mut self,
        source: impl AsRef<str>,
        stage: ShaderStage,
        bytes: &[u8],
    ) -> Result<(), ShaderError> {
        let id = SourceId::new(source);
        let invalid = |reason: &str| ShaderError::InvalidBytecode {
            id: id.clone(),
            reason: reason.to_string(),
        };
        if bytes.len() < 4 || bytes.len() % 4 != 0 {
            return Err(invalid("length is not a positive multiple of 4"));
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
        if words[0] != SPIRV_MAGIC {
            return Err(invalid("missing SPIR-V magic number"));
        }
        tracing::debug!(source = %id, %stage, words = words.len(), "registered precompiled shader");
        self.registry.insert(
            (id, stage),
            Registered {
                spirv: Arc::from(words),
                fingerprint: Fingerprint::of(bytes),
                last: None,
            },
        );
        Ok(())
    }

    /// Register every `<source>.<vert|frag>.spv` file under `dir`.
    ///
    /// `dir/shaders/scene.wgsl.vert.spv` registers source
    /// `shaders/scene.wgsl` for the vertex stage. Returns the number loaded.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, ShaderError> {
        let dir = dir.as_ref();
        let mut loaded = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let io_err = |e| ShaderError::Io {
                id: SourceId::new(current.to_string_lossy()),
                source: e,
            };
            for entry in std::fs::read_dir(&current).map_err(io_err)? {
                let path = entry.map_err(io_err)?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(dir) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                let Some(stem) = relative.strip_suffix(".spv") else {
                    continue;
                };
                let (source, stage) = if let Some(s) = stem.strip_suffix(".vert") {
                    (s, ShaderStage::Vertex)
                } else if let Some(s) = stem.strip_suffix(".frag") {
                    (s, ShaderStage::Fragment)
                } else {
                    continue;
                };
                let bytes = std::fs::read(&path).map_err(io_err)?;
                self.insert(source, stage, &bytes)?;
                loaded += 1;
            }
        }
        tracing::info!(dir = %dir.display(), loaded, "loaded precompiled shaders");
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl ShaderProvider for PrecompiledShaderProvider {
    fn resolve_shader(
        &mut self,
        request: &ShaderRequest,
        stage: ShaderStage,
    ) -> Result<Arc<ShaderArtifact>, ShaderError> {
        let entry = self
            .registry
            .get_mut(&(request.source.clone(), stage))
            .ok_or_else(|| ShaderError::NotFound {
                id: request.source.clone(),
                stage,
            })?;
        if let Some(last) = &entry.last {
            if last.entry_point == request.entry_point && last.resources == request.resources {
                return Ok(last.clone());
            }
        }
        // Counts cannot be reflected from opaque bytecode; the request is
        // authoritative.
        let artifact = Arc::new(ShaderArtifact {
            source: request.source.clone(),
            entry_point: request.entry_point.clone(),
            stage,
            fingerprint: entry.fingerprint,
            resources: request.resources,
            spirv: entry.spirv.clone(),
        });
        entry.last = Some(artifact.clone());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::compiler::{compile_wgsl, tests::TRIANGLE};

    fn vertex_bytes() -> Vec<u8> {
        let compiled = compile_wgsl(TRIANGLE, ShaderStage::Vertex, "vs_main").unwrap();
        bytemuck::cast_slice(&compiled.spirv).to_vec()
    }

    #[test]
    fn unknown_source_is_not_found() {
        let mut p = PrecompiledShaderProvider::new();
        let err = p
            .resolve_shader(&ShaderRequest::new("x.wgsl", "main"), ShaderStage::Vertex)
            .unwrap_err();
        assert!(matches!(err, ShaderError::NotFound { .. }));
    }

    #[test]
    fn registered_bytecode_resolves_without_compiling() {
        let mut p = PrecompiledShaderProvider::new();
        p.insert("tri.wgsl", ShaderStage::Vertex, &vertex_bytes()).unwrap();
        let req = ShaderRequest::new("./tri.wgsl", "vs_main");
        let a = p.resolve_shader(&req, ShaderStage::Vertex).unwrap();
        let b = p.resolve_shader(&req, ShaderStage::Vertex).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.spirv[0], SPIRV_MAGIC);
        // Only registered for the vertex stage.
        assert!(p.resolve_shader(&req, ShaderStage::Fragment).is_err());
    }

    #[test]
    fn rejects_non_spirv_bytes() {
        let mut p = PrecompiledShaderProvider::new();
        assert!(matches!(
            p.insert("a", ShaderStage::Vertex, b"not spirv!!!"),
            Err(ShaderError::InvalidBytecode { .. })
        ));
        assert!(p.insert("a", ShaderStage::Vertex, &[0x03, 0x02]).is_err());
        assert!(p.is_empty());
    }

    #[test]
    fn replacing_bytecode_changes_fingerprint() {
        let mut p = PrecompiledShaderProvider::new();
        let bytes = vertex_bytes();
        p.insert("tri.wgsl", ShaderStage::Vertex, &bytes).unwrap();
        let req = ShaderRequest::new("tri.wgsl", "vs_main");
        let a = p.resolve_shader(&req, ShaderStage::Vertex).unwrap();
        let mut edited = bytes.clone();
        edited.extend_from_slice(&[0, 0, 0, 0]);
        p.insert("tri.wgsl", ShaderStage::Vertex, &edited).unwrap();
        let b = p.resolve_shader(&req, ShaderStage::Vertex).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn load_dir_maps_file_names_to_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shaders")).unwrap();
        std::fs::write(dir.path().join("shaders/tri.wgsl.vert.spv"), vertex_bytes()).unwrap();
        std::fs::write(dir.path().join("shaders/readme.txt"), "skip me").unwrap();
        let mut p = PrecompiledShaderProvider::new();
        assert_eq!(p.load_dir(dir.path()).unwrap(), 1);
        assert!(p
            .resolve_shader(&ShaderRequest::new("shaders/tri.wgsl", "vs_main"), ShaderStage::Vertex)
            .is_ok());
    }
}
