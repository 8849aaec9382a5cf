//! On-demand WGSL compilation with fingerprint-keyed caching.
//!
//! # Invariants
//! - An unchanged composed source is never compiled twice.
//! - A call whose dependency revisions are unchanged does not read sources.
//! - A broken source is compiled once per distinct content; later calls
//!   return the recorded diagnostic.

use super::compiler::{compile_wgsl, compose};
use super::{
    ArtifactKey, ArtifactStore, Fingerprint, ShaderArtifact, ShaderError, ShaderProvider,
    ShaderRequest, ShaderSource, ShaderStage, SourceId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Counters for compile activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// naga compilations run, successful or not.
    pub compiles: u64,
    /// Requests served from the in-process cache.
    pub cache_hits: u64,
    /// Requests served from the artifact store without compiling.
    pub store_hits: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    source: SourceId,
    entry_point: String,
    stage: ShaderStage,
}

struct Cached {
    artifact: Arc<ShaderArtifact>,
    dependencies: Vec<(SourceId, u64)>,
}

struct Failed {
    fingerprint: Fingerprint,
    dependencies: Vec<(SourceId, u64)>,
    diagnostic: String,
}

pub struct CompilingShaderProvider {
    source: Box<dyn ShaderSource>,
    store: Option<Box<dyn ArtifactStore>>,
    cache: HashMap<RequestKey, Cached>,
    failures: HashMap<RequestKey, Failed>,
    stats: CompileStats,
}

impl CompilingShaderProvider {
    pub fn new(source: impl ShaderSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            store: None,
            cache: HashMap::new(),
            failures: HashMap::new(),
            stats: CompileStats::default(),
        }
    }

    /// Persist compiled artifacts and consult them before compiling.
    pub fn with_store(mut self, store: impl ArtifactStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    fn unchanged(&self, dependencies: &[(SourceId, u64)]) -> bool {
        dependencies
            .iter()
            .all(|(id, rev)| self.source.revision(id).ok() == Some(*rev))
    }

    fn load_stored(&mut self, key: &ArtifactKey) -> Option<ShaderArtifact> {
        let store = self.store.as_mut()?;
        match store.load(key) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(source = %key.source, %err, "ignoring unreadable stored artifact");
                None
            }
        }
    }

    fn save_stored(&mut self, artifact: &ShaderArtifact) {
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.save(artifact) {
                tracing::warn!(source = %artifact.source, %err, "failed to store shader artifact");
            }
        }
    }
}

impl ShaderProvider for CompilingShaderProvider {
    fn resolve_shader(
        &mut self,
        request: &ShaderRequest,
        stage: ShaderStage,
    ) -> Result<Arc<ShaderArtifact>, ShaderError> {
        let key = RequestKey {
            source: request.source.clone(),
            entry_point: request.entry_point.clone(),
            stage,
        };
        let compile_error = |diagnostic: String| ShaderError::Compile {
            id: request.source.clone(),
            stage,
            diagnostic,
        };

        if let Some(cached) = self.cache.get(&key) {
            if self.unchanged(&cached.dependencies) {
                self.stats.cache_hits += 1;
                return Ok(cached.artifact.clone());
            }
        }
        if let Some(failed) = self.failures.get(&key) {
            if self.unchanged(&failed.dependencies) {
                return Err(compile_error(failed.diagnostic.clone()));
            }
        }

        let composed = compose(self.source.as_ref(), &request.source, stage)?;

        // Touched but identical content.
        if let Some(cached) = self.cache.get_mut(&key) {
            if cached.artifact.fingerprint == composed.fingerprint {
                cached.dependencies = composed.dependencies;
                self.stats.cache_hits += 1;
                return Ok(cached.artifact.clone());
            }
        }
        if let Some(failed) = self.failures.get_mut(&key) {
            if failed.fingerprint == composed.fingerprint {
                failed.dependencies = composed.dependencies;
                return Err(compile_error(failed.diagnostic.clone()));
            }
        }

        let store_key = ArtifactKey {
            source: request.source.clone(),
            entry_point: request.entry_point.clone(),
            stage,
            fingerprint: composed.fingerprint,
        };
        let artifact = match self.load_stored(&store_key) {
            Some(artifact) => {
                self.stats.store_hits += 1;
                artifact
            }
            None => {
                let _span = tracing::info_span!(
                    "compile_shader",
                    source = %request.source,
                    entry = %request.entry_point,
                    %stage,
                )
                .entered();
                self.stats.compiles += 1;
                match compile_wgsl(&composed.text, stage, &request.entry_point) {
                    Ok(compiled) => {
                        let artifact = ShaderArtifact {
                            source: request.source.clone(),
                            entry_point: request.entry_point.clone(),
                            stage,
                            fingerprint: composed.fingerprint,
                            resources: compiled.resources,
                            spirv: Arc::from(compiled.spirv),
                        };
                        tracing::info!(
                            fingerprint = %artifact.fingerprint,
                            words = artifact.spirv.len(),
                            "shader compiled"
                        );
                        self.save_stored(&artifact);
                        artifact
                    }
                    Err(diagnostic) => {
                        self.stats.failures += 1;
                        tracing::debug!(fingerprint = %composed.fingerprint, "shader compile failed");
                        self.cache.remove(&key);
                        self.failures.insert(
                            key,
                            Failed {
                                fingerprint: composed.fingerprint,
                                dependencies: composed.dependencies,
                                diagnostic: diagnostic.clone(),
                            },
                        );
                        return Err(compile_error(diagnostic));
                    }
                }
            }
        };

        if !request.resources.is_empty() && request.resources != artifact.resources {
            tracing::warn!(
                source = %request.source,
                declared = %request.resources,
                reflected = %artifact.resources,
                "declared resource counts differ from shader"
            );
        }

        let artifact = Arc::new(artifact);
        self.failures.remove(&key);
        self.cache.insert(
            key,
            Cached {
                artifact: artifact.clone(),
                dependencies: composed.dependencies,
            },
        );
        Ok(artifact)
    }
}
