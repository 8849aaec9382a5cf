//! Descriptor-deduplicating graphics pipeline cache.
//!
//! # Invariants
//! - At most one entry per canonical descriptor.
//! - A cache hit never consults the shader provider or the backend.
//! - A failed build stores nothing.
//! - A handle stays valid until [`PipelineCache::invalidate`] or teardown;
//!   hot-reload rebuilds keep the handle.
//! - Every backend pipeline is released exactly once.

use crate::descriptor::{PipelineDescriptor, PipelineKey};
use crate::shader::{Fingerprint, ShaderArtifact, ShaderError, ShaderProvider, ShaderStage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Creates and destroys native pipeline objects.
pub trait PipelineBackend {
    type Pipeline;

    fn create_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        vertex: &ShaderArtifact,
        fragment: &ShaderArtifact,
    ) -> Result<Self::Pipeline, PipelineError>;

    fn release_pipeline(&mut self, pipeline: Self::Pipeline);
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("failed to create pipeline '{label}': {reason}")]
    ResourceCreation { label: String, reason: String },
    #[error("pipeline cache has been torn down")]
    TornDown,
}

/// Opaque handle to a cached pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineHandle(u32);

impl PipelineHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineCacheConfig {
    /// Re-resolve shaders in `end_frame` and rebuild changed pipelines.
    pub hot_reload: bool,
    /// Frames between reload checks; 0 is treated as 1.
    pub reload_interval_frames: u32,
}

impl Default for PipelineCacheConfig {
    fn default() -> Self {
        Self {
            hot_reload: true,
            reload_interval_frames: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub builds: u64,
    pub hits: u64,
    pub rebuilds: u64,
    pub failed_rebuilds: u64,
    pub released: u64,
}

/// What one `end_frame` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    /// Entries whose shaders were re-resolved.
    pub checked: usize,
    pub rebuilt: usize,
    pub failed: usize,
}

/// Read-only view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInfo {
    pub key: PipelineKey,
    pub label: String,
    pub vertex_fingerprint: Fingerprint,
    pub fragment_fingerprint: Fingerprint,
    /// Diagnostic of the most recent failed rebuild, cleared once sources
    /// build again.
    pub last_error: Option<String>,
}

struct Entry<T> {
    /// Canonical descriptor carrying the display label.
    descriptor: PipelineDescriptor,
    key: PipelineKey,
    label: String,
    pipeline: T,
    vertex: Arc<ShaderArtifact>,
    fragment: Arc<ShaderArtifact>,
    last_error: Option<String>,
}

pub struct PipelineCache<B: PipelineBackend, P: ShaderProvider> {
    backend: B,
    provider: P,
    config: PipelineCacheConfig,
    by_descriptor: HashMap<PipelineDescriptor, PipelineHandle>,
    entries: BTreeMap<PipelineHandle, Entry<B::Pipeline>>,
    next_handle: u32,
    frame: u64,
    stats: CacheStats,
    torn_down: bool,
}

impl<B: PipelineBackend, P: ShaderProvider> PipelineCache<B, P> {
    pub fn new(backend: B, provider: P, config: PipelineCacheConfig) -> Self {
        Self {
            backend,
            provider,
            config,
            by_descriptor: HashMap::new(),
            entries: BTreeMap::new(),
            next_handle: 0,
            frame: 0,
            stats: CacheStats::default(),
            torn_down: false,
        }
    }

    /// Return the pipeline for `descriptor`, building it on first request.
    pub fn get_or_create_graphics_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
    ) -> Result<PipelineHandle, PipelineError> {
        if self.torn_down {
            return Err(PipelineError::TornDown);
        }
        let canonical = descriptor.canonical();
        if let Some(&handle) = self.by_descriptor.get(&canonical) {
            self.stats.hits += 1;
            tracing::debug!(%handle, "pipeline cache hit");
            return Ok(handle);
        }

        let label = descriptor.display_name();
        let key = canonical.key();
        let _span = tracing::info_span!("build_pipeline", %label, %key).entered();
        let vertex = self
            .provider
            .resolve_shader(&canonical.vertex_shader, ShaderStage::Vertex)?;
        let fragment = self
            .provider
            .resolve_shader(&canonical.fragment_shader, ShaderStage::Fragment)?;
        let mut build = canonical.clone();
        build.label.clone_from(&label);
        let pipeline = self.backend.create_pipeline(&build, &vertex, &fragment)?;

        let handle = PipelineHandle(self.next_handle);
        self.next_handle += 1;
        self.stats.builds += 1;
        tracing::info!(%handle, "pipeline built");
        self.by_descriptor.insert(canonical, handle);
        self.entries.insert(
            handle,
            Entry {
                descriptor: build,
                key,
                label,
                pipeline,
                vertex,
                fragment,
                last_error: None,
            },
        );
        Ok(handle)
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> Option<&B::Pipeline> {
        self.entries.get(&handle).map(|e| &e.pipeline)
    }

    pub fn info(&self, handle: PipelineHandle) -> Option<PipelineInfo> {
        self.entries.get(&handle).map(|e| PipelineInfo {
            key: e.key,
            label: e.label.clone(),
            vertex_fingerprint: e.vertex.fingerprint,
            fragment_fingerprint: e.fragment.fingerprint,
            last_error: e.last_error.clone(),
        })
    }

    /// Drop one entry and release its pipeline. The next request for the
    /// same descriptor builds a fresh pipeline under a new handle.
    pub fn invalidate(&mut self, handle: PipelineHandle) -> bool {
        let Some(entry) = self.entries.remove(&handle) else {
            return false;
        };
        self.by_descriptor.remove(&entry.descriptor.canonical());
        self.backend.release_pipeline(entry.pipeline);
        self.stats.released += 1;
        tracing::debug!(%handle, label = %entry.label, "pipeline invalidated");
        true
    }

    /// Reconcile the cache with shader sources. Call after every draw
    /// referencing this frame's pipelines has been submitted.
    pub fn end_frame(&mut self) -> FrameReport {
        self.frame += 1;
        let mut report = FrameReport {
            frame: self.frame,
            ..FrameReport::default()
        };
        let interval = u64::from(self.config.reload_interval_frames.max(1));
        if self.torn_down || !self.config.hot_reload || self.frame % interval != 0 {
            return report;
        }

        for (&handle, entry) in self.entries.iter_mut() {
            report.checked += 1;
            let resolved = self
                .provider
                .resolve_shader(&entry.descriptor.vertex_shader, ShaderStage::Vertex)
                .and_then(|vs| {
                    let fs = self
                        .provider
                        .resolve_shader(&entry.descriptor.fragment_shader, ShaderStage::Fragment)?;
                    Ok((vs, fs))
                });
            let rebuilt = resolved.map_err(PipelineError::from).and_then(|(vs, fs)| {
                if vs.fingerprint == entry.vertex.fingerprint
                    && fs.fingerprint == entry.fragment.fingerprint
                {
                    return Ok(None);
                }
                let _span = tracing::info_span!("rebuild_pipeline", %handle, label = %entry.label)
                    .entered();
                let pipeline = self.backend.create_pipeline(&entry.descriptor, &vs, &fs)?;
                Ok(Some((pipeline, vs, fs)))
            });

            match rebuilt {
                Ok(None) => {
                    if entry.last_error.take().is_some() {
                        tracing::info!(%handle, "shader sources restored");
                    }
                }
                Ok(Some((pipeline, vs, fs))) => {
                    let old = std::mem::replace(&mut entry.pipeline, pipeline);
                    self.backend.release_pipeline(old);
                    entry.vertex = vs;
                    entry.fragment = fs;
                    entry.last_error = None;
                    self.stats.rebuilds += 1;
                    self.stats.released += 1;
                    report.rebuilt += 1;
                    tracing::info!(%handle, label = %entry.label, "pipeline rebuilt");
                }
                Err(err) => {
                    let message = err.to_string();
                    if entry.last_error.as_deref() != Some(message.as_str()) {
                        tracing::warn!(%handle, label = %entry.label, error = %message, "pipeline rebuild failed; keeping previous pipeline");
                        self.stats.failed_rebuilds += 1;
                    }
                    entry.last_error = Some(message);
                    report.failed += 1;
                }
            }
        }
        if report.rebuilt > 0 || report.failed > 0 {
            tracing::debug!(frame = report.frame, rebuilt = report.rebuilt, failed = report.failed, "end of frame");
        }
        report
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = PipelineHandle> + '_ {
        self.entries.keys().copied()
    }

    pub fn config(&self) -> PipelineCacheConfig {
        self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Release every cached pipeline. Later requests fail with `TornDown`.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let count = self.entries.len();
        self.by_descriptor.clear();
        for (_, entry) in std::mem::take(&mut self.entries) {
            self.backend.release_pipeline(entry.pipeline);
            self.stats.released += 1;
        }
        tracing::info!(released = count, builds = self.stats.builds, "pipeline cache torn down");
    }
}

impl<B: PipelineBackend, P: ShaderProvider> Drop for PipelineCache<B, P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::sample;
    use crate::descriptor::CullMode;
    use crate::headless::{HeadlessBackend, HeadlessPipeline};
    use crate::shader::compiler::tests::TRIANGLE;
    use crate::shader::{
        CompilingShaderProvider, MemorySource, PrecompiledShaderProvider, SPIRV_MAGIC,
        ShaderRequest,
    };

    fn descriptor() -> PipelineDescriptor {
        let mut d = sample();
        d.vertex_shader = ShaderRequest::new("tri.wgsl", "vs_main");
        d.fragment_shader = ShaderRequest::new("tri.wgsl", "fs_main");
        d
    }

    fn cache(src: &MemorySource) -> PipelineCache<HeadlessBackend, CompilingShaderProvider> {
        PipelineCache::new(
            HeadlessBackend::new(),
            CompilingShaderProvider::new(src.clone()),
            PipelineCacheConfig::default(),
        )
    }

    #[test]
    fn identical_descriptor_returns_same_handle_and_compiles_once() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let p1 = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let compiles = cache.provider().stats().compiles;
        let p2 = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(cache.stats().builds, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.provider().stats().compiles, compiles);
        assert_eq!(cache.backend().created(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cull_mode_flip_yields_distinct_handle() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let p1 = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let mut flipped = descriptor();
        flipped.rasterizer.cull_mode = CullMode::Front;
        let p3 = cache.get_or_create_graphics_pipeline(&flipped).unwrap();
        assert_ne!(p1, p3);
        assert_eq!(cache.len(), 2);
        // Shaders were already compiled for the first pipeline.
        assert_eq!(cache.provider().stats().compiles, 2);
    }

    #[test]
    fn relabeled_descriptor_is_a_hit() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let a = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let b = cache
            .get_or_create_graphics_pipeline(&descriptor().with_label("renamed"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.info(a).unwrap().label, "scene");
    }

    #[test]
    fn replaced_precompiled_bytecode_rebuilds_at_end_of_frame() {
        let module = |marker: u32| -> Vec<u8> {
            bytemuck::cast_slice(&[SPIRV_MAGIC, 0x0001_0000, 0, marker, 0]).to_vec()
        };
        let mut provider = PrecompiledShaderProvider::new();
        provider.insert("tri.wgsl", ShaderStage::Vertex, &module(1)).unwrap();
        provider.insert("tri.wgsl", ShaderStage::Fragment, &module(1)).unwrap();
        let mut cache = PipelineCache::new(
            HeadlessBackend::new(),
            provider,
            PipelineCacheConfig::default(),
        );
        let handle = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let first = cache.pipeline(handle).unwrap().id;
        assert_eq!(cache.end_frame().rebuilt, 0);

        cache
            .provider_mut()
            .insert("tri.wgsl", ShaderStage::Fragment, &module(2))
            .unwrap();
        let report = cache.end_frame();
        assert_eq!(report.rebuilt, 1);
        assert_eq!(report.failed, 0);
        assert_ne!(cache.pipeline(handle).unwrap().id, first);
        assert_eq!(cache.backend().released(), 1);
        assert_eq!(cache.stats().rebuilds, 1);

        // Settled again.
        assert_eq!(cache.end_frame().rebuilt, 0);
    }

    #[test]
    fn compile_failure_stores_nothing() {
        let src = MemorySource::new().with("tri.wgsl", "fn vs_main( {");
        let mut cache = cache(&src);
        let err = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap_err();
        match err {
            PipelineError::Shader(ShaderError::Compile { id, diagnostic, .. }) => {
                assert_eq!(id.as_str(), "tri.wgsl");
                assert!(!diagnostic.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.is_empty());
        assert_eq!(cache.backend().created(), 0);

        src.set("tri.wgsl", TRIANGLE);
        assert!(cache.get_or_create_graphics_pipeline(&descriptor()).is_ok());
    }

    #[test]
    fn backend_failure_is_resource_creation_and_leaves_other_entries() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let good = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let mut bad = descriptor();
        bad.color_targets.clear();
        let err = cache.get_or_create_graphics_pipeline(&bad).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceCreation { .. }));
        assert_eq!(cache.len(), 1);
        assert!(cache.pipeline(good).is_some());
    }

    #[test]
    fn end_frame_leaves_unchanged_entries_alone() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let h = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let before: HeadlessPipeline = cache.pipeline(h).unwrap().clone();
        for _ in 0..3 {
            let report = cache.end_frame();
            assert_eq!(report.checked, 1);
            assert_eq!(report.rebuilt, 0);
        }
        assert_eq!(cache.pipeline(h), Some(&before));
        assert_eq!(cache.backend().created(), 1);
        assert_eq!(cache.provider().stats().compiles, 2);
    }

    #[test]
    fn edited_source_rebuilds_under_same_handle() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let h = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let old = cache.info(h).unwrap();

        src.set("tri.wgsl", format!("{TRIANGLE}\n// tweak\n"));
        let report = cache.end_frame();
        assert_eq!(report.rebuilt, 1);
        let new = cache.info(h).unwrap();
        assert_ne!(old.vertex_fingerprint, new.vertex_fingerprint);
        assert_eq!(cache.backend().created(), 2);
        assert_eq!(cache.backend().released(), 1);
        assert_eq!(cache.stats().rebuilds, 1);
        // Still a hit for the original descriptor.
        assert_eq!(cache.get_or_create_graphics_pipeline(&descriptor()).unwrap(), h);
    }

    #[test]
    fn failed_rebuild_keeps_previous_pipeline() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let h = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let before = cache.pipeline(h).unwrap().clone();

        src.set("tri.wgsl", "broken");
        let report = cache.end_frame();
        assert_eq!(report.failed, 1);
        assert_eq!(cache.pipeline(h), Some(&before));
        assert!(cache.info(h).unwrap().last_error.is_some());
        cache.end_frame();
        assert_eq!(cache.stats().failed_rebuilds, 1);

        src.set("tri.wgsl", TRIANGLE);
        let report = cache.end_frame();
        assert_eq!(report.failed, 0);
        assert!(cache.info(h).unwrap().last_error.is_none());
    }

    #[test]
    fn reload_respects_interval_and_switch() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = PipelineCache::new(
            HeadlessBackend::new(),
            CompilingShaderProvider::new(src.clone()),
            PipelineCacheConfig {
                hot_reload: true,
                reload_interval_frames: 3,
            },
        );
        cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let checked: Vec<usize> = (0..6).map(|_| cache.end_frame().checked).collect();
        assert_eq!(checked, vec![0, 0, 1, 0, 0, 1]);

        let mut off = PipelineCache::new(
            HeadlessBackend::new(),
            CompilingShaderProvider::new(src.clone()),
            PipelineCacheConfig {
                hot_reload: false,
                reload_interval_frames: 1,
            },
        );
        off.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        src.set("tri.wgsl", format!("{TRIANGLE}\n"));
        assert_eq!(off.end_frame().rebuilt, 0);
    }

    #[test]
    fn invalidate_releases_and_forgets() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        let h = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        assert!(cache.invalidate(h));
        assert!(!cache.invalidate(h));
        assert!(cache.pipeline(h).is_none());
        assert_eq!(cache.backend().released(), 1);
        let again = cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        assert_ne!(again, h);
    }

    #[test]
    fn teardown_releases_each_pipeline_once() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let mut cache = cache(&src);
        cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        let mut other = descriptor();
        other.rasterizer.cull_mode = CullMode::None;
        cache.get_or_create_graphics_pipeline(&other).unwrap();

        cache.teardown();
        cache.teardown();
        assert_eq!(cache.backend().released(), 2);
        assert_eq!(cache.backend().live(), 0);
        assert!(matches!(
            cache.get_or_create_graphics_pipeline(&descriptor()),
            Err(PipelineError::TornDown)
        ));
        assert_eq!(cache.end_frame().checked, 0);
    }

    #[test]
    fn drop_tears_down() {
        let src = MemorySource::new().with("tri.wgsl", TRIANGLE);
        let backend = HeadlessBackend::new();
        let counters = backend.counters();
        {
            let mut cache = PipelineCache::new(
                backend,
                CompilingShaderProvider::new(src.clone()),
                PipelineCacheConfig::default(),
            );
            cache.get_or_create_graphics_pipeline(&descriptor()).unwrap();
        }
        assert_eq!(counters.released(), 1);
    }
}
