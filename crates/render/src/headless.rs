//! GPU-less pipeline backend.
//!
//! Validates descriptors the way a real driver would reject them and
//! counts pipeline objects, so cache behaviour can be observed without a
//! device.

use crate::descriptor::{PipelineDescriptor, PipelineKey};
use crate::pipeline::{PipelineBackend, PipelineError};
use crate::shader::{Fingerprint, SPIRV_MAGIC, ShaderArtifact, ShaderStage};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stand-in for a native pipeline object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessPipeline {
    /// Unique per created object, never reused.
    pub id: u64,
    pub key: PipelineKey,
    pub vertex: Fingerprint,
    pub fragment: Fingerprint,
}

#[derive(Debug, Default)]
struct Counts {
    created: AtomicU64,
    released: AtomicU64,
}

/// Shared view of a backend's object counts, usable after the backend has
/// been moved into a cache.
#[derive(Debug, Clone, Default)]
pub struct BackendCounters(Arc<Counts>);

impl BackendCounters {
    pub fn created(&self) -> u64 {
        self.0.created.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.0.released.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> u64 {
        self.created() - self.released()
    }
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    counters: BackendCounters,
    next_id: u64,
    fail_next: Option<String>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> BackendCounters {
        self.counters.clone()
    }

    pub fn created(&self) -> u64 {
        self.counters.created()
    }

    pub fn released(&self) -> u64 {
        self.counters.released()
    }

    pub fn live(&self) -> u64 {
        self.counters.live()
    }

    /// Make the next `create_pipeline` call fail with `reason`.
    pub fn fail_creation(&mut self, reason: impl Into<String>) {
        self.fail_next = Some(reason.into());
    }
}

pub(crate) fn validate(
    descriptor: &PipelineDescriptor,
    vertex: &ShaderArtifact,
    fragment: &ShaderArtifact,
) -> Result<(), String> {
    if descriptor.color_targets.is_empty() {
        return Err("no color targets".into());
    }
    for (artifact, stage) in [(vertex, ShaderStage::Vertex), (fragment, ShaderStage::Fragment)] {
        if artifact.stage != stage {
            return Err(format!(
                "{} shader '{}' bound to the {stage} stage",
                artifact.stage, artifact.source
            ));
        }
        if artifact.spirv.first() != Some(&SPIRV_MAGIC) {
            return Err(format!("{stage} shader '{}' is not SPIR-V", artifact.source));
        }
    }

    let layout = &descriptor.vertex_layout;
    let mut slots = HashSet::new();
    for buffer in &layout.buffers {
        if !slots.insert(buffer.slot) {
            return Err(format!("vertex buffer slot {} declared twice", buffer.slot));
        }
    }
    let mut locations = HashSet::new();
    for attribute in &layout.attributes {
        if !locations.insert(attribute.location) {
            return Err(format!("vertex location {} bound twice", attribute.location));
        }
        let Some(buffer) = layout.buffers.iter().find(|b| b.slot == attribute.buffer_slot) else {
            return Err(format!(
                "location {} reads undeclared buffer slot {}",
                attribute.location, attribute.buffer_slot
            ));
        };
        let end = attribute.offset.checked_add(attribute.format.size());
        if end.is_none_or(|end| end > buffer.stride) {
            return Err(format!(
                "location {} overruns the {}-byte stride of slot {}",
                attribute.location, buffer.stride, buffer.slot
            ));
        }
    }

    let samples = descriptor.multisample.count;
    if !matches!(samples, 1 | 2 | 4 | 8) {
        return Err(format!("unsupported sample count {samples}"));
    }
    if let Some(depth) = &descriptor.depth_stencil {
        if depth.stencil_enabled && !depth.format.has_stencil() {
            return Err(format!("stencil enabled on stencil-less {:?}", depth.format));
        }
    }
    Ok(())
}

impl PipelineBackend for HeadlessBackend {
    type Pipeline = HeadlessPipeline;

    fn create_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        vertex: &ShaderArtifact,
        fragment: &ShaderArtifact,
    ) -> Result<HeadlessPipeline, PipelineError> {
        let reason = match self.fail_next.take() {
            Some(reason) => Err(reason),
            None => validate(descriptor, vertex, fragment),
        };
        if let Err(reason) = reason {
            return Err(PipelineError::ResourceCreation {
                label: descriptor.display_name(),
                reason,
            });
        }

        self.next_id += 1;
        self.counters.0.created.fetch_add(1, Ordering::Relaxed);
        Ok(HeadlessPipeline {
            id: self.next_id,
            key: descriptor.key(),
            vertex: vertex.fingerprint,
            fragment: fragment.fingerprint,
        })
    }

    fn release_pipeline(&mut self, pipeline: HeadlessPipeline) {
        tracing::trace!(id = pipeline.id, "headless pipeline released");
        self.counters.0.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::sample;
    use crate::descriptor::{DepthFormat, DepthStencilState, VertexAttribute, VertexFormat};
    use crate::shader::{ResourceCounts, SourceId};

    fn artifact(stage: ShaderStage) -> ShaderArtifact {
        ShaderArtifact {
            source: SourceId::new("s.wgsl"),
            entry_point: "main".into(),
            stage,
            fingerprint: Fingerprint(7),
            resources: ResourceCounts::default(),
            spirv: Arc::from(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]),
        }
    }

    fn check(descriptor: &PipelineDescriptor) -> Result<(), String> {
        validate(descriptor, &artifact(ShaderStage::Vertex), &artifact(ShaderStage::Fragment))
    }

    #[test]
    fn sample_descriptor_is_valid() {
        assert_eq!(check(&sample()), Ok(()));
    }

    #[test]
    fn rejects_undeclared_buffer_and_duplicate_location() {
        let mut d = sample();
        d.vertex_layout.attributes.push(VertexAttribute {
            location: 2,
            buffer_slot: 3,
            format: VertexFormat::Float32x2,
            offset: 0,
        });
        assert!(check(&d).unwrap_err().contains("undeclared buffer slot 3"));

        let mut d = sample();
        d.vertex_layout.attributes[1].location = 0;
        assert!(check(&d).unwrap_err().contains("bound twice"));
    }

    #[test]
    fn rejects_stride_overrun_and_bad_sample_count() {
        let mut d = sample();
        d.vertex_layout.attributes[1].offset = 16;
        assert!(check(&d).unwrap_err().contains("overruns"));

        let mut d = sample();
        d.multisample.count = 3;
        assert!(check(&d).unwrap_err().contains("sample count 3"));
    }

    #[test]
    fn huge_attribute_offset_is_rejected_not_overflowed() {
        let mut d = sample();
        d.vertex_layout.attributes[1].offset = u64::MAX - 2;
        assert!(check(&d).unwrap_err().contains("overruns"));

        let mut backend = HeadlessBackend::new();
        let vs = artifact(ShaderStage::Vertex);
        let fs = artifact(ShaderStage::Fragment);
        let err = backend.create_pipeline(&d, &vs, &fs).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceCreation { .. }));
        assert_eq!(backend.created(), 0);
    }

    #[test]
    fn rejects_stencil_without_stencil_format() {
        let mut d = sample();
        let mut depth = DepthStencilState::depth(DepthFormat::Depth32Float);
        depth.stencil_enabled = true;
        d.depth_stencil = Some(depth);
        assert!(check(&d).is_err());
    }

    #[test]
    fn rejects_swapped_stages() {
        let err = validate(
            &sample(),
            &artifact(ShaderStage::Fragment),
            &artifact(ShaderStage::Fragment),
        )
        .unwrap_err();
        assert!(err.contains("vertex stage"));
    }

    #[test]
    fn forced_failure_applies_once() {
        let mut backend = HeadlessBackend::new();
        backend.fail_creation("device lost");
        let vs = artifact(ShaderStage::Vertex);
        let fs = artifact(ShaderStage::Fragment);
        let err = backend.create_pipeline(&sample(), &vs, &fs).unwrap_err();
        assert!(err.to_string().contains("device lost"));
        let p = backend.create_pipeline(&sample(), &vs, &fs).unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(backend.created(), 1);
        backend.release_pipeline(p);
        assert_eq!(backend.live(), 0);
    }
}
