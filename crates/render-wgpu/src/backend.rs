use crate::conversions::{color_target, depth_stencil, multisample, primitive_state, step_mode, vertex_format};
use playground_render::descriptor::{PipelineDescriptor, VertexLayout};
use playground_render::pipeline::{PipelineBackend, PipelineError};
use playground_render::shader::ShaderArtifact;
use std::borrow::Cow;
use std::sync::Arc;

/// Builds `wgpu::RenderPipeline`s from SPIR-V artifacts.
///
/// Pipelines use an automatic layout derived from the shaders; bind group
/// layouts come from `RenderPipeline::get_bind_group_layout`.
pub struct WgpuPipelineBackend {
    device: Arc<wgpu::Device>,
    created: u64,
    released: u64,
}

impl WgpuPipelineBackend {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            created: 0,
            released: 0,
        }
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    fn shader_module(&self, artifact: &ShaderArtifact) -> wgpu::ShaderModule {
        let label = format!("{}:{}", artifact.source, artifact.entry_point);
        self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::SpirV(Cow::Borrowed(&artifact.spirv)),
        })
    }
}

/// wgpu addresses vertex buffers by position, so declared slots must be
/// exactly `0..n` once sorted.
pub(crate) fn vertex_attributes(layout: &VertexLayout) -> Result<Vec<Vec<wgpu::VertexAttribute>>, String> {
    let mut slots: Vec<u32> = layout.buffers.iter().map(|b| b.slot).collect();
    slots.sort_unstable();
    if slots.iter().enumerate().any(|(i, &slot)| slot != i as u32) {
        return Err(format!("vertex buffer slots {slots:?} are not contiguous from 0"));
    }
    let mut per_buffer = vec![Vec::new(); slots.len()];
    for attribute in &layout.attributes {
        let Some(attributes) = per_buffer.get_mut(attribute.buffer_slot as usize) else {
            return Err(format!(
                "location {} reads undeclared buffer slot {}",
                attribute.location, attribute.buffer_slot
            ));
        };
        attributes.push(wgpu::VertexAttribute {
            format: vertex_format(attribute.format),
            offset: attribute.offset,
            shader_location: attribute.location,
        });
    }
    Ok(per_buffer)
}

impl PipelineBackend for WgpuPipelineBackend {
    type Pipeline = wgpu::RenderPipeline;

    fn create_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        vertex: &ShaderArtifact,
        fragment: &ShaderArtifact,
    ) -> Result<wgpu::RenderPipeline, PipelineError> {
        let label = descriptor.display_name();
        let failed = |reason: String| PipelineError::ResourceCreation {
            label: label.clone(),
            reason,
        };

        let attributes = vertex_attributes(&descriptor.vertex_layout).map_err(failed)?;
        let mut buffers = descriptor.vertex_layout.buffers.clone();
        buffers.sort_by_key(|b| b.slot);
        let buffer_layouts: Vec<wgpu::VertexBufferLayout<'_>> = buffers
            .iter()
            .zip(&attributes)
            .map(|(buffer, attributes)| wgpu::VertexBufferLayout {
                array_stride: buffer.stride,
                step_mode: step_mode(buffer.step_mode),
                attributes,
            })
            .collect();
        let targets: Vec<Option<wgpu::ColorTargetState>> = descriptor
            .color_targets
            .iter()
            .map(|t| Some(color_target(t)))
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vs_module = self.shader_module(vertex);
        let fs_module = self.shader_module(fragment);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: None,
            vertex: wgpu::VertexState {
                module: &vs_module,
                entry_point: Some(&vertex.entry_point),
                compilation_options: Default::default(),
                buffers: &buffer_layouts,
            },
            fragment: Some(wgpu::FragmentState {
                module: &fs_module,
                entry_point: Some(&fragment.entry_point),
                compilation_options: Default::default(),
                targets: &targets,
            }),
            primitive: primitive_state(descriptor.primitive, &descriptor.rasterizer),
            depth_stencil: descriptor.depth_stencil.as_ref().map(depth_stencil),
            multisample: multisample(&descriptor.multisample),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(failed(err.to_string()));
        }

        self.created += 1;
        tracing::debug!(%label, "wgpu render pipeline created");
        Ok(pipeline)
    }

    fn release_pipeline(&mut self, pipeline: wgpu::RenderPipeline) {
        drop(pipeline);
        self.released += 1;
    }
}
