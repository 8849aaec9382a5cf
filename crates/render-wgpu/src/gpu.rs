use crate::conversions::{color_format, depth_format};
use crate::shaders::{COLOR_FORMAT, DEPTH_FORMAT};
use bytemuck::{Pod, Zeroable};
use playground_common::MeshHandle;
use playground_render::{DrawItem, MeshInfo, MeshTable};
use std::io::Write as _;
use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;
use wgpu::util::DeviceExt;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error("failed to open GPU device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("frame readback failed: {0}")]
    Readback(String),
    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),
}

/// Device and queue for offscreen work.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Open any adapter; no surface is needed.
    pub fn headless() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(GpuError::NoAdapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("playground_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: Default::default(),
            },
            None,
        ))?;
        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "GPU device opened");
        Ok(Self {
            device: Arc::new(device),
            queue,
            adapter: info,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DrawUniforms {
    mvp: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
    color: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
}

/// Unit cube, 24 vertices with per-face normals.
fn cube_mesh() -> (Vec<Vertex>, Vec<u16>) {
    let p = 0.5_f32;
    #[rustfmt::skip]
    let vertices = vec![
        // +Z face
        Vertex { position: [-p, -p,  p], normal: [0.0, 0.0, 1.0] },
        Vertex { position: [ p, -p,  p], normal: [0.0, 0.0, 1.0] },
        Vertex { position: [ p,  p,  p], normal: [0.0, 0.0, 1.0] },
        Vertex { position: [-p,  p,  p], normal: [0.0, 0.0, 1.0] },
        // -Z face
        Vertex { position: [ p, -p, -p], normal: [0.0, 0.0, -1.0] },
        Vertex { position: [-p, -p, -p], normal: [0.0, 0.0, -1.0] },
        Vertex { position: [-p,  p, -p], normal: [0.0, 0.0, -1.0] },
        Vertex { position: [ p,  p, -p], normal: [0.0, 0.0, -1.0] },
        // +X face
        Vertex { position: [ p, -p,  p], normal: [1.0, 0.0, 0.0] },
        Vertex { position: [ p, -p, -p], normal: [1.0, 0.0, 0.0] },
        Vertex { position: [ p,  p, -p], normal: [1.0, 0.0, 0.0] },
        Vertex { position: [ p,  p,  p], normal: [1.0, 0.0, 0.0] },
        // -X face
        Vertex { position: [-p, -p, -p], normal: [-1.0, 0.0, 0.0] },
        Vertex { position: [-p, -p,  p], normal: [-1.0, 0.0, 0.0] },
        Vertex { position: [-p,  p,  p], normal: [-1.0, 0.0, 0.0] },
        Vertex { position: [-p,  p, -p], normal: [-1.0, 0.0, 0.0] },
        // +Y face
        Vertex { position: [-p,  p,  p], normal: [0.0, 1.0, 0.0] },
        Vertex { position: [ p,  p,  p], normal: [0.0, 1.0, 0.0] },
        Vertex { position: [ p,  p, -p], normal: [0.0, 1.0, 0.0] },
        Vertex { position: [-p,  p, -p], normal: [0.0, 1.0, 0.0] },
        // -Y face
        Vertex { position: [-p, -p, -p], normal: [0.0, -1.0, 0.0] },
        Vertex { position: [ p, -p, -p], normal: [0.0, -1.0, 0.0] },
        Vertex { position: [ p, -p,  p], normal: [0.0, -1.0, 0.0] },
        Vertex { position: [-p, -p,  p], normal: [0.0, -1.0, 0.0] },
    ];
    #[rustfmt::skip]
    let indices: Vec<u16> = vec![
        0,1,2, 2,3,0,       // +Z
        4,5,6, 6,7,4,       // -Z
        8,9,10, 10,11,8,    // +X
        12,13,14, 14,15,12, // -X
        16,17,18, 18,19,16, // +Y
        20,21,22, 22,23,20, // -Y
    ];
    (vertices, indices)
}

/// Unit square in the XZ plane facing +Y.
fn plane_mesh() -> (Vec<Vertex>, Vec<u16>) {
    let p = 0.5_f32;
    let n = [0.0, 1.0, 0.0];
    let vertices = vec![
        Vertex { position: [-p, 0.0, p], normal: n },
        Vertex { position: [p, 0.0, p], normal: n },
        Vertex { position: [p, 0.0, -p], normal: n },
        Vertex { position: [-p, 0.0, -p], normal: n },
    ];
    (vertices, vec![0, 1, 2, 2, 3, 0])
}

/// Concatenate meshes into shared buffers and name them.
fn build_geometry() -> (Vec<Vertex>, Vec<u16>, MeshTable) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let mut table = MeshTable::new();
    for (name, (v, i)) in [("cube", cube_mesh()), ("plane", plane_mesh())] {
        table.insert(
            name,
            MeshInfo {
                index_count: i.len() as u32,
                first_index: indices.len() as u32,
                base_vertex: vertices.len() as i32,
            },
        );
        vertices.extend(v);
        indices.extend(i);
    }
    // Keep the index buffer size a multiple of 4 bytes.
    if indices.len() % 2 == 1 {
        indices.push(0);
    }
    (vertices, indices, table)
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Per-entity tint so neighbouring draws are distinguishable.
fn palette(slot: u32) -> [f32; 4] {
    const COLORS: [[f32; 4]; 4] = [
        [0.2, 0.6, 1.0, 1.0],
        [1.0, 0.8, 0.0, 1.0],
        [0.4, 0.9, 0.4, 1.0],
        [0.9, 0.3, 0.3, 1.0],
    ];
    COLORS[slot as usize % COLORS.len()]
}

fn linear_to_srgb(c: f64) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let s = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (s * 255.0).round() as u8
}

/// Read-back RGBA8 pixels of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl FrameImage {
    /// Pixels whose color differs from `clear` by more than rounding.
    pub fn covered_pixels(&self, clear: [u8; 4]) -> u64 {
        self.rgba
            .chunks_exact(4)
            .filter(|px| px.iter().zip(clear).take(3).any(|(&a, b)| a.abs_diff(b) > 2))
            .count() as u64
    }

    /// Binary PPM (P6), alpha dropped.
    pub fn encode_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        for px in self.rgba.chunks_exact(4) {
            out.extend_from_slice(&px[..3]);
        }
        out
    }

    pub fn write_ppm(&self, path: &Path) -> Result<(), GpuError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.encode_ppm())?;
        Ok(())
    }
}

/// Counters for one rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draws: usize,
    /// Draw items naming a mesh this renderer does not know.
    pub skipped: usize,
}

/// Offscreen renderer issuing one indexed draw per draw item.
pub struct SceneRenderer {
    device: Arc<wgpu::Device>,
    width: u32,
    height: u32,
    color: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    meshes: MeshTable,
    uniform_buffer: wgpu::Buffer,
    uniform_stride: u64,
    uniform_capacity: u64,
    clear_color: wgpu::Color,
}

impl SceneRenderer {
    pub fn new(device: Arc<wgpu::Device>, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let (vertices, indices, meshes) = build_geometry();
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scene_vertex_buffer"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scene_index_buffer"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let uniform_stride = align_to(std::mem::size_of::<DrawUniforms>() as u64, alignment);
        let uniform_capacity = 64;
        let uniform_buffer = Self::create_uniform_buffer(&device, uniform_stride * uniform_capacity);

        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("scene_color"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: color_format(COLOR_FORMAT),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color.create_view(&Default::default());
        let depth_view = Self::create_depth_texture(&device, width, height);

        Self {
            device,
            width,
            height,
            color,
            color_view,
            depth_view,
            vertex_buffer,
            index_buffer,
            meshes,
            uniform_buffer,
            uniform_stride,
            uniform_capacity,
            clear_color: wgpu::Color {
                r: 0.1,
                g: 0.1,
                b: 0.15,
                a: 1.0,
            },
        }
    }

    pub fn meshes(&self) -> &MeshTable {
        &self.meshes
    }

    pub fn mesh(&self, name: &str) -> Option<MeshHandle> {
        self.meshes.lookup(name)
    }

    pub fn set_clear_color(&mut self, rgba: [f64; 4]) {
        self.clear_color = wgpu::Color {
            r: rgba[0],
            g: rgba[1],
            b: rgba[2],
            a: rgba[3],
        };
    }

    /// Clear color as stored in the sRGB target.
    pub fn clear_bytes(&self) -> [u8; 4] {
        let c = self.clear_color;
        [
            linear_to_srgb(c.r),
            linear_to_srgb(c.g),
            linear_to_srgb(c.b),
            (c.a.clamp(0.0, 1.0) * 255.0).round() as u8,
        ]
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Draw `draws` with `pipeline` and submit.
    pub fn render(
        &mut self,
        queue: &wgpu::Queue,
        pipeline: &wgpu::RenderPipeline,
        draws: &[DrawItem],
    ) -> FrameStats {
        let mut stats = FrameStats::default();
        let visible: Vec<(&DrawItem, MeshInfo)> = draws
            .iter()
            .filter_map(|draw| match self.meshes.get(draw.mesh) {
                Some(info) => Some((draw, *info)),
                None => {
                    tracing::debug!(entity = %draw.entity, mesh = draw.mesh.0, "unknown mesh; draw skipped");
                    stats.skipped += 1;
                    None
                }
            })
            .collect();

        self.reserve(visible.len() as u64);
        let mut uniforms = vec![0u8; (self.uniform_stride * visible.len() as u64) as usize];
        for (i, (draw, _)) in visible.iter().enumerate() {
            let data = DrawUniforms {
                mvp: draw.mvp.to_cols_array_2d(),
                model: draw.model.to_cols_array_2d(),
                color: palette(draw.entity.slot()),
            };
            let start = i * self.uniform_stride as usize;
            uniforms[start..start + std::mem::size_of::<DrawUniforms>()]
                .copy_from_slice(bytemuck::bytes_of(&data));
        }
        if !uniforms.is_empty() {
            queue.write_buffer(&self.uniform_buffer, 0, &uniforms);
        }

        let layout = pipeline.get_bind_group_layout(0);
        let bind_groups: Vec<wgpu::BindGroup> = (0..visible.len() as u64)
            .map(|i| {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("draw_bind_group"),
                    layout: &layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.uniform_buffer,
                            offset: i * self.uniform_stride,
                            size: NonZeroU64::new(std::mem::size_of::<DrawUniforms>() as u64),
                        }),
                    }],
                })
            })
            .collect();

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("scene_encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("scene_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_color),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                ..Default::default()
            });

            pass.set_pipeline(pipeline);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            for ((_, mesh), bind_group) in visible.iter().zip(&bind_groups) {
                pass.set_bind_group(0, bind_group, &[]);
                pass.draw_indexed(
                    mesh.first_index..mesh.first_index + mesh.index_count,
                    mesh.base_vertex,
                    0..1,
                );
                stats.draws += 1;
            }
        }
        queue.submit(std::iter::once(encoder.finish()));
        stats
    }

    /// Copy the color target back to the CPU. Blocks until the GPU is idle.
    pub fn read_frame(&self, queue: &wgpu::Queue) -> Result<FrameImage, GpuError> {
        let unpadded = self.width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scene_readback"),
            size: u64::from(padded) * u64::from(self.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.color,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Readback(e.to_string()))?
            .map_err(|e| GpuError::Readback(e.to_string()))?;

        let mut rgba = Vec::with_capacity((unpadded * self.height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks_exact(padded as usize) {
                rgba.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        readback.unmap();
        Ok(FrameImage {
            width: self.width,
            height: self.height,
            rgba,
        })
    }

    fn reserve(&mut self, draws: u64) {
        if draws <= self.uniform_capacity {
            return;
        }
        self.uniform_capacity = draws.next_power_of_two();
        self.uniform_buffer =
            Self::create_uniform_buffer(&self.device, self.uniform_stride * self.uniform_capacity);
        tracing::debug!(capacity = self.uniform_capacity, "uniform buffer grown");
    }

    fn create_uniform_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("draw_uniforms"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn create_depth_texture(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: depth_format(DEPTH_FORMAT),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        texture.create_view(&Default::default())
    }
}
