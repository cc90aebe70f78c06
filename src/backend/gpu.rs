//! wgpu backend: kernels become compute pipelines over storage textures.

use std::collections::BTreeMap;

use half::f16;
use wgpu::util::DeviceExt;

use super::cpu::check_format;
use super::{
    Backend, ClipPoint, KernelId, PointStyle, TextureDesc, TextureId, resolve_entry_bindings,
};
use crate::compiler::property::Record;
use crate::error::BackendError;
use crate::kernel::ir::{Access, KernelModule};
use crate::kernel::types::TextureFormat;
use crate::kernel::validation::validate_module;
use crate::kernel::wgsl::WORKGROUP_SIZE;

const POINT_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> color: vec4f;

@vertex
fn vs_main(@location(0) position: vec4f) -> @builtin(position) vec4f {
    return position;
}

@fragment
fn fs_main() -> @location(0) vec4f {
    return color;
}
"#;

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

fn encode_texel(format: TextureFormat, texel: [f32; 4], out: &mut Vec<u8>) {
    match format {
        TextureFormat::Rgba8Unorm => {
            out.extend(texel.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8));
        }
        TextureFormat::Rgba16Float => {
            for v in texel {
                out.extend_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
        TextureFormat::Rgba32Float => {
            for v in texel {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
    let mut texel = [0.0; 4];
    for (i, v) in texel.iter_mut().enumerate() {
        *v = match format {
            TextureFormat::Rgba8Unorm => bytes[i] as f32 / 255.0,
            TextureFormat::Rgba16Float => {
                f16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]).to_f32()
            }
            TextureFormat::Rgba32Float => f32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]),
        };
    }
    texel
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

fn extent(desc: TextureDesc) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: desc.width,
        height: desc.height,
        depth_or_array_layers: 1,
    }
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuKernel {
    module: KernelModule,
    layout: wgpu::BindGroupLayout,
    pipelines: BTreeMap<String, wgpu::ComputePipeline>,
    /// 1x1 stand-ins for bindings an entry does not touch, by binding index.
    placeholders: Vec<GpuTexture>,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: BTreeMap<KernelId, GpuKernel>,
    textures: BTreeMap<TextureId, GpuTexture>,
    point_pipelines: Vec<(TextureFormat, wgpu::RenderPipeline, wgpu::BindGroupLayout)>,
    next_id: u32,
}

impl GpuBackend {
    /// Headless device on the default adapter.
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| BackendError::Device(format!("request_adapter failed: {e}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("sdf-forge"),
            ..Default::default()
        }))
        .map_err(|e| BackendError::Device(format!("request_device failed: {e}")))?;
        tracing::info!(adapter = ?adapter.get_info().name, "gpu backend ready");
        Ok(Self::from_device(device, queue))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            kernels: BTreeMap::new(),
            textures: BTreeMap::new(),
            point_pipelines: Vec::new(),
            next_id: 1,
        }
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture, BackendError> {
        self.textures
            .get(&id)
            .ok_or(BackendError::UnknownTexture(id.0))
    }

    fn allocate(&self, desc: TextureDesc, label: &str) -> GpuTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(desc),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            desc,
            texture,
            view,
        }
    }

    /// Run `f` inside a validation error scope and report what it raised.
    fn scoped<T>(&self, label: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(BackendError::Compile {
                label: label.to_string(),
                message: error.to_string(),
            }),
            None => Ok(value),
        }
    }

    fn point_pipeline(
        &mut self,
        format: TextureFormat,
    ) -> Result<(wgpu::RenderPipeline, wgpu::BindGroupLayout), BackendError> {
        if let Some((_, p, l)) = self.point_pipelines.iter().find(|(f, ..)| *f == format) {
            return Ok((p.clone(), l.clone()));
        }
        let (pipeline, layout) = self.scoped("points", |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("points"),
                source: wgpu::ShaderSource::Wgsl(POINT_SHADER.into()),
            });
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("points.bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("points.layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("points.pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<ClipPoint>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x4],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu_format(format),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::PointList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
            (pipeline, layout)
        })?;
        self.point_pipelines
            .push((format, pipeline.clone(), layout.clone()));
        Ok((pipeline, layout))
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn compile(&mut self, module: &KernelModule) -> Result<KernelId, BackendError> {
        module.verify().map_err(|message| BackendError::Compile {
            label: module.label.clone(),
            message,
        })?;
        let source = validate_module(module).map_err(|e| BackendError::Compile {
            label: module.label.clone(),
            message: format!("{e:#}"),
        })?;

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for (i, b) in module.bindings.iter().enumerate() {
            let ty = match b.access {
                Access::Read => wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                Access::Write => wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu_format(b.format),
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty,
                count: None,
            });
        }

        let label = module.label.clone();
        let (layout, pipelines) = self.scoped(&label, |device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&label),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipelines: BTreeMap<String, wgpu::ComputePipeline> = module
                .entries
                .iter()
                .map(|e| {
                    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(&e.name),
                        layout: Some(&pipeline_layout),
                        module: &shader,
                        entry_point: Some(&e.name),
                        compilation_options: Default::default(),
                        cache: None,
                    });
                    (e.name.clone(), pipeline)
                })
                .collect();
            (layout, pipelines)
        })?;

        let placeholders = module
            .bindings
            .iter()
            .map(|b| self.allocate(TextureDesc::new(1, 1, b.format), "placeholder"))
            .collect();
        let id = KernelId(self.next());
        tracing::debug!(kernel = %module.label, entries = pipelines.len(), "compiled compute module");
        self.kernels.insert(
            id,
            GpuKernel {
                module: module.clone(),
                layout,
                pipelines,
                placeholders,
            },
        );
        Ok(id)
    }

    fn release_kernel(&mut self, kernel: KernelId) {
        self.kernels.remove(&kernel);
    }

    fn create_texture(&mut self, desc: TextureDesc) -> Result<TextureId, BackendError> {
        desc.validate()?;
        let texture = self.allocate(desc, "texture");
        let id = TextureId(self.next());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.textures.get(&texture).map(|t| t.desc)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        entry: &str,
        data: &[Record],
        bindings: &[(&str, TextureId)],
    ) -> Result<(), BackendError> {
        let k = self
            .kernels
            .get(&kernel)
            .ok_or(BackendError::UnknownKernel(kernel.0))?;
        let resolved = resolve_entry_bindings(&k.module, entry, bindings)?;
        let pipeline = k
            .pipelines
            .get(entry)
            .ok_or_else(|| BackendError::UnknownEntry {
                kernel: k.module.label.clone(),
                entry: entry.to_string(),
            })?;

        let mut size = None;
        for (name, id) in resolved.reads.iter().chain(&resolved.writes) {
            check_format(&k.module, name, self.texture(*id)?.desc)?;
        }
        for (name, id) in &resolved.writes {
            let desc = self.texture(*id)?.desc;
            match size {
                None => size = Some((desc.width, desc.height)),
                Some(s) if s != (desc.width, desc.height) => {
                    return Err(BackendError::TextureMismatch(format!(
                        "output '{name}' of '{entry}' differs in size from the first output"
                    )));
                }
                Some(_) => {}
            }
        }
        let Some((width, height)) = size else {
            return Err(BackendError::UnknownEntry {
                kernel: k.module.label.clone(),
                entry: entry.to_string(),
            });
        };

        let records: &[Record] = if data.is_empty() { &[[0.0; 4]] } else { data };
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("properties"),
                contents: bytemuck::cast_slice(records),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let mut views = Vec::with_capacity(k.module.bindings.len());
        for (i, b) in k.module.bindings.iter().enumerate() {
            let bound = resolved
                .reads
                .iter()
                .chain(&resolved.writes)
                .find(|(n, _)| *n == b.name)
                .map(|(_, id)| *id);
            let view = match bound {
                Some(id) => &self.texture(id)?.view,
                None => &k.placeholders[i].view,
            };
            views.push(view);
        }
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        }];
        entries.extend(views.iter().enumerate().map(|(i, view)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry),
            layout: &k.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(entry) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn clear(&mut self, texture: TextureId, value: [f32; 4]) -> Result<(), BackendError> {
        let tex = self.texture(texture)?;
        let desc = tex.desc;
        let mut texel = Vec::new();
        encode_texel(desc.format, value, &mut texel);
        let bytes = texel.repeat(desc.texel_count());
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * desc.format.bytes_per_pixel()),
                rows_per_image: Some(desc.height),
            },
            extent(desc),
        );
        Ok(())
    }

    fn copy(&mut self, src: TextureId, dst: TextureId) -> Result<(), BackendError> {
        let (s, d) = (self.texture(src)?, self.texture(dst)?);
        if s.desc != d.desc {
            return Err(BackendError::TextureMismatch(format!(
                "copy from {:?} into {:?}",
                s.desc, d.desc
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_texture_to_texture(
            s.texture.as_image_copy(),
            d.texture.as_image_copy(),
            extent(s.desc),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw_points(
        &mut self,
        target: TextureId,
        points: &[ClipPoint],
        style: &PointStyle,
    ) -> Result<(), BackendError> {
        let format = self.texture(target)?.desc.format;
        let (pipeline, layout) = self.point_pipeline(format)?;
        let color = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("points.color"),
                contents: bytemuck::cast_slice(&[style.color]),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("points.bg"),
            layout: &layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: color.as_entire_binding(),
            }],
        });
        let vertices = (!points.is_empty()).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("points.vertices"),
                    contents: bytemuck::cast_slice(points),
                    usage: wgpu::BufferUsages::VERTEX,
                })
        });

        let view = &self.texture(target)?.view;
        let [r, g, b, a] = style.background.map(f64::from);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("points") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("points.pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some(vertices) = &vertices {
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, vertices.slice(..));
                pass.draw(0..points.len() as u32, 0..1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId) -> Result<Vec<[f32; 4]>, BackendError> {
        let tex = self.texture(texture)?;
        let desc = tex.desc;
        let bpp = desc.format.bytes_per_pixel();
        let row_bytes = desc.width * bpp;
        let padded = align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded as u64 * desc.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_texture_to_buffer(
            tex.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(desc.height),
                },
            },
            extent(desc),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| BackendError::Device(format!("poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| BackendError::Device("readback channel closed".into()))?
            .map_err(|e| BackendError::Device(format!("readback map failed: {e}")))?;

        let mapped = slice.get_mapped_range();
        let mut texels = Vec::with_capacity(desc.texel_count());
        for row in 0..desc.height as usize {
            let start = row * padded as usize;
            texels.extend(
                mapped[start..start + row_bytes as usize]
                    .chunks_exact(bpp as usize)
                    .map(|b| decode_texel(desc.format, b)),
            );
        }
        drop(mapped);
        readback.unmap();
        Ok(texels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texels_survive_the_byte_encoding() {
        let texel = [0.25, -2.0, 1024.0, 1.0];
        for format in [TextureFormat::Rgba16Float, TextureFormat::Rgba32Float] {
            let mut bytes = Vec::new();
            encode_texel(format, texel, &mut bytes);
            assert_eq!(bytes.len() as u32, format.bytes_per_pixel());
            assert_eq!(decode_texel(format, &bytes), texel);
        }
        let mut bytes = Vec::new();
        encode_texel(TextureFormat::Rgba8Unorm, [1.0, 0.0, 2.0, -1.0], &mut bytes);
        assert_eq!(bytes, vec![255, 0, 255, 0]);
    }

    #[test]
    fn rows_align_to_copy_granularity() {
        assert_eq!(align_to(16, 256), 256);
        assert_eq!(align_to(512, 256), 512);
    }
}
