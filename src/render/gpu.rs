use anyhow::{bail, Result};
use log::{debug, info};
use pixels::wgpu;
use pixels::wgpu::util::DeviceExt;
use pixels::Pixels;

use super::layout::{Layout, Vertex};
use crate::framebuffer::IndexedFramebuffer;
use crate::palette::Palette;

const SHADER: &str = include_str!("palette.wgsl");

/// Renders indexed frames with a palette lookup in the fragment shader.
///
/// The index texture is created once, at the size of the visible area, and only its contents are
/// replaced every frame.
pub struct GpuRenderer {
    layout: Layout,
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
    texture: wgpu::Texture,
    quad_buffer: wgpu::Buffer,
    palette_buffer: wgpu::Buffer,
}

impl GpuRenderer {
    pub fn new(pixels: &Pixels, layout: Layout, palette: &Palette) -> Result<Self> {
        let device = pixels.device();
        let target_format = pixels.render_texture_format();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("a8 palette shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("a8 palette bind group layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::VERTEX),
                uniform_entry(1, wgpu::ShaderStages::FRAGMENT),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("a8 palette pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("a8 palette pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: "vs_main",
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            bail!("Failed to build palette shader program: {}", err);
        }
        info!("Palette shader program ready");

        let region = layout.upload_region();
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("a8 index texture"),
            size: texture_extent(&layout),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        debug!("Index texture: {}x{}", region.width, region.height);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        // Indices are not perceptually continuous: never interpolate between neighbours
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("a8 index sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let quad_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("a8 quad"),
            contents: &quad_uniform(&layout.quad()),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let palette_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("a8 palette"),
            contents: &palette_uniform(palette, target_format.is_srgb()),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("a8 palette bind group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: quad_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: palette_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        Ok(Self {
            layout,
            pipeline,
            bind_group,
            texture,
            quad_buffer,
            palette_buffer,
        })
    }

    /// Copy the visible part of `frame` into the index texture.
    pub fn upload(&self, queue: &wgpu::Queue, frame: &IndexedFramebuffer) -> Result<()> {
        if (frame.width(), frame.height()) != self.layout.native_size() {
            bail!(
                "Frame is {}x{}, expected {:?}",
                frame.width(),
                frame.height(),
                self.layout.native_size()
            );
        }
        let region = self.layout.upload_region();
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.pixels(),
            wgpu::ImageDataLayout {
                offset: region.offset as u64,
                bytes_per_row: Some(region.bytes_per_row as u32),
                rows_per_image: Some(region.height as u32),
            },
            texture_extent(&self.layout),
        );
        Ok(())
    }

    /// Draw the quad into `render_target`, within the `(x, y, width, height)` viewport.
    pub fn draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        render_target: &wgpu::TextureView,
        viewport: (u32, u32, u32, u32),
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("a8 palette pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: render_target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let (x, y, width, height) = viewport;
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
        pass.draw(0..4, 0..1);
    }

    pub fn teardown(&mut self) {
        self.texture.destroy();
        self.quad_buffer.destroy();
        self.palette_buffer.destroy();
        debug!("GPU resources released");
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_extent(layout: &Layout) -> wgpu::Extent3d {
    let region = layout.upload_region();
    wgpu::Extent3d {
        width: region.width as u32,
        height: region.height as u32,
        depth_or_array_layers: 1,
    }
}

/// The quad as `array<vec4<f32>, 4>`: position in `xy`, texture coordinate in `zw`.
fn quad_uniform(quad: &[Vertex; 4]) -> Vec<u8> {
    quad.iter()
        .flat_map(|v| [v.position[0], v.position[1], v.tex_coord[0], v.tex_coord[1]])
        .flat_map(f32::to_le_bytes)
        .collect()
}

/// The palette as `array<vec4<f32>, 256>`.
///
/// An sRGB render target encodes whatever the shader outputs, so the colours are linearized first
/// to come out unchanged on screen.
fn palette_uniform(palette: &Palette, srgb_target: bool) -> Vec<u8> {
    palette
        .rgba_f32()
        .iter()
        .flat_map(|&[r, g, b, a]| {
            if srgb_target {
                [srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b), a]
            } else {
                [r, g, b, a]
            }
        })
        .flat_map(f32::to_le_bytes)
        .collect()
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}
