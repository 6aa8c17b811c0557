//! NV12 render pipeline: persistent GPU objects and per-frame binding.
//!
//! The pipeline, bind group layout, sampler and uniform buffer are created
//! once at startup and reused for every frame. Binding a frame means building
//! a bind group over that frame's two imported plane textures - the previous
//! frame's binding is implicitly invalidated, and no separate unbind step
//! exists outside shutdown.
//!
//! The vertex stage emits the four corners of a unit quad scaled by the
//! texture-coordinate-scale uniform; the fragment stage samples luma and
//! interleaved chroma and applies a fixed YUV->RGB matrix baked into the
//! shader source. The scale uniform is written exactly once per run, from the
//! first exported surface, because the hardware surface stride/padding is
//! unknown before then.

use std::borrow::Cow;
use std::num::NonZeroU64;

use super::video::PlayerError;

/// Uniform block for the vertex stage; 16 bytes to satisfy layout rules.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
struct ScaleUniforms {
    tex_scale: [f32; 2],
    _padding: [f32; 2],
}

/// Aspect-preserving viewport within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Computes the largest centered viewport that shows the full video inside
/// the window, letterboxed, preserving the source aspect ratio.
pub fn letterbox_viewport(
    window_width: u32,
    window_height: u32,
    video_width: u32,
    video_height: u32,
) -> Viewport {
    if video_width == 0 || video_height == 0 || window_width == 0 || window_height == 0 {
        return Viewport {
            x: 0,
            y: 0,
            width: window_width,
            height: window_height,
        };
    }

    let mut display_width = window_width;
    let mut display_height = (window_width * video_height + video_width / 2) / video_width;
    if display_height > window_height {
        display_width = (window_height * video_width + video_height / 2) / video_height;
        display_height = window_height;
    }

    Viewport {
        x: (window_width - display_width) / 2,
        y: (window_height - display_height) / 2,
        width: display_width,
        height: display_height,
    }
}

/// Texture-coordinate scale from coded (visible) size to the padded hardware
/// surface size.
pub fn compute_tex_scale(
    coded_width: u32,
    coded_height: u32,
    surface_width: u32,
    surface_height: u32,
) -> [f32; 2] {
    [
        (coded_width as f64 / surface_width.max(1) as f64) as f32,
        (coded_height as f64 / surface_height.max(1) as f64) as f32,
    ]
}

/// Persistent GPU resources for NV12 rendering.
pub struct VideoRenderResources {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    /// Set exactly once, on the first exported surface.
    tex_scale: Option<[f32; 2]>,
}

impl VideoRenderResources {
    /// Compiles the shader pair and builds the render pipeline targeting
    /// `target_format`. Called once at startup.
    pub fn new(device: &wgpu::Device, target_format: wgpu::TextureFormat) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("video.wgsl"))),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video_uniform_buffer"),
            size: std::mem::size_of::<ScaleUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(
                            std::mem::size_of::<ScaleUniforms>() as u64
                        ),
                    },
                    count: None,
                },
                // Luma plane
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Chroma plane
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
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
            label: Some("video_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("video_pipeline_nv12"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: target_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            bind_group_layout,
            uniform_buffer,
            sampler,
            tex_scale: None,
        }
    }

    /// Writes the texture-coordinate scale on the first call and ignores all
    /// later ones; the scale is stable for the session because every frame of
    /// a stream shares the same surface stride. Returns whether this call
    /// performed the write.
    pub fn set_scale_once(&mut self, queue: &wgpu::Queue, scale: [f32; 2]) -> bool {
        if self.tex_scale.is_some() {
            return false;
        }
        let uniforms = ScaleUniforms {
            tex_scale: scale,
            _padding: [0.0; 2],
        };
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[uniforms]));
        self.tex_scale = Some(scale);
        tracing::info!("texture coordinate scale: {:.4} x {:.4}", scale[0], scale[1]);
        true
    }

    /// The scale written by [`set_scale_once`], if any.
    pub fn tex_scale(&self) -> Option<[f32; 2]> {
        self.tex_scale
    }

    /// Rebinds the persistent texture slots to this frame's imported planes.
    pub fn bind_planes(
        &self,
        device: &wgpu::Device,
        luma: &wgpu::Texture,
        chroma: &wgpu::Texture,
    ) -> wgpu::BindGroup {
        let luma_view = luma.create_view(&wgpu::TextureViewDescriptor::default());
        let chroma_view = chroma.create_view(&wgpu::TextureViewDescriptor::default());

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&luma_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&chroma_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    /// Draws the full quad into `target`, clipped to `viewport`; the rest of
    /// the target is cleared to black (the letterbox bars).
    pub fn draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        viewport: Viewport,
        bind_group: &wgpu::BindGroup,
    ) -> Result<(), PlayerError> {
        if self.tex_scale.is_none() {
            return Err(PlayerError::Gpu(
                "draw before texture coordinate scale was set".to_string(),
            ));
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("video_render_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
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

        if viewport.width > 0 && viewport.height > 0 {
            pass.set_viewport(
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..4, 0..1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_wide_window_pillarboxes() {
        // 16:9 video in a 21:9-ish window: full height, centered horizontally.
        let vp = letterbox_viewport(2560, 1080, 1920, 1080);
        assert_eq!(vp.height, 1080);
        assert_eq!(vp.width, 1920);
        assert_eq!(vp.x, (2560 - 1920) / 2);
        assert_eq!(vp.y, 0);
    }

    #[test]
    fn test_letterbox_tall_window_letterboxes() {
        let vp = letterbox_viewport(1280, 1024, 1280, 720);
        assert_eq!(vp.width, 1280);
        assert_eq!(vp.height, 720);
        assert_eq!(vp.x, 0);
        assert_eq!(vp.y, (1024 - 720) / 2);
    }

    #[test]
    fn test_letterbox_exact_fit() {
        let vp = letterbox_viewport(1280, 720, 1280, 720);
        assert_eq!(
            vp,
            Viewport {
                x: 0,
                y: 0,
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn test_letterbox_rounds_like_integer_division() {
        // 1279x720 window, 1280x720 video: height rounds to nearest.
        let vp = letterbox_viewport(1279, 720, 1280, 720);
        assert_eq!(vp.height, (1279 * 720 + 640) / 1280);
        assert_eq!(vp.width, 1279);
    }

    #[test]
    fn test_letterbox_degenerate_sizes() {
        let vp = letterbox_viewport(800, 600, 0, 0);
        assert_eq!((vp.width, vp.height), (800, 600));
    }

    #[test]
    fn test_tex_scale_accounts_for_stride_padding() {
        // 1280x720 coded frame on a 1280x736 padded surface.
        let scale = compute_tex_scale(1280, 720, 1280, 736);
        assert!((scale[0] - 1.0).abs() < 1e-6);
        assert!((scale[1] - 720.0 / 736.0).abs() < 1e-6);
    }

    #[test]
    fn test_tex_scale_guards_zero_surface() {
        let scale = compute_tex_scale(1280, 720, 0, 0);
        assert!(scale[0].is_finite() && scale[1].is_finite());
    }
}
