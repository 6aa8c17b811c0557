//! Minimal windowed player for primeview.
//!
//! Plays a video file in a window with hardware decoding and zero-copy
//! display, without audio and without time synchronization: frames appear as
//! fast as the decoder produces them or at the display's refresh cadence,
//! depending on the presentation policy.
//!
//! One frame iteration runs per redraw; the event loop polls, so window
//! events (close, keyboard, resize) are dispatched between iterations and are
//! never starved by a slow frame.
//!
//! Keys while the window is focused:
//!
//! - `Q` - quit
//! - `A` - decode all frames
//! - `B` - skip non-reference frames
//! - `P` - skip everything but key frames

use std::process::ExitCode;
use std::sync::Arc;

use primeview::media::dmabuf;
use primeview::{
    compute_tex_scale, letterbox_viewport, DecodeStatus, FrameSkip, LayerMode, PlayerError,
    PresentPolicy, Presenter, SurfaceExporter, VaapiDecoder, VideoRenderResources, Viewport,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

/// How exported planes are grouped into layers. Both modes are equivalent;
/// fixed at build time.
const LAYER_MODE: LayerMode = LayerMode::SeparateLayers;

/// Presentation timing policy, fixed at build time.
const PRESENT_POLICY: PresentPolicy = PresentPolicy::EveryRefresh;

struct Args {
    input: String,
    device: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Args> {
    let _argv0 = args.next();
    let input = args.next()?;
    let device = args.next();
    Some(Args { input, device })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("primeview=info".parse().unwrap())
                .add_directive("primeview_player=info".parse().unwrap()),
        )
        .init();

    let Some(args) = parse_args(std::env::args()) else {
        eprintln!("Usage: primeview-player <input.mp4> [/dev/dri/renderDxxx]");
        return ExitCode::from(2);
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<(), PlayerError> {
    let decoder = VaapiDecoder::open(&args.input, args.device.as_deref())?;
    let exporter = SurfaceExporter::new(decoder.va_display(), LAYER_MODE)?;

    let event_loop = EventLoop::new()
        .map_err(|e| PlayerError::Gpu(format!("event loop creation: {e}")))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = PlayerApp {
        input_name: args.input,
        decoder,
        exporter,
        gfx: None,
        error: None,
    };
    event_loop
        .run_app(&mut app)
        .map_err(|e| PlayerError::Gpu(format!("event loop: {e}")))?;

    match app.error {
        Some(e) => Err(e),
        None => {
            tracing::info!("bye");
            Ok(())
        }
    }
}

/// GPU-side state, created once the event loop hands out a window.
struct Gfx {
    window: Arc<Window>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    presenter: Presenter,
    renderer: VideoRenderResources,
    viewport: Viewport,
}

/// Per-iteration player state threaded through the frame loop.
struct PlayerApp {
    input_name: String,
    decoder: VaapiDecoder,
    exporter: SurfaceExporter,
    gfx: Option<Gfx>,
    error: Option<PlayerError>,
}

impl PlayerApp {
    fn init_gfx(&mut self, event_loop: &ActiveEventLoop) -> Result<(), PlayerError> {
        let info = self.decoder.info().clone();

        // Initial window size equals the stream's coded resolution.
        let window = Arc::new(
            event_loop
                .create_window(
                    Window::default_attributes()
                        .with_title(format!("primeview - {}", self.input_name))
                        .with_inner_size(PhysicalSize::new(info.width, info.height)),
                )
                .map_err(|e| PlayerError::Gpu(format!("window creation: {e}")))?,
        );

        // DMABuf import requires the Vulkan backend.
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            ..Default::default()
        });
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| PlayerError::Gpu(format!("surface creation: {e}")))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| PlayerError::Gpu("no suitable Vulkan adapter".to_string()))?;

        let adapter_info = adapter.get_info();
        tracing::info!(
            "GPU: {} ({:?}, driver {} {})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.driver,
            adapter_info.driver_info
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("primeview device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| PlayerError::Gpu(format!("device creation: {e}")))?;

        if !dmabuf::dmabuf_import_available(&device) {
            return Err(PlayerError::Unsupported(
                "Vulkan device lacks VK_EXT_external_memory_dma_buf / VK_KHR_external_memory_fd"
                    .to_string(),
            ));
        }

        let size = window.inner_size();
        let presenter = Presenter::new(
            surface,
            &adapter,
            &device,
            size.width,
            size.height,
            PRESENT_POLICY,
        )?;
        let renderer = VideoRenderResources::new(&device, presenter.format());
        let viewport = letterbox_viewport(size.width, size.height, info.width, info.height);

        self.gfx = Some(Gfx {
            window,
            device,
            queue,
            presenter,
            renderer,
            viewport,
        });
        Ok(())
    }

    /// One frame iteration: decode, export, import both planes, rebind, draw,
    /// present. All per-frame resources are released before this returns.
    ///
    /// Returns `false` when the stream is exhausted.
    fn frame(&mut self) -> Result<bool, PlayerError> {
        let Some(gfx) = self.gfx.as_mut() else {
            return Ok(true);
        };

        let frame = match self.decoder.decode_next()? {
            DecodeStatus::Again => return Ok(true),
            DecodeStatus::EndOfStream => {
                tracing::info!(
                    "end of stream after {} frames",
                    self.decoder.frames_decoded()
                );
                return Ok(false);
            }
            DecodeStatus::Frame(frame) => frame,
        };

        let descriptor = self.exporter.export(frame.surface)?;

        // The true visible-vs-padded ratio is unknown before the first
        // export; written once, stable for the session.
        let info = self.decoder.info();
        gfx.renderer.set_scale_once(
            &gfx.queue,
            compute_tex_scale(info.width, info.height, descriptor.width, descriptor.height),
        );

        let luma = unsafe { dmabuf::import_plane(&gfx.device, &descriptor, 0)? };
        let chroma = unsafe { dmabuf::import_plane(&gfx.device, &descriptor, 1)? };
        // Both imports hold their own references now; closing the exported
        // fds must happen exactly once and only after import succeeded.
        drop(descriptor);

        let bind_group = gfx.renderer.bind_planes(&gfx.device, &luma, &chroma);

        let target = gfx.presenter.acquire(&gfx.device)?;
        let view = target
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = gfx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("video_encoder"),
            });
        gfx.renderer
            .draw(&mut encoder, &view, gfx.viewport, &bind_group)?;
        gfx.queue.submit(Some(encoder.finish()));

        gfx.window.pre_present_notify();
        target.present();

        tracing::debug!(
            "frame #{} ({})",
            self.decoder.frames_decoded(),
            frame.pict_type
        );

        // luma/chroma/bind_group drop here: the imported images never
        // outlive the frame that produced them.
        Ok(true)
    }
}

impl ApplicationHandler for PlayerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.gfx.is_some() {
            return;
        }
        match self.init_gfx(event_loop) {
            Ok(()) => {
                if let Some(gfx) = &self.gfx {
                    gfx.window.request_redraw();
                }
            }
            Err(e) => {
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("window close requested");
                event_loop.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match code {
                KeyCode::KeyQ => {
                    tracing::info!("quit requested");
                    event_loop.exit();
                }
                KeyCode::KeyA => self.decoder.set_frame_skip(FrameSkip::DecodeAll),
                KeyCode::KeyB => self.decoder.set_frame_skip(FrameSkip::NonReference),
                KeyCode::KeyP => self.decoder.set_frame_skip(FrameSkip::KeyFramesOnly),
                _ => {}
            },
            WindowEvent::Resized(size) => {
                if let Some(gfx) = self.gfx.as_mut() {
                    gfx.presenter.resize(&gfx.device, size.width, size.height);
                    let info = self.decoder.info();
                    // The viewport letterboxes; the texture coordinate scale
                    // is untouched by resizes.
                    gfx.viewport =
                        letterbox_viewport(size.width, size.height, info.width, info.height);
                }
            }
            WindowEvent::RedrawRequested => match self.frame() {
                Ok(true) => {
                    if let Some(gfx) = &self.gfx {
                        gfx.window.request_redraw();
                    }
                }
                Ok(false) => event_loop.exit(),
                Err(e) => {
                    self.error = Some(e);
                    event_loop.exit();
                }
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Option<Args> {
        parse_args(v.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args_requires_input() {
        assert!(args(&["primeview-player"]).is_none());
    }

    #[test]
    fn test_parse_args_input_only() {
        let parsed = args(&["primeview-player", "clip.mp4"]).unwrap();
        assert_eq!(parsed.input, "clip.mp4");
        assert!(parsed.device.is_none());
    }

    #[test]
    fn test_parse_args_with_render_device() {
        let parsed =
            args(&["primeview-player", "clip.mp4", "/dev/dri/renderD129"]).unwrap();
        assert_eq!(parsed.device.as_deref(), Some("/dev/dri/renderD129"));
    }
}
