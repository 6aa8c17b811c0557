//! Media pipeline modules.
//!
//! Per displayed frame, data flows through these modules in order:
//!
//! 1. [`decoder`] - demux + VA-API hardware decode, yields an opaque surface handle
//! 2. [`vaapi`] - exports the surface as DRM-PRIME memory objects + plane layouts
//! 3. [`dmabuf`] - imports each plane fd into Vulkan, wrapped as a `wgpu::Texture`
//! 4. [`video_texture`] - rebinds the persistent NV12 pipeline to the frame's planes and draws
//! 5. [`presenter`] - swaps the display buffer under a fixed timing policy
//!
//! All per-frame resources (packet, surface, fds, imported textures, bind
//! group) are frame-scoped: acquired after export and released before the next
//! surface export is requested.

pub mod decoder;
pub mod dmabuf;
pub mod presenter;
pub mod vaapi;
pub mod video;
pub mod video_texture;

pub use decoder::{DecodeStatus, SurfaceFrame, VaapiDecoder};
pub use presenter::{PresentPolicy, Presenter};
pub use vaapi::{LayerMode, SurfaceDescriptor, SurfaceExporter};
pub use video::{FrameSkip, PlayerError};
pub use video_texture::VideoRenderResources;
