//! primeview: zero-copy hardware video playback for Linux.
//!
//! This crate implements the full resource-ownership chain between three
//! independently-owned subsystems, executed once per displayed frame:
//!
//! ```text
//! VA-API decode surface -> DRM-PRIME export (DMABuf fds) -> Vulkan import -> wgpu texture
//! ```
//!
//! Decoding is driven through FFmpeg's VA-API hwaccel layer ([`media::decoder`]),
//! decoded surfaces are exported as DRM-PRIME descriptors ([`media::vaapi`]),
//! each NV12 plane is imported into Vulkan without a pixel copy
//! ([`media::dmabuf`]), and a fixed NV12 shader pipeline converts and draws
//! the planes ([`media::video_texture`]).
//!
//! The crate is deliberately single-backend: VA-API on the decode side and
//! Vulkan (through wgpu) on the display side. There is no CPU fallback; any
//! failure along the import chain is a configuration or driver problem and is
//! reported as fatal.

pub mod media;

pub use media::decoder::{DecodeStatus, StreamInfo, SurfaceFrame, VaapiDecoder};
pub use media::dmabuf::dmabuf_import_available;
pub use media::presenter::{PresentPolicy, Presenter};
pub use media::vaapi::{LayerMode, SurfaceDescriptor, SurfaceExporter, VaDisplayHandle, VaSurface};
pub use media::video::{FrameSkip, PlayerError};
pub use media::video_texture::{
    compute_tex_scale, letterbox_viewport, VideoRenderResources, Viewport,
};
