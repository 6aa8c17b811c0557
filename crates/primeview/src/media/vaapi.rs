//! DRM-PRIME surface export via libva.
//!
//! Converts an opaque VA-API decode surface into a [`SurfaceDescriptor`]: a
//! set of DMABuf memory objects plus the (offset, pitch, object) layout of the
//! two NV12 planes. The descriptor owns the exported fds and closes them on
//! drop; the importer duplicates what it hands to Vulkan, so each exported fd
//! is closed exactly once, strictly after import.
//!
//! libva is loaded at runtime (`libva.so.2`) via `libloading` - only the three
//! entry points this module needs are resolved, and there is no compile-time
//! dependency on VA-API headers. The `VADRMPRIMESurfaceDescriptor` layout is
//! mirrored here as `#[repr(C)]` structs matching `va/va_drmcommon.h`.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::OnceLock;

use super::video::PlayerError;

// ============================================================================
// VA-API types and constants (from va/va.h, va/va_drmcommon.h)
// ============================================================================

type VaStatus = c_int;
type RawVaDisplay = *mut c_void;
type VaSurfaceId = c_uint;

const VA_STATUS_SUCCESS: VaStatus = 0;

/// Memory type for `vaExportSurfaceHandle`: DRM PRIME 2 (fd per memory object).
const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2: u32 = 0x4000_0000;

const VA_EXPORT_SURFACE_READ_ONLY: u32 = 0x0001;
const VA_EXPORT_SURFACE_SEPARATE_LAYERS: u32 = 0x0004;
const VA_EXPORT_SURFACE_COMPOSED_LAYERS: u32 = 0x0008;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// The only surface format this pipeline accepts.
pub const VA_FOURCC_NV12: u32 = fourcc(b'N', b'V', b'1', b'2');

/// DRM fourcc of the luma plane: one 8-bit channel.
pub const DRM_FORMAT_R8: u32 = fourcc(b'R', b'8', b' ', b' ');
/// DRM fourcc of the chroma plane: two interleaved 8-bit channels.
pub const DRM_FORMAT_GR88: u32 = fourcc(b'G', b'R', b'8', b'8');

/// Expected per-plane DRM formats for NV12.
pub const EXPECTED_PLANE_FORMATS: [u32; 2] = [DRM_FORMAT_R8, DRM_FORMAT_GR88];

/// Linear (untiled) DRM format modifier.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Opaque hardware decode surface handle.
///
/// Owned by the decoder; the exporter only needs the id together with the
/// decoder's display to synchronize and export it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaSurface(pub u32);

/// Borrowed `VADisplay` pointer.
///
/// The decoder's hardware device context owns the display; this handle must
/// not outlive the decoder.
#[derive(Debug, Clone, Copy)]
pub struct VaDisplayHandle(RawVaDisplay);

impl VaDisplayHandle {
    pub(crate) fn new(raw: RawVaDisplay) -> Self {
        Self(raw)
    }

    fn raw(&self) -> RawVaDisplay {
        self.0
    }
}

// SAFETY: the display pointer is only used from the single playback thread.
unsafe impl Send for VaDisplayHandle {}

/// Mirror of `AVVAAPIDeviceContext` (libavutil/hwcontext_vaapi.h); the
/// display is the first member.
#[repr(C)]
pub struct AvVaapiDeviceContext {
    pub display: RawVaDisplay,
    pub driver_quirks: c_uint,
}

/// Mirror of the `objects` element of `VADRMPRIMESurfaceDescriptor`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawPrimeObject {
    fd: c_int,
    size: u32,
    drm_format_modifier: u64,
}

/// Mirror of the `layers` element of `VADRMPRIMESurfaceDescriptor`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawPrimeLayer {
    drm_format: u32,
    num_planes: u32,
    object_index: [u32; 4],
    offset: [u32; 4],
    pitch: [u32; 4],
}

/// Mirror of `VADRMPRIMESurfaceDescriptor`.
#[repr(C)]
struct RawPrimeDescriptor {
    fourcc: u32,
    width: u32,
    height: u32,
    num_objects: u32,
    objects: [RawPrimeObject; 4],
    num_layers: u32,
    layers: [RawPrimeLayer; 4],
}

// ============================================================================
// Runtime-loaded libva entry points
// ============================================================================

type VaSyncSurfaceFn = unsafe extern "C" fn(RawVaDisplay, VaSurfaceId) -> VaStatus;
type VaExportSurfaceHandleFn =
    unsafe extern "C" fn(RawVaDisplay, VaSurfaceId, u32, u32, *mut c_void) -> VaStatus;
type VaErrorStrFn = unsafe extern "C" fn(VaStatus) -> *const c_char;

struct VaLibrary {
    _libva: libloading::Library,
    va_sync_surface: VaSyncSurfaceFn,
    va_export_surface_handle: VaExportSurfaceHandleFn,
    va_error_str: VaErrorStrFn,
}

// SAFETY: the loaded library and resolved function pointers are immutable
// after load and callable from any single thread.
unsafe impl Send for VaLibrary {}
unsafe impl Sync for VaLibrary {}

static VA_LIB: OnceLock<Option<VaLibrary>> = OnceLock::new();

fn load_va_library() -> Option<&'static VaLibrary> {
    VA_LIB
        .get_or_init(|| unsafe {
            let libva = match libloading::Library::new("libva.so.2") {
                Ok(lib) => lib,
                Err(e) => {
                    tracing::warn!("failed to load libva.so.2: {e}");
                    return None;
                }
            };

            let va_sync_surface: VaSyncSurfaceFn = *libva.get(b"vaSyncSurface\0").ok()?;
            let va_export_surface_handle: VaExportSurfaceHandleFn =
                *libva.get(b"vaExportSurfaceHandle\0").ok()?;
            let va_error_str: VaErrorStrFn = *libva.get(b"vaErrorStr\0").ok()?;

            tracing::debug!("libva loaded");

            Some(VaLibrary {
                _libva: libva,
                va_sync_surface,
                va_export_surface_handle,
                va_error_str,
            })
        })
        .as_ref()
}

fn va_error_message(lib: &VaLibrary, status: VaStatus) -> String {
    unsafe {
        let ptr = (lib.va_error_str)(status);
        if ptr.is_null() {
            format!("VA status {status}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

// ============================================================================
// Exported descriptor
// ============================================================================

/// How planes are grouped into export layers.
///
/// Both modes describe the same memory; they only differ in how the
/// (layer, plane) indices resolve to (object, offset, pitch). Chosen once at
/// build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerMode {
    /// One layer per plane: plane *i* is (layer *i*, plane 0)
    SeparateLayers,
    /// All planes composed into one layer: plane *i* is (layer 0, plane *i*)
    ComposedLayers,
}

impl LayerMode {
    fn export_flags(self) -> u32 {
        match self {
            LayerMode::SeparateLayers => VA_EXPORT_SURFACE_SEPARATE_LAYERS,
            LayerMode::ComposedLayers => VA_EXPORT_SURFACE_COMPOSED_LAYERS,
        }
    }
}

/// One exported DMABuf memory object.
pub struct MemoryObject {
    /// Owned DMABuf fd; closed when the descriptor drops.
    pub fd: OwnedFd,
    /// Total size of the underlying buffer in bytes
    pub size: u32,
    /// DRM format modifier (tiling layout) of the buffer
    pub modifier: u64,
}

/// Resolved layout of one NV12 plane.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    /// DRM fourcc of this plane (`R8` for luma, `GR88` for chroma)
    pub drm_format: u32,
    /// Index into the descriptor's memory objects
    pub object_index: u32,
    /// Byte offset of the plane within its memory object
    pub offset: u32,
    /// Row pitch in bytes
    pub pitch: u32,
}

/// An exported, synchronized NV12 decode surface.
///
/// `width`/`height` are the hardware surface dimensions, which may exceed the
/// coded frame size due to stride/padding alignment.
pub struct SurfaceDescriptor {
    pub width: u32,
    pub height: u32,
    objects: Vec<MemoryObject>,
    planes: [PlaneLayout; 2],
}

impl SurfaceDescriptor {
    /// Layout of plane `index` (0 = luma, 1 = chroma).
    pub fn plane(&self, index: usize) -> &PlaneLayout {
        &self.planes[index]
    }

    /// The memory object backing plane `index`.
    pub fn object_for_plane(&self, index: usize) -> &MemoryObject {
        &self.objects[self.planes[index].object_index as usize]
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }
}

/// Resolves (layer, plane) indices for both layout modes and validates the
/// per-plane DRM formats where the export reports them.
fn resolve_planes(
    mode: LayerMode,
    layers: &[RawPrimeLayer],
    num_layers: u32,
) -> Result<[PlaneLayout; 2], String> {
    let mut planes = [PlaneLayout {
        drm_format: 0,
        object_index: 0,
        offset: 0,
        pitch: 0,
    }; 2];

    match mode {
        LayerMode::SeparateLayers => {
            if num_layers < 2 {
                return Err(format!("expected 2 layers, got {num_layers}"));
            }
            for (i, plane) in planes.iter_mut().enumerate() {
                let layer = &layers[i];
                if layer.drm_format != EXPECTED_PLANE_FORMATS[i] {
                    return Err(format!(
                        "layer {i} has DRM format {:#010x}, expected {:#010x}",
                        layer.drm_format, EXPECTED_PLANE_FORMATS[i]
                    ));
                }
                *plane = PlaneLayout {
                    drm_format: layer.drm_format,
                    object_index: layer.object_index[0],
                    offset: layer.offset[0],
                    pitch: layer.pitch[0],
                };
            }
        }
        LayerMode::ComposedLayers => {
            if num_layers < 1 {
                return Err("export produced no layers".to_string());
            }
            let layer = &layers[0];
            if layer.num_planes != 2 {
                return Err(format!(
                    "composed layer has {} planes, expected 2",
                    layer.num_planes
                ));
            }
            for (i, plane) in planes.iter_mut().enumerate() {
                *plane = PlaneLayout {
                    drm_format: EXPECTED_PLANE_FORMATS[i],
                    object_index: layer.object_index[i],
                    offset: layer.offset[i],
                    pitch: layer.pitch[i],
                };
            }
        }
    }

    Ok(planes)
}

// ============================================================================
// Exporter
// ============================================================================

/// Exports decode surfaces as DRM-PRIME descriptors.
pub struct SurfaceExporter {
    lib: &'static VaLibrary,
    display: VaDisplayHandle,
    mode: LayerMode,
}

impl SurfaceExporter {
    /// Creates an exporter over the decoder's VA display.
    ///
    /// Fails if libva cannot be loaded - that is a platform configuration
    /// problem, not a transient condition.
    pub fn new(display: VaDisplayHandle, mode: LayerMode) -> Result<Self, PlayerError> {
        let lib = load_va_library().ok_or_else(|| {
            PlayerError::Unsupported("libva.so.2 is not available".to_string())
        })?;
        Ok(Self { lib, display, mode })
    }

    /// Exports `surface` and synchronizes it for read access.
    ///
    /// The returned descriptor owns the exported fds. Contract: the surface
    /// format must be NV12; any other format is a fatal configuration
    /// mismatch (the render shader hard-codes NV12 plane semantics).
    pub fn export(&self, surface: VaSurface) -> Result<SurfaceDescriptor, PlayerError> {
        let mut raw: RawPrimeDescriptor = unsafe { std::mem::zeroed() };

        let status = unsafe {
            (self.lib.va_export_surface_handle)(
                self.display.raw(),
                surface.0,
                VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2,
                VA_EXPORT_SURFACE_READ_ONLY | self.mode.export_flags(),
                &mut raw as *mut RawPrimeDescriptor as *mut c_void,
            )
        };
        if status != VA_STATUS_SUCCESS {
            return Err(PlayerError::Export(format!(
                "vaExportSurfaceHandle: {}",
                va_error_message(self.lib, status)
            )));
        }

        // Take ownership of the exported fds first so every error path below
        // still closes them exactly once.
        let num_objects = raw.num_objects.min(4) as usize;
        let objects: Vec<MemoryObject> = raw.objects[..num_objects]
            .iter()
            .map(|o| MemoryObject {
                fd: unsafe { OwnedFd::from_raw_fd(o.fd) },
                size: o.size,
                modifier: o.drm_format_modifier,
            })
            .collect();

        if raw.fourcc != VA_FOURCC_NV12 {
            return Err(PlayerError::Export(format!(
                "surface format is {:#010x}, only NV12 is supported",
                raw.fourcc
            )));
        }

        // The surface must be synchronized before read access is valid.
        let status = unsafe { (self.lib.va_sync_surface)(self.display.raw(), surface.0) };
        if status != VA_STATUS_SUCCESS {
            return Err(PlayerError::Export(format!(
                "vaSyncSurface: {}",
                va_error_message(self.lib, status)
            )));
        }

        let num_layers = raw.num_layers.min(4);
        let planes = resolve_planes(self.mode, &raw.layers, num_layers)
            .map_err(PlayerError::Export)?;

        for plane in &planes {
            if plane.object_index as usize >= objects.len() {
                return Err(PlayerError::Export(format!(
                    "plane references object {} but only {} exported",
                    plane.object_index,
                    objects.len()
                )));
            }
        }

        tracing::trace!(
            "exported surface {:#x}: {}x{}, {} objects, mode {:?}",
            surface.0,
            raw.width,
            raw.height,
            objects.len(),
            self.mode
        );

        Ok(SurfaceDescriptor {
            width: raw.width,
            height: raw.height,
            objects,
            planes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_constants() {
        assert_eq!(VA_FOURCC_NV12, 0x3231_564E);
        assert_eq!(DRM_FORMAT_R8, 0x2020_3852);
        assert_eq!(DRM_FORMAT_GR88, 0x3838_5247);
    }

    fn layer(drm_format: u32, num_planes: u32) -> RawPrimeLayer {
        RawPrimeLayer {
            drm_format,
            num_planes,
            object_index: [0, 1, 0, 0],
            offset: [0, 4096, 0, 0],
            pitch: [1280, 1280, 0, 0],
        }
    }

    #[test]
    fn test_resolve_separate_layers() {
        let layers = [
            layer(DRM_FORMAT_R8, 1),
            layer(DRM_FORMAT_GR88, 1),
            layer(0, 0),
            layer(0, 0),
        ];
        let planes = resolve_planes(LayerMode::SeparateLayers, &layers, 2).unwrap();
        assert_eq!(planes[0].drm_format, DRM_FORMAT_R8);
        assert_eq!(planes[1].drm_format, DRM_FORMAT_GR88);
        // Separate layers always address plane 0 of each layer.
        assert_eq!(planes[0].object_index, 0);
        assert_eq!(planes[1].object_index, 0);
        assert_eq!(planes[0].offset, 0);
        assert_eq!(planes[1].offset, 0);
    }

    #[test]
    fn test_resolve_separate_layers_rejects_wrong_format() {
        let layers = [
            layer(DRM_FORMAT_GR88, 1), // luma layer carrying the chroma format
            layer(DRM_FORMAT_R8, 1),
            layer(0, 0),
            layer(0, 0),
        ];
        let err = resolve_planes(LayerMode::SeparateLayers, &layers, 2).unwrap_err();
        assert!(err.contains("layer 0"));
    }

    #[test]
    fn test_resolve_composed_layers() {
        let layers = [layer(VA_FOURCC_NV12, 2), layer(0, 0), layer(0, 0), layer(0, 0)];
        let planes = resolve_planes(LayerMode::ComposedLayers, &layers, 1).unwrap();
        // Composed mode walks the planes of layer 0.
        assert_eq!(planes[0].object_index, 0);
        assert_eq!(planes[1].object_index, 1);
        assert_eq!(planes[0].offset, 0);
        assert_eq!(planes[1].offset, 4096);
        assert_eq!(planes[0].drm_format, DRM_FORMAT_R8);
        assert_eq!(planes[1].drm_format, DRM_FORMAT_GR88);
    }

    #[test]
    fn test_resolve_composed_rejects_plane_count() {
        let layers = [layer(VA_FOURCC_NV12, 3), layer(0, 0), layer(0, 0), layer(0, 0)];
        assert!(resolve_planes(LayerMode::ComposedLayers, &layers, 1).is_err());
    }

    #[test]
    fn test_resolve_separate_requires_two_layers() {
        let layers = [layer(DRM_FORMAT_R8, 1), layer(0, 0), layer(0, 0), layer(0, 0)];
        assert!(resolve_planes(LayerMode::SeparateLayers, &layers, 1).is_err());
    }
}
