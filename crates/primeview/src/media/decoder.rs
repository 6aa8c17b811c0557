//! FFmpeg-based VA-API video decoder.
//!
//! Demuxes the input container and decodes the selected video stream on the
//! GPU through libavcodec's VA-API hwaccel. Decoded frames stay in GPU memory;
//! [`VaapiDecoder::decode_next`] hands out an opaque [`VaSurface`] handle that
//! the exporter turns into DRM-PRIME fds.
//!
//! The decoder follows libavcodec's send/receive model:
//!
//! - `EAGAIN` from `receive_frame` means "feed another packet" and maps to
//!   [`DecodeStatus::Again`], so the caller re-polls window events between
//!   packet reads.
//! - Demuxer end-of-stream switches the decoder into draining: EOF is sent to
//!   the codec and buffered frames keep coming out until the codec reports EOF.
//! - A single submitted packet may yield multiple frames; a new packet is
//!   requested only after `receive_frame` reports `EAGAIN`.

use std::ffi::CString;
use std::ptr;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use super::vaapi::{AvVaapiDeviceContext, VaDisplayHandle, VaSurface};
use super::video::{FrameSkip, PlayerError};

/// Output format negotiation callback: we don't negotiate, we just want VA-API.
unsafe extern "C" fn get_vaapi_format(
    _ctx: *mut ffi::AVCodecContext,
    _pix_fmts: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    ffi::AVPixelFormat::AV_PIX_FMT_VAAPI
}

/// RAII wrapper for the VA-API hardware device context buffer reference.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDeviceCtx {
    /// Creates a VA-API device context, opening `device` (a DRM render node
    /// path such as `/dev/dri/renderD128`) or the platform default.
    fn new(device: Option<&str>) -> Result<Self, PlayerError> {
        let device_cstr = device
            .map(CString::new)
            .transpose()
            .map_err(|_| PlayerError::DecoderInit("render device path contains NUL".to_string()))?;

        let mut hw_device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut hw_device_ctx,
                ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
                device_cstr
                    .as_ref()
                    .map_or(ptr::null(), |c| c.as_ptr()),
                ptr::null_mut(), // opts
                0,               // flags
            )
        };

        if ret < 0 || hw_device_ctx.is_null() {
            return Err(PlayerError::DecoderInit(format!(
                "av_hwdevice_ctx_create (VAAPI, device {:?}) failed: {ret}",
                device.unwrap_or("<default>")
            )));
        }

        Ok(Self { ptr: hw_device_ctx })
    }

    fn as_ptr(&self) -> *mut ffi::AVBufferRef {
        self.ptr
    }

    /// The `VADisplay` owned by this device context.
    ///
    /// Valid for the lifetime of the context; the exporter borrows it for
    /// `vaSyncSurface`/`vaExportSurfaceHandle`.
    fn va_display(&self) -> VaDisplayHandle {
        unsafe {
            let hwctx = (*self.ptr).data as *mut ffi::AVHWDeviceContext;
            let vactx = (*hwctx).hwctx as *mut AvVaapiDeviceContext;
            VaDisplayHandle::new((*vactx).display)
        }
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                ffi::av_buffer_unref(&mut self.ptr);
            }
        }
    }
}

// SAFETY: HwDeviceCtx has exclusive ownership of the AVBufferRef and is only
// touched from the single playback thread.
unsafe impl Send for HwDeviceCtx {}

/// Stream properties captured at open time.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Coded (visible) width in pixels
    pub width: u32,
    /// Coded (visible) height in pixels
    pub height: u32,
    /// Codec name, for diagnostics
    pub codec: String,
    /// Average frame rate, for diagnostics
    pub frame_rate: f64,
}

/// Snapshot of one decoded frame.
///
/// The surface handle stays valid until the next `decode_next` call, which
/// may hand the underlying frame buffer back to the decoder.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceFrame {
    /// Opaque hardware surface handle
    pub surface: VaSurface,
    /// Picture type (`I`, `P`, `B`, ...), for diagnostics
    pub pict_type: char,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

/// Result of one decode step.
#[derive(Debug, Clone, Copy)]
pub enum DecodeStatus {
    /// A frame is ready for display
    Frame(SurfaceFrame),
    /// No frame this iteration; a packet was consumed or is needed next time
    Again,
    /// The stream is exhausted and the decoder fully drained
    EndOfStream,
}

/// Hardware video decoder over FFmpeg's VA-API hwaccel.
pub struct VaapiDecoder {
    input: ffmpeg::format::context::Input,
    video_stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    hw_device: HwDeviceCtx,
    /// Reusable frame buffer; `receive_frame` unrefs the previous contents.
    frame: ffmpeg::frame::Video,
    info: StreamInfo,
    want_new_packet: bool,
    draining: bool,
    eof: bool,
    frames_decoded: u64,
    skip: FrameSkip,
}

impl VaapiDecoder {
    /// Opens `path`, selects the best video stream, and sets up hardware
    /// decoding on `device` (or the default render node).
    pub fn open(path: &str, device: Option<&str>) -> Result<Self, PlayerError> {
        ffmpeg::init().map_err(|e| PlayerError::Open(format!("ffmpeg init: {e}")))?;

        let input = ffmpeg::format::input(&path)
            .map_err(|e| PlayerError::Open(format!("{path}: {e}")))?;

        let video_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PlayerError::Open(format!("{path}: no video stream")))?;
        let video_stream_index = video_stream.index();

        let mut context =
            ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
                .map_err(|e| PlayerError::DecoderInit(format!("codec context: {e}")))?;

        let frame_rate = {
            let r = video_stream.avg_frame_rate();
            r.0 as f64 / r.1.max(1) as f64
        };

        let hw_device = HwDeviceCtx::new(device)?;

        // Attach the device context and pin the output format to VA-API
        // before the codec is opened.
        unsafe {
            let ctx_ptr = context.as_mut_ptr();
            (*ctx_ptr).hw_device_ctx = ffi::av_buffer_ref(hw_device.as_ptr());
            (*ctx_ptr).get_format = Some(get_vaapi_format);
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| PlayerError::DecoderInit(format!("open decoder: {e}")))?;

        let info = StreamInfo {
            width: decoder.width(),
            height: decoder.height(),
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            frame_rate,
        };

        tracing::info!(
            "opened {path}: {}x{} {} @ {:.2} fps (VAAPI)",
            info.width,
            info.height,
            info.codec,
            info.frame_rate
        );

        Ok(Self {
            input,
            video_stream_index,
            decoder,
            hw_device,
            frame: ffmpeg::frame::Video::empty(),
            info,
            want_new_packet: true,
            draining: false,
            eof: false,
            frames_decoded: 0,
            skip: FrameSkip::default(),
        })
    }

    /// Stream properties captured at open time.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// The VA display backing this decoder's surfaces.
    pub fn va_display(&self) -> VaDisplayHandle {
        self.hw_device.va_display()
    }

    /// Monotonically increasing count of frames returned by `decode_next`.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Current frame-skip level.
    pub fn frame_skip(&self) -> FrameSkip {
        self.skip
    }

    /// Sets the frame-skip level on the live codec context.
    ///
    /// Only frames decoded after this call are affected.
    pub fn set_frame_skip(&mut self, skip: FrameSkip) {
        if self.skip == skip {
            return;
        }
        self.skip = skip;
        unsafe {
            (*self.decoder.as_mut_ptr()).skip_frame = to_av_discard(skip);
        }
        tracing::info!("frame skip set to {:?}", skip);
    }

    /// Advances decoding by one step.
    ///
    /// Returns the next decoded frame if one is buffered; otherwise reads and
    /// submits one video packet (discarding packets from other streams) and
    /// retries the receive. `Again` means the caller should come back after
    /// its event poll; `EndOfStream` is terminal.
    pub fn decode_next(&mut self) -> Result<DecodeStatus, PlayerError> {
        if self.eof {
            return Ok(DecodeStatus::EndOfStream);
        }

        if self.want_new_packet && !self.draining {
            let mut submitted = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.video_stream_index {
                    // not a video packet
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .map_err(|e| PlayerError::Decode(format!("send_packet: {e}")))?;
                submitted = true;
                break;
            }
            if !submitted {
                // Demuxer end of stream: drain buffered frames out of the codec.
                self.decoder
                    .send_eof()
                    .map_err(|e| PlayerError::Decode(format!("send_eof: {e}")))?;
                self.draining = true;
                tracing::debug!("end of input, draining decoder");
            }
            self.want_new_packet = false;
        }

        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {
                self.frames_decoded += 1;
                Ok(DecodeStatus::Frame(self.surface_frame()))
            }
            Err(ffmpeg::Error::Eof) => {
                self.eof = true;
                Ok(DecodeStatus::EndOfStream)
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                self.want_new_packet = true;
                Ok(DecodeStatus::Again)
            }
            Err(e) => Err(PlayerError::Decode(format!("receive_frame: {e}"))),
        }
    }

    fn surface_frame(&self) -> SurfaceFrame {
        // VA-API frames carry the VASurfaceID in data[3].
        let surface = unsafe { (*self.frame.as_ptr()).data[3] as usize as u32 };
        let pict_type = unsafe { picture_type_char((*self.frame.as_ptr()).pict_type) };
        SurfaceFrame {
            surface: VaSurface(surface),
            pict_type,
            width: self.frame.width(),
            height: self.frame.height(),
        }
    }
}

// SAFETY: all raw pointers are owned by this struct and only accessed from
// the single playback thread.
unsafe impl Send for VaapiDecoder {}

fn to_av_discard(skip: FrameSkip) -> ffi::AVDiscard {
    match skip {
        FrameSkip::DecodeAll => ffi::AVDiscard::AVDISCARD_NONE,
        FrameSkip::NonReference => ffi::AVDiscard::AVDISCARD_NONREF,
        FrameSkip::KeyFramesOnly => ffi::AVDiscard::AVDISCARD_NONKEY,
    }
}

fn picture_type_char(pict_type: ffi::AVPictureType) -> char {
    match pict_type {
        ffi::AVPictureType::AV_PICTURE_TYPE_I => 'I',
        ffi::AVPictureType::AV_PICTURE_TYPE_P => 'P',
        ffi::AVPictureType::AV_PICTURE_TYPE_B => 'B',
        ffi::AVPictureType::AV_PICTURE_TYPE_S => 'S',
        ffi::AVPictureType::AV_PICTURE_TYPE_SI => 'i',
        ffi::AVPictureType::AV_PICTURE_TYPE_SP => 'p',
        ffi::AVPictureType::AV_PICTURE_TYPE_BI => 'b',
        _ => '?',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_skip_maps_to_av_discard() {
        assert_eq!(
            to_av_discard(FrameSkip::DecodeAll),
            ffi::AVDiscard::AVDISCARD_NONE
        );
        assert_eq!(
            to_av_discard(FrameSkip::NonReference),
            ffi::AVDiscard::AVDISCARD_NONREF
        );
        assert_eq!(
            to_av_discard(FrameSkip::KeyFramesOnly),
            ffi::AVDiscard::AVDISCARD_NONKEY
        );
    }

    #[test]
    fn test_picture_type_char() {
        assert_eq!(
            picture_type_char(ffi::AVPictureType::AV_PICTURE_TYPE_I),
            'I'
        );
        assert_eq!(
            picture_type_char(ffi::AVPictureType::AV_PICTURE_TYPE_B),
            'B'
        );
        assert_eq!(
            picture_type_char(ffi::AVPictureType::AV_PICTURE_TYPE_NONE),
            '?'
        );
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = VaapiDecoder::open("/nonexistent/clip.mp4", None);
        assert!(matches!(result, Err(PlayerError::Open(_))));
    }
}
