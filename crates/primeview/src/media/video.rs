//! Shared playback types.

use std::fmt;

/// Errors from the playback pipeline.
///
/// Every variant is fatal: the pipeline has no transient failure class.
/// Decoder "need more input" and end-of-stream conditions are control flow
/// ([`super::decoder::DecodeStatus`]), not errors. The variant message names
/// the operation that failed.
#[derive(Debug)]
pub enum PlayerError {
    /// Failed to open the input or find a video stream
    Open(String),
    /// Decoder or hardware device setup failed
    DecoderInit(String),
    /// Decode submit/receive error
    Decode(String),
    /// DRM-PRIME surface export failed or produced an unusable layout
    Export(String),
    /// Vulkan DMABuf import failed
    Import(String),
    /// GPU device, surface, or pipeline error
    Gpu(String),
    /// Required platform capability is missing (never retried)
    Unsupported(String),
}

impl fmt::Display for PlayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerError::Open(msg) => write!(f, "failed to open input: {msg}"),
            PlayerError::DecoderInit(msg) => write!(f, "decoder initialization failed: {msg}"),
            PlayerError::Decode(msg) => write!(f, "decode failed: {msg}"),
            PlayerError::Export(msg) => write!(f, "surface export failed: {msg}"),
            PlayerError::Import(msg) => write!(f, "image import failed: {msg}"),
            PlayerError::Gpu(msg) => write!(f, "GPU error: {msg}"),
            PlayerError::Unsupported(msg) => write!(f, "unsupported configuration: {msg}"),
        }
    }
}

impl std::error::Error for PlayerError {}

/// Frame-skip aggressiveness of the decoder.
///
/// Changes apply to subsequently decoded frames only; frames already decoded
/// or displayed are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameSkip {
    /// Decode every frame
    #[default]
    DecodeAll,
    /// Skip frames no other frame depends on
    NonReference,
    /// Skip everything except key frames
    KeyFramesOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_operation() {
        let err = PlayerError::Export("vaExportSurfaceHandle returned 1".to_string());
        let msg = err.to_string();
        assert!(msg.contains("surface export"));
        assert!(msg.contains("vaExportSurfaceHandle"));

        let err = PlayerError::Import("vkAllocateMemory failed".to_string());
        assert!(err.to_string().contains("image import"));
    }

    #[test]
    fn test_frame_skip_default() {
        assert_eq!(FrameSkip::default(), FrameSkip::DecodeAll);
    }
}
