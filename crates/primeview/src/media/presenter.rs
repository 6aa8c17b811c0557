//! Display buffer presentation under a fixed timing policy.
//!
//! The policy is selected at build time and never renegotiated: either the
//! swap returns immediately (decode/display as fast as possible) or it blocks
//! until the display's next refresh. Acquiring the swapchain image is where
//! the blocking happens; `wgpu::SurfaceTexture::present` queues the swap.

use super::video::PlayerError;

/// Presentation timing policy, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentPolicy {
    /// No refresh synchronization; present as fast as frames decode.
    Immediate,
    /// Synchronize to every display refresh.
    EveryRefresh,
    /// Synchronize to every second refresh (half rate). Known to misbehave in
    /// some driver stacks with unconfirmed root cause, so selecting it is an
    /// error rather than a silently wrong mode.
    EverySecondRefresh,
}

impl PresentPolicy {
    /// Maps the policy onto a swapchain present mode.
    pub fn present_mode(self) -> Result<wgpu::PresentMode, PlayerError> {
        match self {
            PresentPolicy::Immediate => Ok(wgpu::PresentMode::Immediate),
            PresentPolicy::EveryRefresh => Ok(wgpu::PresentMode::Fifo),
            PresentPolicy::EverySecondRefresh => Err(PlayerError::Unsupported(
                "half-rate presentation is not supported".to_string(),
            )),
        }
    }
}

/// Owns the window surface and its configuration.
pub struct Presenter {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl Presenter {
    /// Configures `surface` for the given policy and initial size.
    ///
    /// Picks a non-sRGB surface format: the shader emits gamma-encoded RGB
    /// and must not be re-encoded on scan-out.
    pub fn new(
        surface: wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
        device: &wgpu::Device,
        width: u32,
        height: u32,
        policy: PresentPolicy,
    ) -> Result<Self, PlayerError> {
        let caps = surface.get_capabilities(adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .copied()
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| PlayerError::Gpu("surface reports no formats".to_string()))?;

        let present_mode = policy.present_mode()?;
        if !caps.present_modes.contains(&present_mode) {
            return Err(PlayerError::Unsupported(format!(
                "present mode {present_mode:?} not supported by this surface"
            )));
        }

        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode,
            desired_maximum_frame_latency: 2,
            alpha_mode,
            view_formats: vec![],
        };
        surface.configure(device, &config);

        tracing::info!(
            "surface configured: {}x{} {:?}, present mode {:?}",
            config.width,
            config.height,
            format,
            present_mode
        );

        Ok(Self { surface, config })
    }

    /// Surface pixel format; the render pipeline must target it.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    /// Reconfigures the swapchain after a window resize.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(device, &self.config);
    }

    /// Acquires the next swapchain image, blocking according to the policy.
    ///
    /// An outdated/lost swapchain (a windowing race, typically mid-resize) is
    /// reconfigured and retried once; anything else is fatal.
    pub fn acquire(&mut self, device: &wgpu::Device) -> Result<wgpu::SurfaceTexture, PlayerError> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                self.surface.configure(device, &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| PlayerError::Gpu(format!("surface acquire: {e}")))
            }
            Err(e) => Err(PlayerError::Gpu(format!("surface acquire: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_present_mode_mapping() {
        assert_eq!(
            PresentPolicy::Immediate.present_mode().unwrap(),
            wgpu::PresentMode::Immediate
        );
        assert_eq!(
            PresentPolicy::EveryRefresh.present_mode().unwrap(),
            wgpu::PresentMode::Fifo
        );
    }

    #[test]
    fn test_half_rate_policy_is_rejected() {
        let err = PresentPolicy::EverySecondRefresh.present_mode().unwrap_err();
        assert!(matches!(err, PlayerError::Unsupported(_)));
    }
}
