//! Zero-copy DMABuf import into wgpu via Vulkan external memory.
//!
//! Each exported NV12 plane becomes its own single-channel `VkImage` bound
//! directly to the decoder's memory - no pixel copy anywhere:
//!
//! 1. Create a `VkImage` with `VkExternalMemoryImageCreateInfo` (DMA_BUF handle type)
//! 2. Import the plane's fd via `VkImportMemoryFdInfoKHR`
//! 3. Bind the imported memory and transition the image to
//!    `SHADER_READ_ONLY_OPTIMAL`, acquiring it from `VK_QUEUE_FAMILY_EXTERNAL`
//! 4. Wrap the raw image with wgpu-hal so the render pipeline can sample it
//!
//! Tiled buffers (non-linear DRM modifier) and planes at non-zero offsets use
//! `VK_EXT_image_drm_format_modifier` with an explicit plane layout; without
//! it, Vulkan would bind the memory at offset 0 and sample the wrong bytes.
//!
//! The imported texture is frame-scoped. Vulkan consumes a duplicate of the
//! exported fd, and the texture's drop callback destroys the image and frees
//! the imported memory, so the caller can (and must) release its own fd right
//! after import succeeds.
//!
//! Import failure means a platform or driver mismatch, never a transient
//! condition: it is fatal and is not retried.

use std::ffi::CStr;
use std::os::fd::AsRawFd;

use ash::vk;

use super::vaapi::{SurfaceDescriptor, DRM_FORMAT_MOD_LINEAR};
use super::video::PlayerError;

/// Extensions required for DMABuf import.
const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";
const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";
const EXT_IMAGE_DRM_FORMAT_MODIFIER: &CStr = c"VK_EXT_image_drm_format_modifier";

/// Checks that the device runs on Vulkan with the DMABuf import extensions
/// enabled. Called once at startup; a `false` here is fatal for this pipeline.
pub fn dmabuf_import_available(device: &wgpu::Device) -> bool {
    unsafe {
        device.as_hal::<wgpu::hal::api::Vulkan, _, bool>(|hal_device| {
            let Some(hal_device) = hal_device else {
                return false;
            };
            let extensions = hal_device.enabled_device_extensions();
            extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                && extensions.contains(&KHR_EXTERNAL_MEMORY_FD)
        })
    }
}

/// Per-plane import geometry: (width, height, wgpu format, Vulkan format).
///
/// Plane 0 is full-resolution luma, plane 1 is half-resolution interleaved
/// chroma; odd dimensions round up.
fn plane_spec(
    surface_width: u32,
    surface_height: u32,
    plane_index: usize,
) -> (u32, u32, wgpu::TextureFormat, vk::Format) {
    match plane_index {
        0 => (
            surface_width,
            surface_height,
            wgpu::TextureFormat::R8Unorm,
            vk::Format::R8_UNORM,
        ),
        _ => (
            surface_width.div_ceil(2),
            surface_height.div_ceil(2),
            wgpu::TextureFormat::Rg8Unorm,
            vk::Format::R8G8_UNORM,
        ),
    }
}

/// Finds a memory type index satisfying the image's requirements.
fn find_memory_type_index(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits_req: u32,
    flags_req: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mem_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    (0..mem_properties.memory_type_count).find(|&i| {
        let is_required_type = type_bits_req & (1 << i) != 0;
        let has_required_flags = mem_properties
            .memory_types
            .get(i as usize)
            .map(|mt| mt.property_flags & flags_req == flags_req)
            .unwrap_or(false);
        is_required_type && has_required_flags
    })
}

/// One-shot layout transition for an externally imported image.
///
/// Imported memory starts in `UNDEFINED` layout owned by
/// `VK_QUEUE_FAMILY_EXTERNAL`; before sampling it must be acquired by our
/// queue family and moved to `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Safety
///
/// `vk_device`, `vk_queue` and `vk_image` must be valid and belong together;
/// `queue_family_index` must be the family of `vk_queue`.
unsafe fn transition_image_layout_external(
    vk_device: &ash::Device,
    vk_queue: vk::Queue,
    queue_family_index: u32,
    vk_image: vk::Image,
) -> Result<(), PlayerError> {
    let import_err = |msg: String| PlayerError::Import(msg);

    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let command_pool = vk_device
        .create_command_pool(&pool_info, None)
        .map_err(|e| import_err(format!("vkCreateCommandPool: {e:?}")))?;

    let result = (|| {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = vk_device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| import_err(format!("vkAllocateCommandBuffers: {e:?}")))?;
        let cmd_buf = *command_buffers
            .first()
            .ok_or_else(|| import_err("no command buffer allocated".to_string()))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_device
            .begin_command_buffer(cmd_buf, &begin_info)
            .map_err(|e| import_err(format!("vkBeginCommandBuffer: {e:?}")))?;

        // VK_QUEUE_FAMILY_EXTERNAL = ~1u32
        const VK_QUEUE_FAMILY_EXTERNAL: u32 = !1u32;

        let image_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(VK_QUEUE_FAMILY_EXTERNAL)
            .dst_queue_family_index(queue_family_index)
            .image(vk_image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        vk_device.cmd_pipeline_barrier(
            cmd_buf,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[image_barrier],
        );

        vk_device
            .end_command_buffer(cmd_buf)
            .map_err(|e| import_err(format!("vkEndCommandBuffer: {e:?}")))?;

        let cmd_bufs = [cmd_buf];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence = vk_device
            .create_fence(&vk::FenceCreateInfo::default(), None)
            .map_err(|e| import_err(format!("vkCreateFence: {e:?}")))?;

        let submit_result = vk_device
            .queue_submit(vk_queue, &[submit_info], fence)
            .map_err(|e| import_err(format!("vkQueueSubmit: {e:?}")))
            .and_then(|_| {
                vk_device
                    .wait_for_fences(&[fence], true, 1_000_000_000)
                    .map_err(|e| import_err(format!("layout transition timed out: {e:?}")))
            });

        vk_device.destroy_fence(fence, None);
        submit_result
    })();

    vk_device.destroy_command_pool(command_pool, None);
    result
}

/// Imports one plane of an exported surface as a `wgpu::Texture` (zero-copy).
///
/// The plane's fd is duplicated and the duplicate's ownership passes to
/// Vulkan; the caller keeps (and later closes) the original. The returned
/// texture references the decoder's memory directly - it must be dropped
/// before the next surface export is requested, never cached across frames.
///
/// # Safety
///
/// - `device` must be a Vulkan-backend device with the DMABuf extensions
///   enabled (see [`dmabuf_import_available`])
/// - the descriptor's memory must stay valid until the returned texture and
///   everything sampling it are dropped
pub unsafe fn import_plane(
    device: &wgpu::Device,
    descriptor: &SurfaceDescriptor,
    plane_index: usize,
) -> Result<wgpu::Texture, PlayerError> {
    let plane = descriptor.plane(plane_index);
    let object = descriptor.object_for_plane(plane_index);
    let (width, height, wgpu_format, vk_format) =
        plane_spec(descriptor.width, descriptor.height, plane_index);

    // Vulkan takes ownership of the fd it imports, so hand it a duplicate and
    // leave the descriptor's own fd untouched.
    let plane_fd = libc::dup(object.fd.as_raw_fd());
    if plane_fd < 0 {
        return Err(PlayerError::Import(format!(
            "dup of DMABuf fd failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let modifier = object.modifier;
    let offset = plane.offset as u64;
    let pitch = plane.pitch as u64;

    // Ownership of plane_fd moves to Vulkan once vkAllocateMemory succeeds;
    // from then on freeing the memory releases it and we must not close it.
    let mut fd_consumed = false;

    let hal_texture_result = device
        .as_hal::<wgpu::hal::api::Vulkan, _, Result<wgpu::hal::vulkan::Texture, PlayerError>>(
            |hal_device| {
                let Some(hal_device) = hal_device else {
                    return Err(PlayerError::Unsupported(
                        "wgpu is not using the Vulkan backend".to_string(),
                    ));
                };

                let extensions = hal_device.enabled_device_extensions();
                if !extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                    || !extensions.contains(&KHR_EXTERNAL_MEMORY_FD)
                {
                    return Err(PlayerError::Unsupported(
                        "VK_EXT_external_memory_dma_buf / VK_KHR_external_memory_fd not enabled"
                            .to_string(),
                    ));
                }
                let has_drm_modifier = extensions.contains(&EXT_IMAGE_DRM_FORMAT_MODIFIER);

                // An explicit plane layout is needed whenever the buffer is
                // tiled or the plane does not start at offset 0; plain LINEAR
                // tiling binds at offset 0 only.
                let use_drm_modifier =
                    has_drm_modifier && (modifier != DRM_FORMAT_MOD_LINEAR || offset != 0);

                tracing::trace!(
                    "importing plane {plane_index}: fd={plane_fd} {width}x{height} {wgpu_format:?} \
                     offset={offset} pitch={pitch} modifier={modifier:#x} explicit_layout={use_drm_modifier}"
                );

                let vk_device = hal_device.raw_device();
                let physical_device = hal_device.raw_physical_device();
                let instance = hal_device.shared_instance().raw_instance();
                let vk_queue = hal_device.raw_queue();
                let queue_family_index = hal_device.queue_family_index();

                let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
                    .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

                let plane_layout;
                let mut drm_modifier_info;

                let mut image_create_info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk_format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .usage(vk::ImageUsageFlags::SAMPLED)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .push_next(&mut external_memory_info);

                if use_drm_modifier {
                    plane_layout = vk::SubresourceLayout {
                        offset,
                        size: 0, // must be zero for explicit modifier layouts
                        row_pitch: pitch,
                        array_pitch: 0,
                        depth_pitch: 0,
                    };
                    drm_modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                        .drm_format_modifier(modifier)
                        .plane_layouts(std::slice::from_ref(&plane_layout));
                    image_create_info = image_create_info
                        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                        .push_next(&mut drm_modifier_info);
                } else if modifier == DRM_FORMAT_MOD_LINEAR {
                    if offset != 0 {
                        return Err(PlayerError::Unsupported(format!(
                            "plane offset {offset} requires VK_EXT_image_drm_format_modifier"
                        )));
                    }
                    image_create_info = image_create_info.tiling(vk::ImageTiling::LINEAR);
                } else {
                    return Err(PlayerError::Unsupported(format!(
                        "tiled DMABuf (modifier {modifier:#x}) requires VK_EXT_image_drm_format_modifier"
                    )));
                }

                let vk_image = vk_device
                    .create_image(&image_create_info, None)
                    .map_err(|e| PlayerError::Import(format!("vkCreateImage: {e:?}")))?;

                let mem_requirements = vk_device.get_image_memory_requirements(vk_image);

                let mut import_memory_info = vk::ImportMemoryFdInfoKHR::default()
                    .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                    .fd(plane_fd);

                let memory_type_index = find_memory_type_index(
                    instance,
                    physical_device,
                    mem_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )
                .or_else(|| {
                    find_memory_type_index(
                        instance,
                        physical_device,
                        mem_requirements.memory_type_bits,
                        vk::MemoryPropertyFlags::empty(),
                    )
                })
                .ok_or_else(|| {
                    vk_device.destroy_image(vk_image, None);
                    PlayerError::Import("no suitable memory type for DMABuf import".to_string())
                })?;

                let memory_allocate_info = vk::MemoryAllocateInfo::default()
                    .allocation_size(mem_requirements.size)
                    .memory_type_index(memory_type_index)
                    .push_next(&mut import_memory_info);

                let device_memory = vk_device
                    .allocate_memory(&memory_allocate_info, None)
                    .map_err(|e| {
                        vk_device.destroy_image(vk_image, None);
                        PlayerError::Import(format!("vkAllocateMemory (fd import): {e:?}"))
                    })?;
                fd_consumed = true;

                vk_device
                    .bind_image_memory(vk_image, device_memory, 0)
                    .map_err(|e| {
                        vk_device.free_memory(device_memory, None);
                        vk_device.destroy_image(vk_image, None);
                        PlayerError::Import(format!("vkBindImageMemory: {e:?}"))
                    })?;

                transition_image_layout_external(
                    vk_device,
                    vk_queue,
                    queue_family_index,
                    vk_image,
                )
                .inspect_err(|_| {
                    vk_device.free_memory(device_memory, None);
                    vk_device.destroy_image(vk_image, None);
                })?;

                let texture_desc = wgpu::hal::TextureDescriptor {
                    label: Some("imported video plane"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format,
                    usage: wgpu::hal::TextureUses::RESOURCE,
                    memory_flags: wgpu::hal::MemoryFlags::empty(),
                    view_formats: vec![],
                };

                // Frees the imported Vulkan resources once wgpu is done with
                // the texture; the image must go before the memory.
                let device_clone = vk_device.clone();
                let drop_callback = Box::new(move || unsafe {
                    device_clone.destroy_image(vk_image, None);
                    device_clone.free_memory(device_memory, None);
                });

                Ok(wgpu::hal::vulkan::Device::texture_from_raw(
                    vk_image,
                    &texture_desc,
                    Some(drop_callback),
                ))
            },
        );

    let hal_texture = match hal_texture_result {
        Ok(t) => t,
        Err(e) => {
            if !fd_consumed {
                libc::close(plane_fd);
            }
            return Err(e);
        }
    };

    let texture_desc = wgpu::TextureDescriptor {
        label: Some("imported video plane"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu_format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    };

    Ok(device.create_texture_from_hal::<wgpu::hal::api::Vulkan>(hal_texture, &texture_desc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_spec_luma_full_resolution() {
        let (w, h, format, vk_fmt) = plane_spec(1280, 720, 0);
        assert_eq!((w, h), (1280, 720));
        assert_eq!(format, wgpu::TextureFormat::R8Unorm);
        assert_eq!(vk_fmt, vk::Format::R8_UNORM);
    }

    #[test]
    fn test_plane_spec_chroma_half_resolution() {
        let (w, h, format, vk_fmt) = plane_spec(1280, 720, 1);
        assert_eq!((w, h), (640, 360));
        assert_eq!(format, wgpu::TextureFormat::Rg8Unorm);
        assert_eq!(vk_fmt, vk::Format::R8G8_UNORM);
    }

    #[test]
    fn test_plane_spec_chroma_rounds_up_odd_dimensions() {
        let (w, h, _, _) = plane_spec(1279, 719, 1);
        assert_eq!((w, h), (640, 360));
    }
}
