//! Vulkan texture management
//!
//! A `Texture` owns one image, its memory, a sampled-image view, and a
//! sampler, plus the pending-acquire state used when the image's last writer
//! and next reader run on different queue families. Layout transitions go
//! through the fixed table in [`crate::barrier::layout_transition_masks`].

use crate::barrier::{
    layout_transition_masks, ImageBarrier, PendingAcquire, PendingAcquireSlot, PendingBarrier,
    ResourceBarrier,
};
use crate::buffer::find_memory_type;
use crate::command::CommandBuffer;
use crate::error::{VulkanError, VulkanResult};
use ash::{vk, Device};

/// Descriptor for texture creation
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc {
    /// Texture dimensions
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
}

/// Sampled texture with image, view, sampler, and pending-barrier state
pub struct Texture {
    device: Device,
    image: vk::Image,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
    format: vk::Format,
    layout: vk::ImageLayout,
    pending_acquire: PendingAcquireSlot,
}

impl Texture {
    /// Create an uninitialized sampled texture (layout undefined)
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &TextureDesc,
    ) -> VulkanResult<Self> {
        let image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe {
            device
                .create_image(&image_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let memory_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            memory_properties,
            memory_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let memory_allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&memory_allocate_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        let image_view_create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let image_view = unsafe {
            device
                .create_image_view(&image_view_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let sampler_create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        let sampler = unsafe {
            device
                .create_sampler(&sampler_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            image,
            image_view,
            sampler,
            memory,
            extent: desc.extent,
            format: desc.format,
            layout: vk::ImageLayout::UNDEFINED,
            pending_acquire: PendingAcquireSlot::new(),
        })
    }

    /// Record a layout transition on the given command buffer
    ///
    /// Only the pairs enumerated in the transition table are supported; any
    /// other combination is an `UnsupportedLayoutTransition` error. When
    /// `dst_queue_family` is given and differs from the recording queue's
    /// family, the transition splits into a release recorded here (ending
    /// access forced to none, since the access is only meaningful on the
    /// destination queue) and a pending acquire stored on this texture for
    /// the next consumer.
    pub fn transition_layout(
        &mut self,
        command_buffer: &mut CommandBuffer,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
        dst_queue_family: Option<u32>,
    ) -> VulkanResult<()> {
        let masks = layout_transition_masks(from, to)?;
        let src_queue_family = command_buffer.queue_family();

        match dst_queue_family {
            Some(dst_family) if dst_family != src_queue_family => {
                let release = PendingBarrier {
                    src_stage: masks.src_stage,
                    dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    barrier: ResourceBarrier::Image(ImageBarrier {
                        image: self.image,
                        src_access: masks.src_access,
                        dst_access: vk::AccessFlags::empty(),
                        old_layout: from,
                        new_layout: to,
                        src_queue_family,
                        dst_queue_family: dst_family,
                        aspect_mask: masks.aspect_mask,
                    }),
                };
                command_buffer.record_barrier(&release);

                let acquire = PendingBarrier {
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: masks.dst_stage,
                    barrier: ResourceBarrier::Image(ImageBarrier {
                        image: self.image,
                        src_access: vk::AccessFlags::empty(),
                        dst_access: masks.dst_access,
                        old_layout: from,
                        new_layout: to,
                        src_queue_family,
                        dst_queue_family: dst_family,
                        aspect_mask: masks.aspect_mask,
                    }),
                };
                self.pending_acquire.store(PendingAcquire {
                    barrier: acquire,
                    release_fence: Some(command_buffer.fence_for_wait()),
                });
            }
            _ => {
                let barrier = PendingBarrier {
                    src_stage: masks.src_stage,
                    dst_stage: masks.dst_stage,
                    barrier: ResourceBarrier::Image(ImageBarrier {
                        image: self.image,
                        src_access: masks.src_access,
                        dst_access: masks.dst_access,
                        old_layout: from,
                        new_layout: to,
                        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        aspect_mask: masks.aspect_mask,
                    }),
                };
                command_buffer.record_barrier(&barrier);
            }
        }

        self.layout = to;
        Ok(())
    }

    /// One-shot hand-off of the pending acquire barrier
    ///
    /// Waits on the releasing submission's fence first, when known.
    pub fn take_pending_acquire(&mut self) -> VulkanResult<Option<PendingBarrier>> {
        let Some(pending) = self.pending_acquire.take() else {
            return Ok(None);
        };

        if let Some(fence) = pending.release_fence {
            unsafe {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(VulkanError::Api)?;
            }
        }
        Ok(Some(pending.barrier))
    }

    /// Whether a pending acquire is outstanding
    pub fn has_pending_acquire(&self) -> bool {
        self.pending_acquire.is_pending()
    }

    /// Note that the releasing submission has already been waited on
    ///
    /// Call this before the releasing command buffer (and its fence) is
    /// destroyed; the pending acquire barrier itself remains outstanding.
    pub fn mark_release_complete(&mut self) {
        self.pending_acquire.clear_release_fence();
    }

    /// Get the image handle
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Get the image view for descriptor set binding
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Get the sampler for descriptor set binding
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Get texture dimensions
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get pixel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Layout the texture was last transitioned to
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.image_view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
