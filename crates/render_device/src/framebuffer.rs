//! Framebuffer management
//!
//! Handles Vulkan framebuffer creation and management following RAII
//! principles. `SwapchainFramebuffers` keeps one framebuffer per swapchain
//! image together with the shared depth attachment, and rebuilds the whole
//! set when the swapchain is recreated.

use crate::barrier::{layout_transition_masks, ImageBarrier, PendingBarrier, ResourceBarrier};
use crate::buffer::find_memory_type;
use crate::command::CommandBuffer;
use crate::error::{VulkanError, VulkanResult};
use crate::render_pass::DEPTH_FORMAT;
use crate::swapchain::Swapchain;
use ash::{vk, Device};

/// Framebuffer wrapper with RAII cleanup
pub struct Framebuffer {
    device: Device,
    framebuffer: vk::Framebuffer,
}

impl Framebuffer {
    /// Create a new framebuffer
    pub fn new(
        device: Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe {
            device
                .create_framebuffer(&framebuffer_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            framebuffer,
        })
    }

    /// Get the framebuffer handle
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
        }
    }
}

/// Depth buffer wrapper with RAII cleanup
pub struct DepthBuffer {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    image_view: vk::ImageView,
}

impl DepthBuffer {
    /// Create a new depth buffer
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(DEPTH_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
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

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
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
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
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

        Ok(Self {
            device,
            image,
            memory,
            image_view,
        })
    }

    /// Record the one-time transition out of `UNDEFINED` into the depth
    /// attachment layout
    ///
    /// The forward pass clears depth on load, so this runs once per depth
    /// buffer rather than per frame. Same-queue, so no ownership transfer.
    pub fn record_initial_transition(
        &self,
        command_buffer: &mut CommandBuffer,
    ) -> VulkanResult<()> {
        let from = vk::ImageLayout::UNDEFINED;
        let to = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        let masks = layout_transition_masks(from, to)?;
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
        Ok(())
    }

    /// Get the image view handle
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.image_view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// One framebuffer per swapchain image, plus the shared depth attachment
///
/// The set remembers which render pass it was built for so a rebuild after
/// swapchain recreation reproduces the same attachment wiring at the new
/// extent.
pub struct SwapchainFramebuffers {
    device: Device,
    render_pass: vk::RenderPass,
    depth_buffer: DepthBuffer,
    framebuffers: Vec<Framebuffer>,
    extent: vk::Extent2D,
}

impl SwapchainFramebuffers {
    /// Build framebuffers for every image in the swapchain
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        render_pass: vk::RenderPass,
        swapchain: &Swapchain,
    ) -> VulkanResult<Self> {
        let extent = swapchain.extent();
        let depth_buffer = DepthBuffer::new(device.clone(), memory_properties, extent)?;
        let framebuffers =
            Self::build_framebuffers(&device, render_pass, swapchain, &depth_buffer)?;

        Ok(Self {
            device,
            render_pass,
            depth_buffer,
            framebuffers,
            extent,
        })
    }

    /// Rebuild the set after the swapchain was recreated
    pub fn rebuild(
        &mut self,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        swapchain: &Swapchain,
    ) -> VulkanResult<()> {
        self.framebuffers.clear();
        self.extent = swapchain.extent();
        self.depth_buffer =
            DepthBuffer::new(self.device.clone(), memory_properties, self.extent)?;
        self.framebuffers = Self::build_framebuffers(
            &self.device,
            self.render_pass,
            swapchain,
            &self.depth_buffer,
        )?;
        Ok(())
    }

    fn build_framebuffers(
        device: &Device,
        render_pass: vk::RenderPass,
        swapchain: &Swapchain,
        depth_buffer: &DepthBuffer,
    ) -> VulkanResult<Vec<Framebuffer>> {
        swapchain
            .image_views()
            .iter()
            .map(|&color_view| {
                let attachments = [color_view, depth_buffer.image_view()];
                Framebuffer::new(
                    device.clone(),
                    render_pass,
                    &attachments,
                    swapchain.extent(),
                )
            })
            .collect()
    }

    /// Framebuffer for the given swapchain image index
    pub fn get(&self, image_index: u32) -> VulkanResult<&Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!(
                    "framebuffer index {} out of range ({} framebuffers)",
                    image_index,
                    self.framebuffers.len()
                ),
            })
    }

    /// Shared depth attachment backing every framebuffer in the set
    pub fn depth_buffer(&self) -> &DepthBuffer {
        &self.depth_buffer
    }

    /// Extent the set was last built at
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of framebuffers in the set
    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}
