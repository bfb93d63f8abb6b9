//! Command buffer management
//!
//! A `CommandBuffer` wraps one native recording handle, one queue affinity,
//! one owned fence, and a queue of deferred barriers it must flush before any
//! GPU-visible use. Its status is a finite-state machine: `Reset` ->
//! `Recording` -> `Submitted` -> `Reset`. Protocol violations (re-entering
//! recording while a prior submission may still execute, destroying an
//! in-flight buffer) are programming errors guarded by assertions.

use crate::barrier::{DeferredBarriers, PendingBarrier};
use crate::buffer::DeviceBuffer;
use crate::error::{VulkanError, VulkanResult};
use crate::sync::{Fence, FenceStatus};
use crate::texture::Texture;
use ash::{vk, Device};

/// Logical state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferStatus {
    /// Native handle is reset; recording may begin
    Reset,
    /// Between `begin` and `end`
    Recording,
    /// Submitted to its queue; the owned fence tracks completion
    Submitted,
}

/// Whether a command buffer in this state may be destroyed
///
/// A submitted buffer is destructible only once its fence has been observed
/// signaled or waited-and-reset; anything else may still be executing.
pub fn is_destructible(status: CommandBufferStatus, fence: FenceStatus) -> bool {
    status != CommandBufferStatus::Submitted
        || matches!(fence, FenceStatus::Signaled | FenceStatus::Reset)
}

/// Command pool bound to exactly one queue family
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool for the given queue family
    pub fn new(device: Device, queue_family: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            command_pool,
            queue_family,
        })
    }

    /// Allocate one command buffer bound to this pool's queue family
    ///
    /// The buffer owns a fresh unsignaled fence, so its first `begin` succeeds
    /// without an explicit prior reset.
    pub fn allocate(&self, queue: vk::Queue) -> VulkanResult<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };

        let fence = Fence::new(self.device.clone(), false)?;

        Ok(CommandBuffer {
            device: self.device.clone(),
            pool: self.command_pool,
            buffer: buffers[0],
            queue,
            queue_family: self.queue_family,
            fence,
            status: CommandBufferStatus::Reset,
            deferred: DeferredBarriers::new(),
            bound_vertex: None,
            bound_index: None,
        })
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family all buffers from this pool record for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Parameters for recording one draw inside a render pass
pub struct DrawParams<'a> {
    /// Render pass to begin
    pub render_pass: vk::RenderPass,
    /// Framebuffer to render into
    pub framebuffer: vk::Framebuffer,
    /// Render area / viewport extent
    pub extent: vk::Extent2D,
    /// Graphics pipeline (opaque to this core)
    pub pipeline: vk::Pipeline,
    /// Clear values for the pass attachments
    pub clear_values: &'a [vk::ClearValue],
}

/// Command buffer with owned fence and deferred-barrier queue
pub struct CommandBuffer {
    device: Device,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    queue: vk::Queue,
    queue_family: u32,
    fence: Fence,
    status: CommandBufferStatus,
    deferred: DeferredBarriers,
    bound_vertex: Option<vk::Buffer>,
    bound_index: Option<vk::Buffer>,
}

impl CommandBuffer {
    /// Begin recording
    ///
    /// Only valid from `Reset`; a prior `Submitted` status triggers an
    /// implicit native reset first. Asserts the owned fence was previously
    /// waited-and-reset, so no command buffer re-enters recording while its
    /// prior submission may still be executing.
    pub fn begin(&mut self) -> VulkanResult<()> {
        debug_assert!(
            self.status != CommandBufferStatus::Recording,
            "begin called while already recording"
        );
        debug_assert!(
            self.fence.was_reset(),
            "begin called before the previous submission's fence was waited and reset"
        );

        if self.status == CommandBufferStatus::Submitted {
            unsafe {
                self.device
                    .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                    .map_err(VulkanError::Api)?;
            }
            self.status = CommandBufferStatus::Reset;
        }

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        self.bound_vertex = None;
        self.bound_index = None;
        self.status = CommandBufferStatus::Recording;
        Ok(())
    }

    /// End recording and submit to the bound queue
    ///
    /// Waits on `wait_semaphores` at the color-attachment-output stage,
    /// signals `signal_semaphores` and the owned fence on completion, and
    /// returns the fence so the caller can later wait without polling.
    pub fn end(
        &mut self,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
    ) -> VulkanResult<&mut Fence> {
        debug_assert!(
            self.status == CommandBufferStatus::Recording,
            "end called while not recording"
        );

        unsafe {
            self.device
                .end_command_buffer(self.buffer)
                .map_err(VulkanError::Api)?;
        }

        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let command_buffers = [self.buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal_semaphores);

        // Handing the fence to the submit call invalidates its cached state.
        let fence_handle = self.fence.handle();
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info.build()], fence_handle)
                .map_err(VulkanError::Api)?;
        }

        self.status = CommandBufferStatus::Submitted;
        Ok(&mut self.fence)
    }

    /// Reset the native handle and clear the logical status
    pub fn reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
        }
        self.status = CommandBufferStatus::Reset;
        Ok(())
    }

    /// Record a barrier immediately (used by upload-time transitions)
    pub fn record_barrier(&mut self, barrier: &PendingBarrier) {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        barrier.record(&self.device, self.buffer);
    }

    /// Record a whole-buffer copy
    pub fn copy_buffer(&mut self, src: &DeviceBuffer, dst: &DeviceBuffer, size: vk::DeviceSize) {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            self.device
                .cmd_copy_buffer(self.buffer, src.handle(), dst.handle(), &[region]);
        }
    }

    /// Record a buffer-to-image copy (image must be in transfer-dst layout)
    pub fn copy_buffer_to_image(
        &mut self,
        src: &DeviceBuffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.buffer,
                src.handle(),
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region.build()],
            );
        }
    }

    /// Bind a vertex buffer for the next draw
    ///
    /// Pulls the buffer's pending-acquire barrier, if any, into this command
    /// buffer's deferred queue.
    pub fn bind_vertex_buffer(&mut self, buffer: &mut DeviceBuffer) -> VulkanResult<()> {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        if let Some(pending) = buffer.take_pending_acquire()? {
            self.deferred.push(pending);
        }
        self.bound_vertex = Some(buffer.handle());
        Ok(())
    }

    /// Bind an index buffer for the next draw
    pub fn bind_index_buffer(&mut self, buffer: &mut DeviceBuffer) -> VulkanResult<()> {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        if let Some(pending) = buffer.take_pending_acquire()? {
            self.deferred.push(pending);
        }
        self.bound_index = Some(buffer.handle());
        Ok(())
    }

    /// Pull a texture's pending-acquire barrier into the deferred queue
    ///
    /// Descriptor binding itself is the caller's concern; this only makes the
    /// texture's queue-ownership acquire part of the next flush.
    pub fn bind_texture(&mut self, texture: &mut Texture) -> VulkanResult<()> {
        debug_assert!(self.status == CommandBufferStatus::Recording);
        if let Some(pending) = texture.take_pending_acquire()? {
            self.deferred.push(pending);
        }
        Ok(())
    }

    /// Record one non-indexed draw
    pub fn draw(&mut self, params: &DrawParams, vertex_count: u32) -> VulkanResult<()> {
        self.record_pass(params, |device, buffer| unsafe {
            device.cmd_draw(buffer, vertex_count, 1, 0, 0);
        })
    }

    /// Record one indexed draw
    pub fn draw_indexed(&mut self, params: &DrawParams, index_count: u32) -> VulkanResult<()> {
        debug_assert!(self.bound_index.is_some(), "indexed draw without an index buffer bound");
        self.record_pass(params, |device, buffer| unsafe {
            device.cmd_draw_indexed(buffer, index_count, 1, 0, 0, 0);
        })
    }

    /// Flush deferred barriers, then record a full render pass around `draw_fn`
    ///
    /// Deferred barriers (queue-ownership acquires pulled at bind time) must
    /// land outside an active render pass, so the flush happens immediately
    /// before the pass begins: one pipeline-barrier call per distinct
    /// stage-mask batch, in append order, and the queue is cleared.
    fn record_pass(
        &mut self,
        params: &DrawParams,
        draw_fn: impl FnOnce(&Device, vk::CommandBuffer),
    ) -> VulkanResult<()> {
        debug_assert!(
            self.status == CommandBufferStatus::Recording,
            "draw recorded while not recording"
        );

        let flushed = self.deferred.flush(&self.device, self.buffer);
        if flushed > 0 {
            log::trace!("flushed {} deferred barrier batch(es) before draw", flushed);
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: params.extent,
        };
        let pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(params.render_pass)
            .framebuffer(params.framebuffer)
            .render_area(render_area)
            .clear_values(params.clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                self.buffer,
                &pass_begin,
                vk::SubpassContents::INLINE,
            );
            self.device.cmd_bind_pipeline(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                params.pipeline,
            );

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: params.extent.width as f32,
                height: params.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.cmd_set_viewport(self.buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.buffer, 0, &[render_area]);

            if let Some(vertex_buffer) = self.bound_vertex {
                self.device
                    .cmd_bind_vertex_buffers(self.buffer, 0, &[vertex_buffer], &[0]);
            }
            if let Some(index_buffer) = self.bound_index {
                self.device.cmd_bind_index_buffer(
                    self.buffer,
                    index_buffer,
                    0,
                    vk::IndexType::UINT32,
                );
            }

            draw_fn(&self.device, self.buffer);

            self.device.cmd_end_render_pass(self.buffer);
        }
        Ok(())
    }

    /// Wait for the last submission and reset the owned fence
    pub fn wait_and_reset_fence(&mut self) -> VulkanResult<()> {
        self.fence.wait_and_reset()
    }

    /// Number of deferred barrier batches currently queued
    pub fn pending_barrier_batches(&self) -> usize {
        self.deferred.batch_count()
    }

    /// Current logical status
    pub fn status(&self) -> CommandBufferStatus {
        self.status
    }

    /// Queue family this buffer records for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Fence handle for host-side waits (does not invalidate fence tracking)
    pub fn fence_for_wait(&self) -> vk::Fence {
        self.fence.wait_handle()
    }

    /// Mutable access to the owned fence
    pub fn fence_mut(&mut self) -> &mut Fence {
        &mut self.fence
    }

    /// Get the native handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        debug_assert!(
            is_destructible(self.status, self.fence.status()),
            "command buffer destroyed while possibly in flight; wait on its fence first"
        );
        unsafe {
            self.device.free_command_buffers(self.pool, &[self.buffer]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destructibility_requires_fence_observation_after_submit() {
        // Never submitted: always destructible.
        assert!(is_destructible(
            CommandBufferStatus::Reset,
            FenceStatus::Reset
        ));
        assert!(is_destructible(
            CommandBufferStatus::Recording,
            FenceStatus::UnsignaledOrReset
        ));

        // Submitted: only after the fence was seen signaled or reset.
        assert!(is_destructible(
            CommandBufferStatus::Submitted,
            FenceStatus::Signaled
        ));
        assert!(is_destructible(
            CommandBufferStatus::Submitted,
            FenceStatus::Reset
        ));
        assert!(!is_destructible(
            CommandBufferStatus::Submitted,
            FenceStatus::UnsignaledOrReset
        ));
    }
}
