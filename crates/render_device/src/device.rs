//! Render device orchestration
//!
//! `RenderDevice` owns the whole Vulkan stack in initialization order and
//! drives the per-frame loop: fence backpressure, swapchain acquire with
//! recreate-and-retry, submission, and presentation. Resource uploads go
//! through short-lived command buffers on the dedicated transfer queue when
//! the hardware has one, handing ownership to the graphics queue via the
//! release/acquire protocol on the resources themselves.

use crate::buffer::{
    BufferDesc, BufferUsage, DeviceBuffer, IndexBuffer, UniformBuffer, VertexBuffer,
};
use crate::command::{CommandBuffer, CommandBufferStatus, CommandPool};
use crate::config::RendererConfig;
use crate::context::{QueueFamilies, VulkanContext};
use crate::error::{VulkanError, VulkanResult};
use crate::framebuffer::{Framebuffer, SwapchainFramebuffers};
use crate::logging::{debug, info, warn};
use crate::render_pass::RenderPass;
use crate::swapchain::{Swapchain, SwapchainState};
use crate::sync::FrameSync;
use crate::texture::{Texture, TextureDesc};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::mpsc;
use std::time::Duration;

/// How long teardown waits for the GPU before abandoning the device
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a blocking wait on a helper thread, bounded by `timeout`
///
/// Returns true when the wait finished in time. On timeout the helper thread
/// is detached and keeps running; the caller must not touch whatever the
/// wait was guarding.
pub fn wait_idle_bounded<F>(timeout: Duration, wait: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        wait();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

/// Leak a frame ring whose submissions may still be executing
///
/// Freeing command buffers the GPU may still read is undefined behavior, so
/// when teardown abandons the idle wait the ring is forgotten instead of
/// dropped. The destructors (and their in-flight assertions) never run.
fn leak_frames<T>(frames: &mut Vec<T>) {
    std::mem::forget(std::mem::take(frames));
}

/// Window-size bookkeeping between resize events and swapchain recreation
///
/// A zero-area resize means the window is minimized: the tracker records it
/// and recreation is suppressed until a non-zero size arrives.
#[derive(Debug, Default)]
pub struct ResizeTracker {
    pending: Option<vk::Extent2D>,
    minimized: bool,
}

impl ResizeTracker {
    /// Create a tracker with no pending resize
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a window resize event
    pub fn handle_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.minimized = true;
            self.pending = None;
        } else {
            self.minimized = false;
            self.pending = Some(vk::Extent2D { width, height });
        }
    }

    /// Consume the pending resize, if any
    pub fn take_pending(&mut self) -> Option<vk::Extent2D> {
        self.pending.take()
    }

    /// Whether the window is currently zero-area
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }
}

/// Per-frame ring entry: semaphores plus the frame's command buffer
struct FrameState {
    sync: FrameSync,
    command_buffer: CommandBuffer,
}

/// Top-level owner of the rendering stack
///
/// Field order is teardown order: frames and pools before the swapchain
/// machinery, the context last.
pub struct RenderDevice {
    frames: Vec<FrameState>,
    current_frame: usize,
    framebuffers: SwapchainFramebuffers,
    render_pass: RenderPass,
    swapchain: Swapchain,
    graphics_pool: CommandPool,
    transfer_pool: Option<CommandPool>,
    resize: ResizeTracker,
    window_extent: vk::Extent2D,
    config: RendererConfig,
    context: VulkanContext,
}

impl RenderDevice {
    /// Bring up the full stack for the given window
    pub fn new(
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
        window_extent: vk::Extent2D,
        config: RendererConfig,
    ) -> VulkanResult<Self> {
        let context = VulkanContext::new(window, &config)?;
        let device = context.raw_device();
        let families = context.queue_families();

        let swapchain = Swapchain::new(
            context.instance(),
            device.clone(),
            context.surface.surface,
            &context.surface.loader,
            context.physical_device.device,
            window_extent,
            config.present_mode,
        )?;

        let render_pass = RenderPass::new_forward_pass(device.clone(), swapchain.format().format)?;
        let framebuffers = SwapchainFramebuffers::new(
            device.clone(),
            context.memory_properties(),
            render_pass.handle(),
            &swapchain,
        )?;

        let graphics_pool = CommandPool::new(device.clone(), families.graphics)?;
        let transfer_pool = families
            .transfer
            .map(|family| CommandPool::new(device.clone(), family))
            .transpose()?;

        Self::prepare_depth_attachment(
            &graphics_pool,
            context.device.graphics_queue,
            &framebuffers,
        )?;

        let frames = (0..config.frames_in_flight_clamped())
            .map(|_| {
                Ok(FrameState {
                    sync: FrameSync::new(device.clone())?,
                    command_buffer: graphics_pool.allocate(context.device.graphics_queue)?,
                })
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        info!(
            "Render device ready: {} frames in flight, {} swapchain images",
            frames.len(),
            swapchain.image_count()
        );

        Ok(Self {
            frames,
            current_frame: 0,
            framebuffers,
            render_pass,
            swapchain,
            graphics_pool,
            transfer_pool,
            resize: ResizeTracker::new(),
            window_extent,
            config,
            context,
        })
    }

    /// Start a frame: recreate if needed, acquire an image, arm the frame's
    /// command buffer
    ///
    /// Returns `None` while the window is minimized. The returned index
    /// selects the framebuffer to draw into.
    pub fn begin_frame(&mut self) -> VulkanResult<Option<u32>> {
        if self.resize.is_minimized() {
            return Ok(None);
        }

        if let Some(extent) = self.resize.take_pending() {
            self.window_extent = extent;
            self.recreate_swapchain()?;
        } else if self.swapchain.state() == SwapchainState::OutOfDate {
            self.recreate_swapchain()?;
        }

        let mut attempts = 0;
        let image_index = loop {
            let image_available = self.frames[self.current_frame].sync.image_available.handle();
            match self.swapchain.acquire_next(image_available)? {
                Some(index) => break index,
                None => {
                    attempts += 1;
                    if attempts > 2 {
                        return Err(VulkanError::InvalidOperation {
                            reason: "swapchain still out of date after recreation".to_string(),
                        });
                    }
                    self.recreate_swapchain()?;
                }
            }
        };

        let frame = &mut self.frames[self.current_frame];
        if frame.command_buffer.status() == CommandBufferStatus::Submitted {
            frame.command_buffer.wait_and_reset_fence()?;
        }
        frame.command_buffer.begin()?;

        Ok(Some(image_index))
    }

    /// Submit the current frame and present the acquired image
    pub fn submit_frame(&mut self) -> VulkanResult<()> {
        let (wait_semaphore, signal_semaphore) = {
            let sync = &self.frames[self.current_frame].sync;
            (sync.image_available.handle(), sync.render_finished.handle())
        };

        self.frames[self.current_frame]
            .command_buffer
            .end(&[wait_semaphore], &[signal_semaphore])?;

        let state = self
            .swapchain
            .present(self.context.device.present_queue, signal_semaphore)?;

        if state != SwapchainState::Optimal {
            debug!("present reported {:?}; scheduling swapchain recreation", state);
            self.swapchain.mark_out_of_date();
        }

        self.current_frame = (self.current_frame + 1) % self.frames.len();
        Ok(())
    }

    /// Command buffer recording the current frame
    pub fn frame_command_buffer(&mut self) -> &mut CommandBuffer {
        &mut self.frames[self.current_frame].command_buffer
    }

    /// Record a window resize; recreation happens at the next `begin_frame`
    pub fn handle_resize_event(&mut self, width: u32, height: u32) {
        self.resize.handle_resize(width, height);
    }

    /// Whether frames are currently skipped because the window is zero-area
    pub fn is_minimized(&self) -> bool {
        self.resize.is_minimized()
    }

    fn recreate_swapchain(&mut self) -> VulkanResult<()> {
        unsafe {
            self.context
                .device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)?;
        }

        self.swapchain.recreate(
            self.context.surface.surface,
            &self.context.surface.loader,
            self.context.physical_device.device,
            self.window_extent,
        )?;
        self.framebuffers
            .rebuild(self.context.memory_properties(), &self.swapchain)?;
        Self::prepare_depth_attachment(
            &self.graphics_pool,
            self.context.device.graphics_queue,
            &self.framebuffers,
        )?;
        Ok(())
    }

    /// Move a freshly created depth attachment into its attachment layout
    ///
    /// Runs a one-shot submission on the graphics queue and waits it out, so
    /// the depth image is ready before the first render pass touches it.
    fn prepare_depth_attachment(
        pool: &CommandPool,
        queue: vk::Queue,
        framebuffers: &SwapchainFramebuffers,
    ) -> VulkanResult<()> {
        let mut setup = pool.allocate(queue)?;
        setup.begin()?;
        framebuffers
            .depth_buffer()
            .record_initial_transition(&mut setup)?;
        setup.end(&[], &[])?;
        setup.wait_and_reset_fence()?;
        Ok(())
    }

    /// Create a device-local vertex buffer from host data
    pub fn create_vertex_buffer<T: bytemuck::Pod>(
        &mut self,
        vertices: &[T],
    ) -> VulkanResult<VertexBuffer> {
        let buffer = self.upload_device_local(
            bytemuck::cast_slice(vertices),
            BufferUsage::VERTEX,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        )?;
        Ok(VertexBuffer::new(buffer, vertices.len() as u32))
    }

    /// Create a device-local index buffer from host data (u32 indices)
    pub fn create_index_buffer(&mut self, indices: &[u32]) -> VulkanResult<IndexBuffer> {
        let buffer = self.upload_device_local(
            bytemuck::cast_slice(indices),
            BufferUsage::INDEX,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
        )?;
        Ok(IndexBuffer::new(buffer, indices.len() as u32))
    }

    /// Create a buffer directly from a descriptor, without staging
    pub fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<DeviceBuffer> {
        DeviceBuffer::new(
            self.context.raw_device(),
            self.context.memory_properties(),
            desc,
        )
    }

    /// Create a persistently mapped uniform buffer
    pub fn create_uniform_buffer<T: bytemuck::Pod>(&self) -> VulkanResult<UniformBuffer<T>> {
        let desc = BufferDesc {
            size: std::mem::size_of::<T>() as vk::DeviceSize,
            usage: BufferUsage::UNIFORM,
            host_visible: true,
            persistently_mapped: true,
        };
        let buffer = DeviceBuffer::new(
            self.context.raw_device(),
            self.context.memory_properties(),
            &desc,
        )?;
        Ok(UniformBuffer::new(buffer))
    }

    /// Create a sampled texture from tightly packed host pixels
    ///
    /// The upload runs on the transfer queue when available; the final
    /// shader-read transition then carries the queue-family hand-off, left
    /// pending on the texture until the graphics queue first binds it.
    pub fn create_texture(&mut self, desc: &TextureDesc, pixels: &[u8]) -> VulkanResult<Texture> {
        let device = self.context.raw_device();
        let memory_properties = *self.context.memory_properties();
        let families = self.context.queue_families();

        let mut texture = Texture::new(device.clone(), &memory_properties, desc)?;

        let staging_desc = BufferDesc {
            size: pixels.len() as vk::DeviceSize,
            usage: BufferUsage::TRANSFER_SRC,
            host_visible: true,
            persistently_mapped: false,
        };
        let mut staging = DeviceBuffer::new(device, &memory_properties, &staging_desc)?;
        staging.upload_data(pixels)?;

        let (mut command_buffer, on_transfer_queue) = self.begin_upload()?;
        texture.transition_layout(
            &mut command_buffer,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            None,
        )?;
        command_buffer.copy_buffer_to_image(&staging, texture.image(), desc.extent);
        let dst_family = on_transfer_queue.then_some(families.graphics);
        texture.transition_layout(
            &mut command_buffer,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_family,
        )?;

        command_buffer.end(&[], &[])?;
        command_buffer.wait_and_reset_fence()?;
        texture.mark_release_complete();

        Ok(texture)
    }

    fn upload_device_local(
        &mut self,
        bytes: &[u8],
        usage: BufferUsage,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> VulkanResult<DeviceBuffer> {
        let device = self.context.raw_device();
        let memory_properties = *self.context.memory_properties();
        let families = self.context.queue_families();
        let size = bytes.len() as vk::DeviceSize;

        let staging_desc = BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            host_visible: true,
            persistently_mapped: false,
        };
        let mut staging = DeviceBuffer::new(device.clone(), &memory_properties, &staging_desc)?;
        staging.upload_data(bytes)?;

        let dst_desc = BufferDesc {
            size,
            usage: usage | BufferUsage::TRANSFER_DST,
            host_visible: false,
            persistently_mapped: false,
        };
        let mut dst = DeviceBuffer::new(device, &memory_properties, &dst_desc)?;

        let (mut command_buffer, on_transfer_queue) = self.begin_upload()?;
        command_buffer.copy_buffer(&staging, &dst, size);
        if on_transfer_queue {
            dst.release_to_queue(&mut command_buffer, families.graphics, dst_stage, dst_access);
        }

        command_buffer.end(&[], &[])?;
        command_buffer.wait_and_reset_fence()?;
        dst.mark_release_complete();

        Ok(dst)
    }

    /// Allocate a short-lived command buffer for an upload
    ///
    /// Returns whether it records on the dedicated transfer queue, in which
    /// case written resources need a queue-family hand-off to graphics.
    fn begin_upload(&mut self) -> VulkanResult<(CommandBuffer, bool)> {
        let (pool, queue, on_transfer_queue) = match (
            self.transfer_pool.as_ref(),
            self.context.device.transfer_queue,
        ) {
            (Some(pool), Some(queue)) => (pool, queue, true),
            _ => (&self.graphics_pool, self.context.device.graphics_queue, false),
        };

        let mut command_buffer = pool.allocate(queue)?;
        command_buffer.begin()?;
        Ok((command_buffer, on_transfer_queue))
    }

    /// Clear values matching the forward render pass attachments
    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.config.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ]
    }

    /// The forward render pass shared by all framebuffers
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    /// Framebuffer for the image index returned by `begin_frame`
    pub fn framebuffer(&self, image_index: u32) -> VulkanResult<&Framebuffer> {
        self.framebuffers.get(image_index)
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Surface format of the swapchain
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.swapchain.format()
    }

    /// Queue family indices in use
    pub fn queue_families(&self) -> QueueFamilies {
        self.context.queue_families()
    }

    /// The underlying Vulkan context
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.context
                .device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        let device = self.context.raw_device();
        let finished = wait_idle_bounded(TEARDOWN_TIMEOUT, move || {
            if let Err(e) = unsafe { device.device_wait_idle() } {
                warn!("device_wait_idle failed during teardown: {:?}", e);
            }
        });

        if finished {
            for frame in &mut self.frames {
                if frame.command_buffer.status() == CommandBufferStatus::Submitted {
                    if let Err(e) = frame.command_buffer.wait_and_reset_fence() {
                        warn!("frame fence wait failed during teardown: {:?}", e);
                    }
                }
            }
        } else {
            warn!(
                "GPU still busy after {:?}; abandoning idle wait and leaking in-flight frame state",
                TEARDOWN_TIMEOUT
            );
            leak_frames(&mut self.frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_resize_records_minimized_without_pending_recreate() {
        let mut tracker = ResizeTracker::new();
        tracker.handle_resize(0, 600);
        assert!(tracker.is_minimized());
        assert!(tracker.take_pending().is_none());
    }

    #[test]
    fn nonzero_resize_clears_minimized_and_schedules_recreate() {
        let mut tracker = ResizeTracker::new();
        tracker.handle_resize(0, 0);
        tracker.handle_resize(800, 600);
        assert!(!tracker.is_minimized());
        assert_eq!(
            tracker.take_pending(),
            Some(vk::Extent2D {
                width: 800,
                height: 600
            })
        );
    }

    #[test]
    fn pending_resize_is_consumed_once() {
        let mut tracker = ResizeTracker::new();
        tracker.handle_resize(1024, 768);
        assert!(tracker.take_pending().is_some());
        assert!(tracker.take_pending().is_none());
    }

    #[test]
    fn repeated_resizes_keep_only_the_latest() {
        let mut tracker = ResizeTracker::new();
        tracker.handle_resize(640, 480);
        tracker.handle_resize(1920, 1080);
        assert_eq!(
            tracker.take_pending(),
            Some(vk::Extent2D {
                width: 1920,
                height: 1080
            })
        );
    }

    #[test]
    fn bounded_wait_returns_true_for_a_fast_wait() {
        assert!(wait_idle_bounded(Duration::from_secs(1), || {}));
    }

    #[test]
    fn bounded_wait_gives_up_on_a_stalled_wait() {
        let finished = wait_idle_bounded(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(10));
        });
        assert!(!finished);
    }

    struct DropFlag<'a>(&'a std::cell::Cell<bool>);

    impl Drop for DropFlag<'_> {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn abandoned_teardown_leaks_frames_without_running_destructors() {
        let dropped = std::cell::Cell::new(false);
        let mut frames = vec![DropFlag(&dropped)];

        leak_frames(&mut frames);

        assert!(frames.is_empty());
        assert!(!dropped.get());
    }
}
