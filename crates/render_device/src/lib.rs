//! # Render Device
//!
//! Vulkan resource lifecycle and cross-queue synchronization primitives.
//!
//! The crate wraps the handful of Vulkan objects a renderer spends its time
//! juggling, each carrying the host-side state needed to use it correctly:
//!
//! - **Fences** with a tri-state status cache so signaled fences are never
//!   re-polled and unsignaled fences are never re-armed blind
//! - **Command buffers** as an explicit reset/recording/submitted state
//!   machine with an owned fence and a deferred-barrier queue
//! - **Buffers and textures** that remember the queue-family hand-off they
//!   still owe their next consumer
//! - **A swapchain** with an explicit optimal/suboptimal/out-of-date health
//!   state and a full recreate path
//! - **`RenderDevice`**, the composition root driving the frame loop
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use render_device::{RenderDevice, RendererConfig};
//!
//! let config = RendererConfig::new("demo");
//! let extent = ash::vk::Extent2D { width: 800, height: 600 };
//! let mut device = RenderDevice::new(&window, extent, config)?;
//!
//! while let Some(_image_index) = device.begin_frame()? {
//!     // record draws on device.frame_command_buffer()
//!     device.submit_frame()?;
//! }
//! ```

/// Barrier descriptors, layout-transition table, and the deferred queue
pub mod barrier;
/// Device-local and host-visible buffers with queue hand-off state
pub mod buffer;
/// Command pools and the command buffer state machine
pub mod command;
/// Renderer configuration and file-backed config loading
pub mod config;
/// Instance, surface, physical/logical device initialization
pub mod context;
/// Frame-loop orchestration and resource creation
pub mod device;
/// Error taxonomy
pub mod error;
/// Framebuffers and the depth attachment
pub mod framebuffer;
/// Structured logging setup
pub mod logging;
/// Forward render pass
pub mod render_pass;
/// Swapchain with explicit health state
pub mod swapchain;
/// Fences, semaphores, and per-frame sync
pub mod sync;
/// Sampled textures with tracked layout
pub mod texture;

pub use barrier::{
    BarrierBatch, BufferBarrier, DeferredBarriers, ImageBarrier, PendingAcquire,
    PendingAcquireSlot, PendingBarrier, ResourceBarrier, TransitionMasks,
};
pub use buffer::{
    BufferDesc, BufferUsage, DeviceBuffer, IndexBuffer, UniformBuffer, VertexBuffer,
};
pub use command::{CommandBuffer, CommandBufferStatus, CommandPool, DrawParams};
pub use config::{
    Config, ConfigError, PresentModePreference, RendererConfig, MAX_FRAMES_IN_FLIGHT,
    MIN_FRAMES_IN_FLIGHT,
};
pub use context::{
    LogicalDevice, PhysicalDeviceInfo, QueueFamilies, SurfaceHandles, VulkanContext,
    VulkanInstance,
};
pub use device::{RenderDevice, ResizeTracker};
pub use error::{VulkanError, VulkanResult};
pub use framebuffer::{DepthBuffer, Framebuffer, SwapchainFramebuffers};
pub use render_pass::RenderPass;
pub use swapchain::{Swapchain, SwapchainState};
pub use sync::{Fence, FenceStatus, FrameSync, Semaphore};
pub use texture::{Texture, TextureDesc};
