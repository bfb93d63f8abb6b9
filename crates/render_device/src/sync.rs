//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for semaphores and fences. The fence wrapper tracks a
//! host-visible status so callers can tell a fence that is guaranteed reset
//! apart from one whose state is unknown because the raw handle escaped to
//! external submission machinery.

use crate::error::{VulkanError, VulkanResult};
use ash::{vk, Device};

/// GPU-GPU synchronization primitive with automatic resource management
///
/// Semaphores coordinate work between GPU queue operations (image acquisition,
/// rendering completion, presentation) without involving the CPU. They are
/// never host-waitable in this core.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Host-visible fence status
///
/// `Reset` is only reported when this wrapper itself performed the
/// wait-and-reset (or the fence was created unsignaled and never escaped).
/// Any raw-handle escape downgrades the cached status to
/// `UnsignaledOrReset`, since external code may re-arm the fence outside the
/// wrapper's knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence has been observed signaled
    Signaled,
    /// Guaranteed not yet signaled: this wrapper waited and reset it
    Reset,
    /// Unknown: the raw handle was exposed, or a zero-timeout poll timed out
    UnsignaledOrReset,
}

/// Fence wrapper with RAII cleanup and cached status tracking
pub struct Fence {
    device: Device,
    fence: vk::Fence,
    status: FenceStatus,
}

impl Fence {
    /// Create a new fence
    ///
    /// An unsignaled fence starts in `Reset` (equivalent to
    /// already-reset-or-never-submitted). Creation failure is fatal to the
    /// caller; there is no recovery from a driver that cannot make a fence.
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device
                .create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            fence,
            status: if signaled {
                FenceStatus::Signaled
            } else {
                FenceStatus::Reset
            },
        })
    }

    /// Block the calling thread until the fence signals
    pub fn wait(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::Api)?;
        }
        self.status = FenceStatus::Signaled;
        Ok(())
    }

    /// Wait for the fence and reset it to an unsignaled baseline
    ///
    /// After this returns the status is `Reset`: the fence is guaranteed not
    /// signaled until the handle is next handed to a submission.
    pub fn wait_and_reset(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::Api)?;
            self.device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::Api)?;
        }
        self.status = FenceStatus::Reset;
        Ok(())
    }

    /// Zero-timeout poll of the fence
    ///
    /// An observed signal is cached so repeat queries skip the driver call.
    pub fn query_status(&mut self) -> VulkanResult<FenceStatus> {
        if self.status == FenceStatus::Signaled {
            return Ok(FenceStatus::Signaled);
        }

        let signaled = unsafe {
            self.device
                .get_fence_status(self.fence)
                .map_err(VulkanError::Api)?
        };

        if signaled {
            self.status = FenceStatus::Signaled;
        }
        Ok(self.status)
    }

    /// Cached status without touching the driver
    pub fn status(&self) -> FenceStatus {
        self.status
    }

    /// Whether this wrapper knows the fence is reset (safe to re-arm)
    pub fn was_reset(&self) -> bool {
        self.status == FenceStatus::Reset
    }

    /// Raw handle for host-side waits only
    ///
    /// Waiting cannot re-arm a fence, so this does not invalidate the cached
    /// status. Never pass this handle to submission APIs; use [`Self::handle`]
    /// for that.
    pub fn wait_handle(&self) -> vk::Fence {
        self.fence
    }

    /// Expose the raw signalable handle
    ///
    /// This is a state-invalidating operation: external submission code can
    /// re-arm or leave the fence unsignaled outside this wrapper's control,
    /// so the cached status is downgraded to `UnsignaledOrReset`.
    pub fn handle(&mut self) -> vk::Fence {
        self.status = FenceStatus::UnsignaledOrReset;
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Per-frame semaphore pair ordering acquire -> render -> present
pub struct FrameSync {
    /// Signaled when the swapchain image becomes available
    pub image_available: Semaphore,
    /// Signaled when frame rendering is complete
    pub render_finished: Semaphore,
}

impl FrameSync {
    /// Create frame synchronization objects
    pub fn new(device: Device) -> VulkanResult<Self> {
        let image_available = Semaphore::new(device.clone())?;
        let render_finished = Semaphore::new(device)?;

        Ok(Self {
            image_available,
            render_finished,
        })
    }
}
