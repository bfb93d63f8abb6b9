//! Vulkan error types
//!
//! All fallible driver operations surface through `VulkanError`. Usage and
//! protocol violations (double release, recording while in flight) are
//! assertions, not error values; see the individual modules.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Image layout transition outside the supported table
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        /// Layout the image is currently in
        from: vk::ImageLayout,
        /// Layout that was requested
        to: vk::ImageLayout,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
