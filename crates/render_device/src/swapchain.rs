//! Vulkan swapchain management
//!
//! Handles swapchain creation, recreation, and the acquire/present protocol.
//! The swapchain carries an explicit health state so callers can distinguish
//! "keep presenting" from "recreate soon" from "recreate before the next
//! acquire".

use crate::config::PresentModePreference;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::debug;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Instance};

/// Health of the swapchain relative to the surface it presents to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// Matches the surface; keep presenting
    Optimal,
    /// Still presentable but no longer matches the surface exactly
    Suboptimal,
    /// Unusable; must be recreated before the next acquire
    OutOfDate,
}

/// Map an acquire or present outcome onto a swapchain state
///
/// `SUBOPTIMAL_KHR` and `ERROR_OUT_OF_DATE_KHR` are protocol signals, not
/// failures; every other error code is surfaced as-is.
pub fn classify_surface_outcome(
    outcome: Result<bool, vk::Result>,
) -> VulkanResult<SwapchainState> {
    match outcome {
        Ok(false) => Ok(SwapchainState::Optimal),
        Ok(true) => Ok(SwapchainState::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapchainState::OutOfDate),
        Err(e) => Err(VulkanError::Api(e)),
    }
}

/// Take the index the last acquire produced
///
/// # Panics
/// Panics when no image has been acquired since the last present.
fn consume_acquired_index(current_image: &mut Option<u32>) -> u32 {
    current_image
        .take()
        .expect("present without a prior acquire")
}

/// Pick the surface format, preferring sRGB BGRA
///
/// A surface reporting zero formats is an initialization failure, not a
/// panic.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> VulkanResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| {
            sf.format == vk::Format::B8G8R8A8_SRGB
                && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .cloned()
        .ok_or_else(|| {
            VulkanError::InitializationFailed("surface reports no formats".to_string())
        })
}

struct SwapchainInner {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    image_count: u32,
}

/// Swapchain wrapper with RAII cleanup and explicit state tracking
pub struct Swapchain {
    device: Device,
    swapchain_loader: SwapchainLoader,
    inner: SwapchainInner,
    present_mode_preference: PresentModePreference,
    state: SwapchainState,
    current_image: Option<u32>,
}

impl Swapchain {
    /// Create a new swapchain
    pub fn new(
        instance: &Instance,
        device: Device,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        window_extent: vk::Extent2D,
        present_mode_preference: PresentModePreference,
    ) -> VulkanResult<Self> {
        let swapchain_loader = SwapchainLoader::new(instance, &device);
        let inner = create_inner(
            &device,
            &swapchain_loader,
            surface,
            surface_loader,
            physical_device,
            window_extent,
            present_mode_preference,
            vk::SwapchainKHR::null(),
        )?;

        Ok(Self {
            device,
            swapchain_loader,
            inner,
            present_mode_preference,
            state: SwapchainState::Optimal,
            current_image: None,
        })
    }

    /// Acquire the next presentable image
    ///
    /// Returns `None` when the swapchain turned out to be out of date, in
    /// which case no image was acquired and the caller must recreate. Calling
    /// this on a swapchain already known to be out of date is a protocol
    /// violation.
    pub fn acquire_next(&mut self, image_available: vk::Semaphore) -> VulkanResult<Option<u32>> {
        debug_assert!(
            self.state != SwapchainState::OutOfDate,
            "acquire on an out-of-date swapchain; recreate first"
        );

        let outcome = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.inner.swapchain,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };

        match outcome {
            Ok((index, suboptimal)) => {
                self.state = classify_surface_outcome(Ok(suboptimal))?;
                self.current_image = Some(index);
                Ok(Some(index))
            }
            Err(e) => {
                self.state = classify_surface_outcome(Err(e))?;
                self.current_image = None;
                Ok(None)
            }
        }
    }

    /// Present the image acquired by the last `acquire_next`
    ///
    /// The acquired index is consumed here: after presenting (successfully
    /// or not) there is no current image until the next acquire. Presenting
    /// without one is a protocol violation, not a runtime condition.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
    ) -> VulkanResult<SwapchainState> {
        let image_index = consume_acquired_index(&mut self.current_image);

        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.inner.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let outcome = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };
        self.state = classify_surface_outcome(outcome)?;
        Ok(self.state)
    }

    /// Recreate the swapchain against the current surface
    ///
    /// The old swapchain is passed as `old_swapchain` so in-flight presents
    /// can drain, then destroyed. Resets state to optimal and drops any
    /// acquired-image index.
    pub fn recreate(
        &mut self,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        window_extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        let new_inner = create_inner(
            &self.device,
            &self.swapchain_loader,
            surface,
            surface_loader,
            physical_device,
            window_extent,
            self.present_mode_preference,
            self.inner.swapchain,
        )?;

        debug!(
            "Swapchain recreated: {}x{} -> {}x{}",
            self.inner.extent.width,
            self.inner.extent.height,
            new_inner.extent.width,
            new_inner.extent.height
        );

        let old_inner = std::mem::replace(&mut self.inner, new_inner);
        unsafe {
            for &image_view in &old_inner.image_views {
                self.device.destroy_image_view(image_view, None);
            }
            self.swapchain_loader
                .destroy_swapchain(old_inner.swapchain, None);
        }

        self.state = SwapchainState::Optimal;
        self.current_image = None;
        Ok(())
    }

    /// Force the swapchain into the out-of-date state
    ///
    /// Used when an external event (such as a resize) invalidates the
    /// surface before acquire or present observe it.
    pub fn mark_out_of_date(&mut self) {
        self.state = SwapchainState::OutOfDate;
        self.current_image = None;
    }

    /// Current health state
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// Index acquired by the last `acquire_next`, if still unconsumed
    pub fn current_image(&self) -> Option<u32> {
        self.current_image
    }

    /// Get swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.inner.extent
    }

    /// Get surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.inner.format
    }

    /// Get swapchain images
    pub fn images(&self) -> &[vk::Image] {
        &self.inner.images
    }

    /// Get image views
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.inner.image_views
    }

    /// Get swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.inner.swapchain
    }

    /// Get image count
    pub fn image_count(&self) -> u32 {
        self.inner.image_count
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &image_view in &self.inner.image_views {
                self.device.destroy_image_view(image_view, None);
            }
            self.swapchain_loader
                .destroy_swapchain(self.inner.swapchain, None);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_inner(
    device: &Device,
    swapchain_loader: &SwapchainLoader,
    surface: vk::SurfaceKHR,
    surface_loader: &Surface,
    physical_device: vk::PhysicalDevice,
    window_extent: vk::Extent2D,
    present_mode_preference: PresentModePreference,
    old_swapchain: vk::SwapchainKHR,
) -> VulkanResult<SwapchainInner> {
    let surface_caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(physical_device, surface)
            .map_err(VulkanError::Api)?
    };

    let surface_formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_err(VulkanError::Api)?
    };

    let format = choose_surface_format(&surface_formats)?;

    let present_modes = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)
            .map_err(VulkanError::Api)?
    };

    let present_mode = present_mode_preference.resolve(&present_modes);

    let extent = if surface_caps.current_extent.width != u32::MAX {
        surface_caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                surface_caps.min_image_extent.width,
                surface_caps.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                surface_caps.min_image_extent.height,
                surface_caps.max_image_extent.height,
            ),
        }
    };

    let image_count = (surface_caps.min_image_count + 1).min(if surface_caps.max_image_count > 0 {
        surface_caps.max_image_count
    } else {
        surface_caps.min_image_count + 1
    });

    let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe {
        swapchain_loader
            .create_swapchain(&swapchain_create_info, None)
            .map_err(VulkanError::Api)?
    };

    let images = unsafe {
        swapchain_loader
            .get_swapchain_images(swapchain)
            .map_err(VulkanError::Api)?
    };

    let image_views: Result<Vec<_>, _> = images
        .iter()
        .map(|&image| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe { device.create_image_view(&create_info, None) }
        })
        .collect();

    let image_views = image_views.map_err(VulkanError::Api)?;

    Ok(SwapchainInner {
        swapchain,
        images,
        image_views,
        format,
        extent,
        image_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_outcome_is_optimal() {
        assert_eq!(
            classify_surface_outcome(Ok(false)).unwrap(),
            SwapchainState::Optimal
        );
    }

    #[test]
    fn suboptimal_outcome_is_still_usable() {
        assert_eq!(
            classify_surface_outcome(Ok(true)).unwrap(),
            SwapchainState::Suboptimal
        );
    }

    #[test]
    fn out_of_date_is_a_state_not_an_error() {
        assert_eq!(
            classify_surface_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            SwapchainState::OutOfDate
        );
    }

    #[test]
    fn real_errors_propagate() {
        let err = classify_surface_outcome(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(
            err,
            Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn acquired_index_is_consumed_by_present() {
        let mut current_image = Some(1);
        assert_eq!(consume_acquired_index(&mut current_image), 1);
        assert!(current_image.is_none());
    }

    #[test]
    #[should_panic(expected = "present without a prior acquire")]
    fn present_without_acquire_is_a_protocol_violation() {
        let mut current_image = None;
        consume_acquired_index(&mut current_image);
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn surface_format_prefers_srgb_bgra() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn surface_format_falls_back_to_first_reported() {
        let formats = [surface_format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn zero_surface_formats_fail_initialization() {
        let result = choose_surface_format(&[]);
        assert!(matches!(
            result,
            Err(VulkanError::InitializationFailed(_))
        ));
    }
}
