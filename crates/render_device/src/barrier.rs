//! Barrier and queue-family-ownership-transfer model
//!
//! A barrier here is a *request* to change access masks (and, for images,
//! layout), optionally moving ownership between queue families. Requests are
//! decoupled from insertion: a release side is recorded immediately on the
//! producing command buffer, while the matching acquire is stored on the
//! resource as pending state and consumed by the next command buffer that
//! binds it. Command buffers collect pending acquires into batches keyed by
//! (source-stage, destination-stage) and flush each batch with a single
//! pipeline-barrier call.

use crate::error::{VulkanError, VulkanResult};
use ash::{vk, Device};

/// Access/stage mask pair for one supported image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Access mask required before the transition
    pub src_access: vk::AccessFlags,
    /// Access mask granted after the transition
    pub dst_access: vk::AccessFlags,
    /// Pipeline stage the transition waits on
    pub src_stage: vk::PipelineStageFlags,
    /// Pipeline stage the transition unblocks
    pub dst_stage: vk::PipelineStageFlags,
    /// Image aspect the transition applies to
    pub aspect_mask: vk::ImageAspectFlags,
}

/// Look up the fixed table of supported layout transitions
///
/// The table is deliberately closed-world: the system has a small, known set
/// of usage patterns (upload-then-sample, initial depth setup) rather than a
/// general state-tracking renderer. Any pair outside the table is an
/// `UnsupportedLayoutTransition` error, never a guessed mask.
pub fn layout_transition_masks(
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> VulkanResult<TransitionMasks> {
    match (from, to) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                aspect_mask: vk::ImageAspectFlags::COLOR,
            })
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                aspect_mask: vk::ImageAspectFlags::DEPTH,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
                aspect_mask: vk::ImageAspectFlags::COLOR,
            })
        }
        _ => Err(VulkanError::UnsupportedLayoutTransition { from, to }),
    }
}

/// Pending access transition for a buffer range
#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    /// Buffer the barrier applies to
    pub buffer: vk::Buffer,
    /// Access mask before the barrier
    pub src_access: vk::AccessFlags,
    /// Access mask after the barrier
    pub dst_access: vk::AccessFlags,
    /// Releasing queue family (or `vk::QUEUE_FAMILY_IGNORED`)
    pub src_queue_family: u32,
    /// Acquiring queue family (or `vk::QUEUE_FAMILY_IGNORED`)
    pub dst_queue_family: u32,
    /// Byte offset of the affected range
    pub offset: vk::DeviceSize,
    /// Byte size of the affected range
    pub size: vk::DeviceSize,
}

impl BufferBarrier {
    fn build(&self) -> vk::BufferMemoryBarrier {
        vk::BufferMemoryBarrier::builder()
            .buffer(self.buffer)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .offset(self.offset)
            .size(self.size)
            .build()
    }
}

/// Pending access/layout transition for a whole image
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    /// Image the barrier applies to
    pub image: vk::Image,
    /// Access mask before the barrier
    pub src_access: vk::AccessFlags,
    /// Access mask after the barrier
    pub dst_access: vk::AccessFlags,
    /// Layout the image is in
    pub old_layout: vk::ImageLayout,
    /// Layout the image moves to
    pub new_layout: vk::ImageLayout,
    /// Releasing queue family (or `vk::QUEUE_FAMILY_IGNORED`)
    pub src_queue_family: u32,
    /// Acquiring queue family (or `vk::QUEUE_FAMILY_IGNORED`)
    pub dst_queue_family: u32,
    /// Image aspect the barrier applies to
    pub aspect_mask: vk::ImageAspectFlags,
}

impl ImageBarrier {
    fn build(&self) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .image(self.image)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build()
    }
}

/// A barrier request for either resource kind
#[derive(Debug, Clone, Copy)]
pub enum ResourceBarrier {
    /// Buffer access transition
    Buffer(BufferBarrier),
    /// Image access/layout transition
    Image(ImageBarrier),
}

/// A barrier request plus the stage masks it must be inserted between
#[derive(Debug, Clone, Copy)]
pub struct PendingBarrier {
    /// Pipeline stage the barrier waits on
    pub src_stage: vk::PipelineStageFlags,
    /// Pipeline stage the barrier unblocks
    pub dst_stage: vk::PipelineStageFlags,
    /// The barrier itself
    pub barrier: ResourceBarrier,
}

impl PendingBarrier {
    /// Record this barrier immediately as its own pipeline-barrier call
    pub fn record(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        let mut batch = BarrierBatch::new(self.src_stage, self.dst_stage);
        batch.push(self.barrier);
        batch.record(device, command_buffer);
    }
}

/// The acquire half of a release/acquire queue-ownership pair
///
/// Produced when a release barrier is recorded, consumed exactly once by the
/// next command buffer that binds the resource. Carries the fence of the
/// releasing submission so the consumer can guarantee the release's GPU-side
/// effects are complete before inserting the acquire.
#[derive(Debug, Clone, Copy)]
pub struct PendingAcquire {
    /// The acquire barrier to insert on the consuming queue
    pub barrier: PendingBarrier,
    /// Fence of the releasing submission, if known
    pub release_fence: Option<vk::Fence>,
}

/// Holder enforcing at most one outstanding pending acquire per resource
///
/// Storing into an occupied slot is a fatal usage error: it means a second
/// release was recorded before the previous acquire was taken.
#[derive(Debug, Default)]
pub struct PendingAcquireSlot {
    inner: Option<PendingAcquire>,
}

impl PendingAcquireSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self { inner: None }
    }

    /// Store the acquire half of a freshly recorded release
    ///
    /// # Panics
    /// Panics if a pending acquire is already outstanding.
    pub fn store(&mut self, pending: PendingAcquire) {
        assert!(
            self.inner.is_none(),
            "resource re-released before its pending acquire barrier was taken"
        );
        self.inner = Some(pending);
    }

    /// One-shot hand-off of the pending acquire, if any
    pub fn take(&mut self) -> Option<PendingAcquire> {
        self.inner.take()
    }

    /// Whether an acquire is outstanding
    pub fn is_pending(&self) -> bool {
        self.inner.is_some()
    }

    /// Forget the release fence after the releasing submission was waited on
    ///
    /// The acquire barrier itself stays pending; only the fence handle is
    /// dropped, so a later take does not touch a fence that may no longer
    /// exist.
    pub fn clear_release_fence(&mut self) {
        if let Some(pending) = self.inner.as_mut() {
            pending.release_fence = None;
        }
    }
}

/// Barriers sharing one (source-stage, destination-stage) pair
///
/// Invariant: every barrier in a batch has the batch's stage masks, so the
/// whole batch can be inserted with a single pipeline-barrier call.
#[derive(Debug)]
pub struct BarrierBatch {
    /// Pipeline stage the batch waits on
    pub src_stage: vk::PipelineStageFlags,
    /// Pipeline stage the batch unblocks
    pub dst_stage: vk::PipelineStageFlags,
    buffers: Vec<BufferBarrier>,
    images: Vec<ImageBarrier>,
}

impl BarrierBatch {
    fn new(src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }

    fn matches(&self, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> bool {
        self.src_stage == src_stage && self.dst_stage == dst_stage
    }

    fn push(&mut self, barrier: ResourceBarrier) {
        match barrier {
            ResourceBarrier::Buffer(b) => self.buffers.push(b),
            ResourceBarrier::Image(i) => self.images.push(i),
        }
    }

    /// Number of barriers collected in this batch
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    /// Whether the batch holds no barriers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record this batch as one pipeline-barrier call
    pub fn record(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        let buffer_barriers: Vec<vk::BufferMemoryBarrier> =
            self.buffers.iter().map(BufferBarrier::build).collect();
        let image_barriers: Vec<vk::ImageMemoryBarrier> =
            self.images.iter().map(ImageBarrier::build).collect();

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &image_barriers,
            );
        }
    }
}

/// Ordered collection of deferred barrier batches
///
/// Pending acquires are appended as resources are bound; barriers with
/// matching stage masks merge into an existing batch, others append a new
/// one. The collection is drained and cleared by a single flush immediately
/// before the GPU commands that depend on it.
#[derive(Debug, Default)]
pub struct DeferredBarriers {
    batches: Vec<BarrierBatch>,
}

impl DeferredBarriers {
    /// Create an empty collection
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
        }
    }

    /// Append a barrier, merging into a batch with identical stage masks
    pub fn push(&mut self, pending: PendingBarrier) {
        if let Some(batch) = self
            .batches
            .iter_mut()
            .find(|b| b.matches(pending.src_stage, pending.dst_stage))
        {
            batch.push(pending.barrier);
            return;
        }

        let mut batch = BarrierBatch::new(pending.src_stage, pending.dst_stage);
        batch.push(pending.barrier);
        self.batches.push(batch);
    }

    /// Number of distinct stage-mask batches collected
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Whether anything is pending
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Remove and return all collected batches in append order
    pub fn drain(&mut self) -> Vec<BarrierBatch> {
        std::mem::take(&mut self.batches)
    }

    /// Record every batch (one pipeline-barrier call each) and clear
    pub fn flush(&mut self, device: &Device, command_buffer: vk::CommandBuffer) -> usize {
        let batches = self.drain();
        for batch in &batches {
            batch.record(device, command_buffer);
        }
        batches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_acquire(dst_stage: vk::PipelineStageFlags) -> PendingBarrier {
        PendingBarrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage,
            barrier: ResourceBarrier::Buffer(BufferBarrier {
                buffer: vk::Buffer::null(),
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
                src_queue_family: 1,
                dst_queue_family: 0,
                offset: 0,
                size: vk::WHOLE_SIZE,
            }),
        }
    }

    #[test]
    fn matching_stage_masks_merge_into_one_batch() {
        let mut deferred = DeferredBarriers::new();
        deferred.push(buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT));
        deferred.push(buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT));

        assert_eq!(deferred.batch_count(), 1);
        let batches = deferred.drain();
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn distinct_stage_masks_append_new_batches_in_order() {
        let mut deferred = DeferredBarriers::new();
        deferred.push(buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT));
        deferred.push(buffer_acquire(vk::PipelineStageFlags::FRAGMENT_SHADER));
        deferred.push(buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT));

        assert_eq!(deferred.batch_count(), 2);
        let batches = deferred.drain();
        assert_eq!(batches[0].dst_stage, vk::PipelineStageFlags::VERTEX_INPUT);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn drain_clears_the_collection() {
        let mut deferred = DeferredBarriers::new();
        deferred.push(buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT));

        assert!(!deferred.is_empty());
        let _ = deferred.drain();
        assert!(deferred.is_empty());
        assert_eq!(deferred.batch_count(), 0);
    }

    #[test]
    fn pending_acquire_is_one_shot() {
        let mut slot = PendingAcquireSlot::new();
        slot.store(PendingAcquire {
            barrier: buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT),
            release_fence: None,
        });

        assert!(slot.is_pending());
        assert!(slot.take().is_some());
        assert!(!slot.is_pending());
        assert!(slot.take().is_none());
    }

    #[test]
    #[should_panic(expected = "re-released")]
    fn double_release_without_acquire_panics() {
        let mut slot = PendingAcquireSlot::new();
        let pending = PendingAcquire {
            barrier: buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT),
            release_fence: None,
        };
        slot.store(pending);
        slot.store(pending);
    }

    #[test]
    fn consumed_acquire_flushes_once_then_never_again() {
        // Two consecutive draws binding the same resource: the first bind
        // pulls the pending acquire and flushes one batch, the second finds
        // nothing pending and flushes zero batches.
        let mut slot = PendingAcquireSlot::new();
        slot.store(PendingAcquire {
            barrier: buffer_acquire(vk::PipelineStageFlags::VERTEX_INPUT),
            release_fence: None,
        });

        let mut deferred = DeferredBarriers::new();
        if let Some(pending) = slot.take() {
            deferred.push(pending.barrier);
        }
        assert_eq!(deferred.drain().len(), 1);

        if let Some(pending) = slot.take() {
            deferred.push(pending.barrier);
        }
        assert_eq!(deferred.drain().len(), 0);
    }

    #[test]
    fn transition_table_covers_known_pairs() {
        let upload = layout_transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(upload.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let depth = layout_transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.aspect_mask, vk::ImageAspectFlags::DEPTH);

        let sample = layout_transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(sample.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn transition_table_rejects_unknown_pairs() {
        let result = layout_transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(matches!(
            result,
            Err(VulkanError::UnsupportedLayoutTransition { .. })
        ));
    }
}
