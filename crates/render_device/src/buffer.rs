//! Device buffer management
//!
//! `DeviceBuffer` owns one `vk::Buffer` plus its memory allocation and
//! carries the buffer's pending-acquire state for queue-family-ownership
//! transfers. Typed wrappers (`VertexBuffer`, `IndexBuffer`, `UniformBuffer`)
//! add the bookkeeping their bind points need.

use crate::barrier::{
    BufferBarrier, PendingAcquire, PendingAcquireSlot, PendingBarrier, ResourceBarrier,
};
use crate::command::CommandBuffer;
use crate::error::{VulkanError, VulkanResult};
use ash::{vk, Device};
use bitflags::bitflags;

bitflags! {
    /// Buffer usage flags exposed by the resource-creation surface
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        /// Source of transfer commands
        const TRANSFER_SRC = 1 << 0;
        /// Destination of transfer commands
        const TRANSFER_DST = 1 << 1;
        /// Bindable as a vertex buffer
        const VERTEX = 1 << 2;
        /// Bindable as an index buffer
        const INDEX = 1 << 3;
        /// Bindable as a uniform buffer
        const UNIFORM = 1 << 4;
    }
}

impl BufferUsage {
    /// Map to the native usage flags
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        flags
    }
}

/// Descriptor for buffer creation
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Allocation size in bytes
    pub size: vk::DeviceSize,
    /// Usage flags
    pub usage: BufferUsage,
    /// Allocate from host-visible, host-coherent memory
    pub host_visible: bool,
    /// Keep the allocation mapped for the buffer's lifetime (implies host-visible)
    pub persistently_mapped: bool,
}

/// Buffer wrapper with memory management and pending-barrier state
pub struct DeviceBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<*mut u8>,
    pending_acquire: PendingAcquireSlot,
}

impl DeviceBuffer {
    /// Create a new buffer with its memory allocation
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &BufferDesc,
    ) -> VulkanResult<Self> {
        assert!(
            !desc.persistently_mapped || desc.host_visible,
            "persistently mapped buffers must be host visible"
        );

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let property_flags = if desc.host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let memory_type_index = find_memory_type(
            memory_properties,
            mem_requirements.memory_type_bits,
            property_flags,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        let mapped = if desc.persistently_mapped {
            let ptr = unsafe {
                device
                    .map_memory(memory, 0, desc.size, vk::MemoryMapFlags::empty())
                    .map_err(VulkanError::Api)?
            };
            Some(ptr.cast::<u8>())
        } else {
            None
        };

        Ok(Self {
            device,
            buffer,
            memory,
            size: desc.size,
            mapped,
            pending_acquire: PendingAcquireSlot::new(),
        })
    }

    /// Copy host bytes into the buffer
    ///
    /// Uses the persistent mapping when present, otherwise a temporary
    /// map/unmap pair.
    ///
    /// # Panics
    /// Panics if the payload exceeds the buffer's allocated capacity; that is
    /// a logic error, not a runtime condition.
    pub fn upload_data(&mut self, bytes: &[u8]) -> VulkanResult<()> {
        assert!(
            bytes.len() as vk::DeviceSize <= self.size,
            "upload of {} bytes exceeds buffer capacity of {} bytes",
            bytes.len(),
            self.size
        );

        if let Some(ptr) = self.mapped {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            }
            return Ok(());
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy a typed host slice into the buffer
    pub fn upload_slice<T: bytemuck::Pod>(&mut self, data: &[T]) -> VulkanResult<()> {
        self.upload_data(bytemuck::cast_slice(data))
    }

    /// Read back the persistent mapping, if the buffer has one
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr, self.size as usize) })
    }

    /// Record a release barrier handing this buffer to another queue family
    ///
    /// The release (written-by-transfer -> no access, tagged with both
    /// families) is recorded on `command_buffer` immediately; the matching
    /// acquire is stored as this buffer's pending state together with the
    /// command buffer's fence, and must be taken exactly once by the next
    /// consumer. A no-op when the destination family equals the recording
    /// family.
    pub fn release_to_queue(
        &mut self,
        command_buffer: &mut CommandBuffer,
        dst_queue_family: u32,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let src_queue_family = command_buffer.queue_family();
        if src_queue_family == dst_queue_family {
            log::trace!("buffer release skipped: same queue family {}", src_queue_family);
            return;
        }

        let release = PendingBarrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            barrier: ResourceBarrier::Buffer(BufferBarrier {
                buffer: self.buffer,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::empty(),
                src_queue_family,
                dst_queue_family,
                offset: 0,
                size: vk::WHOLE_SIZE,
            }),
        };
        command_buffer.record_barrier(&release);

        let acquire = PendingBarrier {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage,
            barrier: ResourceBarrier::Buffer(BufferBarrier {
                buffer: self.buffer,
                src_access: vk::AccessFlags::empty(),
                dst_access,
                src_queue_family,
                dst_queue_family,
                offset: 0,
                size: vk::WHOLE_SIZE,
            }),
        };
        self.pending_acquire.store(PendingAcquire {
            barrier: acquire,
            release_fence: Some(command_buffer.fence_for_wait()),
        });
    }

    /// One-shot hand-off of the pending acquire barrier
    ///
    /// If the releasing submission's fence is known, waits on it first so the
    /// release's GPU-side effects are complete before any consumer inserts
    /// the acquire.
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

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get allocated size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Vertex buffer with its vertex count
pub struct VertexBuffer {
    buffer: DeviceBuffer,
    vertex_count: u32,
}

impl VertexBuffer {
    /// Wrap a device-local buffer that holds vertex data
    pub fn new(buffer: DeviceBuffer, vertex_count: u32) -> Self {
        Self {
            buffer,
            vertex_count,
        }
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Get vertex count
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Access the underlying buffer (bind operations pull pending barriers)
    pub fn device_buffer_mut(&mut self) -> &mut DeviceBuffer {
        &mut self.buffer
    }
}

/// Index buffer with its index count
pub struct IndexBuffer {
    buffer: DeviceBuffer,
    index_count: u32,
}

impl IndexBuffer {
    /// Wrap a device-local buffer that holds `u32` indices
    pub fn new(buffer: DeviceBuffer, index_count: u32) -> Self {
        Self {
            buffer,
            index_count,
        }
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Get index count
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Access the underlying buffer (bind operations pull pending barriers)
    pub fn device_buffer_mut(&mut self) -> &mut DeviceBuffer {
        &mut self.buffer
    }
}

/// Persistently mapped uniform buffer for one shader-visible struct
pub struct UniformBuffer<T> {
    buffer: DeviceBuffer,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: bytemuck::Pod> UniformBuffer<T> {
    /// Wrap a persistently mapped host-visible buffer
    pub fn new(buffer: DeviceBuffer) -> Self {
        debug_assert!(buffer.mapped_slice().is_some());
        Self {
            buffer,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Update uniform data through the persistent mapping
    pub fn update(&mut self, data: &T) -> VulkanResult<()> {
        self.buffer.upload_slice(std::slice::from_ref(data))
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }
}

/// Find memory type with required properties
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        props
    }

    #[test]
    fn memory_type_selection_honors_filter_and_flags() {
        let props = synthetic_memory_properties();

        let idx = find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(idx, 0);

        let idx = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(idx, 1);

        // Type filter masks out the first matching index.
        let idx = find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn memory_type_selection_fails_when_nothing_fits() {
        let props = synthetic_memory_properties();
        let result = find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_CACHED);
        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
    }

    #[test]
    fn usage_flags_map_to_native() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        let vk_usage = usage.to_vk();
        assert!(vk_usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(vk_usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!vk_usage.contains(vk::BufferUsageFlags::INDEX_BUFFER));

        assert_eq!(
            BufferUsage::UNIFORM.to_vk(),
            vk::BufferUsageFlags::UNIFORM_BUFFER
        );
    }
}
