//! GPU memory management.

use crate::buffer::{sharing_for, BufferDesc};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Find the first memory type allowed by `filter` whose property flags
/// contain all of `required`.
///
/// `filter` is a bitmask with bit `i` set when memory type `i` is
/// acceptable, as reported in `vk::MemoryRequirements::memory_type_bits`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
    filter: u32,
) -> Result<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, ty)| filter & (1u32 << i) != 0 && ty.property_flags.contains(required))
        .map(|(i, _)| i as u32)
        .ok_or(GpuError::NoSuitableMemoryType { required, filter })
}

/// Location to allocate from so that `required` flags can be met.
///
/// The allocator chooses memory types by location only. Host-visible
/// requirements move a device-side location to `CpuToGpu` (or `GpuToCpu`
/// when `HOST_CACHED` is asked for), and `DEVICE_LOCAL` turns `Unknown` into
/// `GpuOnly`. Host locations already asked for are kept.
pub fn location_for(location: MemoryLocation, required: vk::MemoryPropertyFlags) -> MemoryLocation {
    let host_location = matches!(location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu);

    if required.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) && !host_location {
        if required.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    } else if required.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        && location == MemoryLocation::Unknown
    {
        MemoryLocation::GpuOnly
    } else {
        location
    }
}

fn free_quietly(allocator: &mut Allocator, allocation: Allocation) {
    if let Err(e) = allocator.free(allocation) {
        tracing::error!("Failed to free allocation: {e}");
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            allocator: Some(allocator),
            device,
            memory_properties,
        })
    }

    /// Memory types and heaps of the physical device.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Whether [`GpuAllocator::shutdown`] has already run.
    pub fn is_shut_down(&self) -> bool {
        self.allocator.is_none()
    }

    /// Create a buffer and bind freshly allocated memory to it.
    ///
    /// Nothing is leaked on failure: the buffer handle and any allocation
    /// made so far are released before the error is returned.
    pub fn allocate_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<(vk::Buffer, Allocation)> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' has zero size",
                desc.name
            )));
        }

        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;

        let (sharing_mode, queue_families) = sharing_for(desc.queue_families);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&queue_families);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        if let Err(e) = find_memory_type(
            &self.memory_properties,
            desc.required_flags,
            requirements.memory_type_bits,
        ) {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e);
        }

        let location = location_for(desc.location, desc.required_flags);
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        // The location only steers the choice; the flags still have to match.
        if !allocation.memory_properties().contains(desc.required_flags) {
            free_quietly(allocator, allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::NoSuitableMemoryType {
                required: desc.required_flags,
                filter: requirements.memory_type_bits,
            });
        }

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            free_quietly(allocator, allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        tracing::debug!(
            buffer = desc.name,
            size = desc.size,
            ?sharing_mode,
            ?location,
            memory = ?allocation.memory_properties(),
            "Created buffer"
        );

        Ok((buffer, allocation))
    }

    /// Free a buffer's allocation and destroy its handle.
    ///
    /// Fails without touching the device once the allocator has been shut
    /// down, since the device is destroyed right after.
    pub fn destroy_buffer(&mut self, buffer: vk::Buffer, allocation: Allocation) -> Result<()> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?;

        let freed = allocator
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()));

        unsafe {
            self.device.destroy_buffer(buffer, None);
        }

        freed
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
