//! GPU capability detection.

use crate::memory::find_memory_type;
use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities relevant to buffer placement.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,
    /// Granularity for flushing non-coherent mapped ranges.
    pub non_coherent_atom_size: u64,

    /// A memory type is both host-visible and device-local (resizable BAR,
    /// unified memory).
    pub has_host_visible_device_local: bool,
    /// A host-visible memory type exists at all.
    pub has_host_visible: bool,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self::from_properties(device_name, &properties, &memory_properties)
    }

    /// Build capabilities from already queried device properties.
    pub fn from_properties(
        device_name: String,
        properties: &vk::PhysicalDeviceProperties,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let any_type = u32::MAX;
        let has_host_visible = find_memory_type(
            memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            any_type,
        )
        .is_ok();
        let has_host_visible_device_local = find_memory_type(
            memory_properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            any_type,
        )
        .is_ok();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            has_host_visible_device_local,
            has_host_visible,
        }
    }

    /// Check if the GPU can run the buffer layer at all.
    pub fn meets_requirements(&self) -> bool {
        // Staging uploads need host-visible memory.
        self.has_host_visible
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
