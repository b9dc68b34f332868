//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
///
/// Buffers and command pools keep the device alive through an `Arc`, but
/// must still be dropped before the context: the device is destroyed here.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,

    // Queue families and queues
    pub(crate) graphics_queue_family: u32,
    pub(crate) compute_queue_family: u32,
    pub(crate) transfer_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) compute_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get a shared handle to the device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the compute queue.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Get the transfer queue.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the compute queue family index.
    pub fn compute_queue_family(&self) -> u32 {
        self.compute_queue_family
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Distinct queue families in use, sorted.
    pub fn unique_queue_families(&self) -> Vec<u32> {
        let mut families = vec![
            self.graphics_queue_family,
            self.compute_queue_family,
            self.transfer_queue_family,
        ];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// The queue created for `family`, if the context owns one.
    pub fn queue_for_family(&self, family: u32) -> Option<vk::Queue> {
        if family == self.transfer_queue_family {
            Some(self.transfer_queue)
        } else if family == self.compute_queue_family {
            Some(self.compute_queue)
        } else if family == self.graphics_queue_family {
            Some(self.graphics_queue)
        } else {
            None
        }
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// Memory types and heaps of the selected physical device.
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        *self.allocator.lock().memory_properties()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        // From here on the instance must be destroyed on failure.
        match unsafe { Self::create_on_instance(&instance) } {
            Ok(parts) => Ok(parts.into_context(entry, instance)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn create_on_instance(instance: &ash::Instance) -> Result<DeviceParts> {
        let physical_device = unsafe { select_physical_device(instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = unsafe { find_queue_families(instance, physical_device) }?;
        tracing::debug!(
            graphics = queue_families.graphics,
            compute = queue_families.compute,
            transfer = queue_families.transfer,
            "Queue families"
        );

        let (device, graphics_queue, compute_queue, transfer_queue) =
            unsafe { create_device(instance, physical_device, &queue_families)? };

        let device = Arc::new(device);

        let allocator =
            match unsafe { GpuAllocator::new(instance, Arc::clone(&device), physical_device) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        Ok(DeviceParts {
            physical_device,
            device,
            capabilities,
            allocator,
            queue_families,
            queues: [graphics_queue, compute_queue, transfer_queue],
        })
    }
}

/// Everything created on top of the instance.
struct DeviceParts {
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: GpuAllocator,
    queue_families: QueueFamilyIndices,
    queues: [vk::Queue; 3],
}

impl DeviceParts {
    fn into_context(self, entry: ash::Entry, instance: ash::Instance) -> GpuContext {
        let [graphics_queue, compute_queue, transfer_queue] = self.queues;
        GpuContext {
            entry,
            instance,
            physical_device: self.physical_device,
            device: self.device,
            capabilities: self.capabilities,
            allocator: Arc::new(Mutex::new(self.allocator)),
            graphics_queue_family: self.queue_families.graphics,
            compute_queue_family: self.queue_families.compute,
            transfer_queue_family: self.queue_families.transfer,
            graphics_queue,
            compute_queue,
            transfer_queue,
        }
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let flags: Vec<vk::QueueFlags> = queue_families.iter().map(|f| f.queue_flags).collect();
    pick_queue_families(&flags).ok_or(GpuError::NoSuitableDevice)
}

/// Choose graphics, compute and transfer families, preferring dedicated ones.
fn pick_queue_families(families: &[vk::QueueFlags]) -> Option<QueueFamilyIndices> {
    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, &flags) in families.iter().enumerate() {
        let i = i as u32;

        // Look for dedicated compute queue (no graphics)
        if flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Look for dedicated transfer queue (no graphics or compute)
        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        // Graphics queue (also supports compute and transfer)
        if flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    Some(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
    let mut unique_families = vec![
        queue_families.graphics,
        queue_families.compute,
        queue_families.transfer,
    ];
    unique_families.sort_unstable();
    unique_families.dedup();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let device_create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?
    };

    let (graphics_queue, compute_queue, transfer_queue) = unsafe {
        (
            device.get_device_queue(queue_families.graphics, 0),
            device.get_device_queue(queue_families.compute, 0),
            device.get_device_queue(queue_families.transfer, 0),
        )
    };

    Ok((device, graphics_queue, compute_queue, transfer_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn single_universal_family() {
        let picked = pick_queue_families(&[G | C | T]).unwrap();
        assert_eq!(
            picked,
            QueueFamilyIndices {
                graphics: 0,
                compute: 0,
                transfer: 0
            }
        );
    }

    #[test]
    fn prefers_dedicated_families() {
        let picked = pick_queue_families(&[G | C | T, C | T, T]).unwrap();
        assert_eq!(
            picked,
            QueueFamilyIndices {
                graphics: 0,
                compute: 1,
                transfer: 2
            }
        );
    }

    #[test]
    fn transfer_falls_back_to_compute() {
        let picked = pick_queue_families(&[G | C | T, C | T]).unwrap();
        assert_eq!(picked.transfer, 1);
    }

    #[test]
    fn graphics_is_required() {
        assert!(pick_queue_families(&[C | T, T]).is_none());
        assert!(pick_queue_families(&[]).is_none());
    }
}
