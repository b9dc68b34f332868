//! Synchronization primitives.

use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// A fence owned for its whole lifetime; destroyed on drop.
pub struct Fence {
    fence: vk::Fence,
    device: Arc<ash::Device>,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: Arc<ash::Device>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.create_fence(&create_info, None)? };
        Ok(Self { fence, device })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns)? };
        Ok(())
    }

    /// Whether the fence is currently signaled.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(self.fence)? })
    }

    /// Reset the fence to unsignaled state.
    ///
    /// # Safety
    /// The fence must not be associated with a pending queue submission.
    pub unsafe fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.fence])? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}
