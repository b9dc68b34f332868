//! Command buffer management.

use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Command pool for allocating command buffers.
///
/// Destroyed on drop; command buffers allocated from it are freed with it.
/// Drop the pool before the [`GpuContext`](crate::GpuContext) it was created
/// from: unlike a buffer it does not notice that the device is gone.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
    device: Arc<ash::Device>,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The queue family must exist on the device.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self {
            pool,
            queue_family,
            device,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    pub fn allocate_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("Driver returned no command buffer".to_string()))
    }

    /// Return a command buffer to the pool.
    ///
    /// # Safety
    /// `cmd` must come from this pool and must not be pending execution.
    pub unsafe fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(self.pool, &[cmd]) };
    }

    /// Reset the command pool.
    ///
    /// # Safety
    /// All command buffers from this pool must not be in use.
    pub unsafe fn reset(&self, flags: vk::CommandPoolResetFlags) -> Result<()> {
        unsafe { self.device.reset_command_pool(self.pool, flags)? };
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
    unsafe { device.queue_submit(queue, &[submit_info], fence)? };
    Ok(())
}

/// Record, submit and wait on a one-shot command buffer.
///
/// The command buffer is freed once allocated unless the final queue wait
/// fails. Failures name the step that failed.
///
/// # Safety
/// `queue` must belong to `device` and to the pool's queue family.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn execute_single_time_commands<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = pool
        .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
        .map_err(|e| match e {
            GpuError::Vulkan(result) => GpuError::command("create command buffer")(result),
            other => other,
        })?;

    let result = unsafe { record_and_submit(device, cmd, queue, f) };

    // Pending buffers cannot be freed.
    if !result.as_ref().is_err_and(work_may_be_pending) {
        unsafe { pool.free_command_buffer(cmd) };
    }
    result
}

const WAIT_IDLE: &str = "wait for queue idle";

/// Whether submitted work may still be running after `err`.
///
/// True only when the submission went through and the wait for it failed;
/// resources the work touches must outlive a device-wide wait in that case.
pub fn work_may_be_pending(err: &GpuError) -> bool {
    matches!(err, GpuError::Command { operation: WAIT_IDLE, .. })
}

unsafe fn record_and_submit<F>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(GpuError::command("begin command buffer"))?;
        f(cmd);
        device
            .end_command_buffer(cmd)
            .map_err(GpuError::command("end command buffer"))?;

        let cmd_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
        device
            .queue_submit(queue, &[submit_info], vk::Fence::null())
            .map_err(GpuError::command("submit queue"))?;
        // Queue-wide wait; fine for one-off uploads, not for per-frame traffic.
        device
            .queue_wait_idle(queue)
            .map_err(GpuError::command(WAIT_IDLE))?;
    }

    Ok(())
}
