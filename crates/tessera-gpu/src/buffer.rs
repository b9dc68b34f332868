//! GPU buffers with RAII ownership of their memory.
//!
//! A [`Buffer`] owns a Vulkan buffer handle and the allocation backing it.
//! Both are released when the value is dropped. Host data is written through
//! the allocation's persistent mapping, and buffer-to-buffer copies are either
//! recorded into a caller-provided command buffer or submitted on a one-shot
//! command buffer that is waited on before returning.

use crate::command::{execute_single_time_commands, work_may_be_pending, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuAllocator;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Parameters for creating a [`Buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    /// Debug name passed to the allocator.
    pub name: &'a str,
    /// Size in bytes.
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Where the allocator should place the memory.
    pub location: MemoryLocation,
    /// Property flags the chosen memory type must have.
    pub required_flags: vk::MemoryPropertyFlags,
    /// Queue families that will access the buffer. Two or more distinct
    /// families make the buffer concurrently shared.
    pub queue_families: &'a [u32],
}

impl Default for BufferDesc<'_> {
    fn default() -> Self {
        Self {
            name: "buffer",
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
            required_flags: vk::MemoryPropertyFlags::empty(),
            queue_families: &[],
        }
    }
}

impl<'a> BufferDesc<'a> {
    /// Create a description for device-only memory.
    pub fn new(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name,
            size,
            usage,
            ..Self::default()
        }
    }

    /// Host-visible memory the CPU writes and the GPU reads.
    pub fn host_visible(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self::new(name, size, usage)
            .location(MemoryLocation::CpuToGpu)
            .required_flags(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Host-visible memory the GPU writes and the CPU reads back.
    pub fn readback(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self::new(name, size, usage)
            .location(MemoryLocation::GpuToCpu)
            .required_flags(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Device-local memory, not mappable in general.
    pub fn device_local(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self::new(name, size, usage)
            .location(MemoryLocation::GpuOnly)
            .required_flags(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn required_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.required_flags = flags;
        self
    }

    pub fn queue_families(mut self, families: &'a [u32]) -> Self {
        self.queue_families = families;
        self
    }
}

/// Pick the sharing mode for a set of queue families.
///
/// Returns the distinct families (sorted) when more than one is present, and
/// an empty list for exclusive ownership.
pub fn sharing_for(queue_families: &[u32]) -> (vk::SharingMode, Vec<u32>) {
    let mut families = queue_families.to_vec();
    families.sort_unstable();
    families.dedup();

    if families.len() > 1 {
        (vk::SharingMode::CONCURRENT, families)
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// Validate `offset..offset + len` against a buffer of `size` bytes.
fn checked_range(offset: u64, len: u64, size: u64) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(GpuError::OutOfBounds { offset, len, size }),
    }
}

/// A GPU buffer and the memory bound to it.
///
/// Move-only; the buffer is destroyed and its memory freed on drop.
pub struct Buffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    sharing_mode: vk::SharingMode,
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
}

impl Buffer {
    /// Allocate a buffer on the context's device.
    pub fn new(ctx: &GpuContext, desc: &BufferDesc<'_>) -> Result<Self> {
        Self::with_allocator(ctx.device_arc(), ctx.allocator().clone(), desc)
    }

    /// Allocate a buffer from an explicit device and allocator pair.
    pub fn with_allocator(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        desc: &BufferDesc<'_>,
    ) -> Result<Self> {
        let (buffer, allocation) = allocator.lock().allocate_buffer(desc)?;
        let (sharing_mode, _) = sharing_for(desc.queue_families);

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            sharing_mode,
            device,
            allocator,
        })
    }

    /// Create a buffer and fill it through a temporary staging buffer.
    ///
    /// The destination gets `TRANSFER_DST` added to its usage. A `desc.size`
    /// of zero sizes the buffer to `data`; a larger size leaves the tail
    /// zeroed. Blocks until the copy has completed on the pool's queue.
    pub fn upload(
        ctx: &GpuContext,
        pool: &CommandPool,
        desc: &BufferDesc<'_>,
        data: &[u8],
    ) -> Result<Self> {
        let size = if desc.size == 0 {
            data.len() as u64
        } else {
            desc.size
        };
        if (data.len() as u64) > size {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                len: data.len() as u64,
                size,
            });
        }

        let queue = ctx.queue_for_family(pool.queue_family()).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "No queue for command pool family {}",
                pool.queue_family()
            ))
        })?;

        let staging_name = format!("{}-staging", desc.name);
        let mut staging = Self::new(
            ctx,
            &BufferDesc::host_visible(&staging_name, size, vk::BufferUsageFlags::TRANSFER_SRC),
        )?;
        staging.load_data(data, 0)?;
        let tail = (size - data.len() as u64) as usize;
        if tail > 0 {
            staging.load_data(&vec![0; tail], data.len() as u64)?;
        }

        let target = Self::new(
            ctx,
            &desc
                .size(size)
                .usage(desc.usage | vk::BufferUsageFlags::TRANSFER_DST),
        )?;

        // SAFETY: the queue was looked up from the pool's family on this device.
        if let Err(e) = unsafe { target.copy_from(&staging, queue, pool) } {
            // Both buffers are dropped on return; the copy must not be in flight.
            if work_may_be_pending(&e) {
                ctx.wait_idle()?;
            }
            return Err(e);
        }

        Ok(target)
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sharing_mode(&self) -> vk::SharingMode {
        self.sharing_mode
    }

    /// Property flags of the memory type backing this buffer.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.allocation
            .as_ref()
            .map_or_else(vk::MemoryPropertyFlags::empty, Allocation::memory_properties)
    }

    /// Whether the memory is mapped and can be written from the host.
    pub fn is_host_visible(&self) -> bool {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .is_some()
    }

    /// The device this buffer was created on.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Copy host bytes into the buffer at `offset`.
    pub fn load_data(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let range = checked_range(offset, data.len() as u64, self.size)?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or(GpuError::NotHostVisible)?;

        mapped[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy a plain-old-data value into the buffer at `offset`.
    pub fn load_pod<T: bytemuck::Pod>(&mut self, value: &T, offset: u64) -> Result<()> {
        self.load_data(bytemuck::bytes_of(value), offset)
    }

    /// Copy a slice of plain-old-data values into the buffer at `offset`.
    pub fn load_slice<T: bytemuck::Pod>(&mut self, values: &[T], offset: u64) -> Result<()> {
        self.load_data(bytemuck::cast_slice(values), offset)
    }

    /// Read `len` bytes starting at `offset` back to the host.
    pub fn read_data(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = checked_range(offset, len, self.size)?;
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or(GpuError::NotHostVisible)?;

        Ok(mapped[range].to_vec())
    }

    /// Record a copy of the first `self.size()` bytes of `src` into this buffer.
    ///
    /// # Safety
    /// `cmd` must be in the recording state and belong to this buffer's device.
    pub unsafe fn record_copy_from(&self, cmd: vk::CommandBuffer, src: &Self) -> Result<()> {
        if src.size < self.size {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                len: self.size,
                size: src.size,
            });
        }
        unsafe { self.record_copy_from_raw(cmd, src.buffer) };
        Ok(())
    }

    /// Record a copy from a raw buffer handle.
    ///
    /// # Safety
    /// `cmd` must be in the recording state, and `src` must be a valid buffer
    /// of at least `self.size()` bytes with `TRANSFER_SRC` usage.
    pub unsafe fn record_copy_from_raw(&self, cmd: vk::CommandBuffer, src: vk::Buffer) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, src, self.buffer, std::slice::from_ref(&region));
        }
    }

    /// Copy `src` into this buffer on a one-shot command buffer and wait for it.
    ///
    /// Submits one command buffer per call and idles the queue, so batch
    /// uploads should record into a shared command buffer instead.
    ///
    /// # Safety
    /// `queue` must belong to this buffer's device and to the pool's queue family.
    pub unsafe fn copy_from(&self, src: &Self, queue: vk::Queue, pool: &CommandPool) -> Result<()> {
        if src.size < self.size {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                len: self.size,
                size: src.size,
            });
        }
        unsafe { self.copy_from_raw(src.buffer, queue, pool) }
    }

    /// One-shot copy from a raw buffer handle.
    ///
    /// # Safety
    /// Same as [`Buffer::copy_from`], and `src` must be a valid buffer of at
    /// least `self.size()` bytes with `TRANSFER_SRC` usage.
    pub unsafe fn copy_from_raw(
        &self,
        src: vk::Buffer,
        queue: vk::Queue,
        pool: &CommandPool,
    ) -> Result<()> {
        unsafe {
            execute_single_time_commands(&self.device, pool, queue, |cmd| {
                self.record_copy_from_raw(cmd, src);
            })
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };

        let mut allocator = self.allocator.lock();
        if allocator.is_shut_down() {
            tracing::warn!(size = self.size, "Buffer outlived its GPU context; leaking");
            return;
        }

        if let Err(e) = allocator.destroy_buffer(self.buffer, allocation) {
            tracing::error!("Failed to free buffer: {e}");
        }
    }
}
