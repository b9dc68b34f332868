//! Headless GPU harness for buffer tests.
//!
//! Owns a GPU context without any surface and a command pool on the
//! transfer queue family, so uploads, copies and readbacks can be exercised
//! without a window.

use ash::vk;
use tessera_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use tessera_gpu::{Buffer, BufferDesc, CommandPool, Fence, GpuContext, GpuContextBuilder};

use crate::Result;

/// Headless GPU context for testing.
pub struct HeadlessGpu {
    // Declared before the context so it is destroyed first.
    pool: CommandPool,
    context: GpuContext,
}

impl HeadlessGpu {
    /// Create a headless context with validation enabled when available.
    pub fn new() -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("tessera-test")
            .validation(true)
            .build()?;

        // SAFETY: the transfer family was chosen from this device's families.
        let pool = unsafe {
            CommandPool::new(
                context.device_arc(),
                context.transfer_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };

        tracing::debug!(
            "Headless GPU ready: {}",
            context.capabilities().summary()
        );

        Ok(Self { pool, context })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.context.transfer_queue()
    }

    /// Create a buffer filled with `data` through a staging copy.
    pub fn upload(&self, desc: &BufferDesc<'_>, data: &[u8]) -> Result<Buffer> {
        Ok(Buffer::upload(&self.context, &self.pool, desc, data)?)
    }

    /// Copy all of `src` into a host-visible buffer and return its bytes.
    ///
    /// `src` needs `TRANSFER_SRC` usage.
    pub fn read_back(&self, src: &Buffer) -> Result<Vec<u8>> {
        let readback = Buffer::new(
            &self.context,
            &BufferDesc::readback("readback", src.size(), vk::BufferUsageFlags::TRANSFER_DST),
        )?;

        // SAFETY: the transfer queue matches the pool's family.
        unsafe { readback.copy_from(src, self.transfer_queue(), &self.pool)? };

        Ok(readback.read_data(0, readback.size())?)
    }

    /// Record work with `f`, submit it with a fence and wait for completion.
    pub fn submit_recorded<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> tessera_gpu::Result<()>,
    {
        let device = self.context.device();
        let fence = Fence::new(self.context.device_arc(), false)?;
        let cmd = self
            .pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        let result = unsafe {
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .and_then(|()| f(cmd))
                .and_then(|()| end_command_buffer(device, cmd))
                .and_then(|()| {
                    submit_command_buffers(device, self.transfer_queue(), &[cmd], fence.handle())
                })
                .and_then(|()| fence.wait(u64::MAX))
        };

        // The buffer must not be pending when it goes back to the pool.
        if result.is_err() && !fence.is_signaled().unwrap_or(false) {
            self.context.wait_idle()?;
        }
        unsafe { self.pool.free_command_buffer(cmd) };

        Ok(result?)
    }
}

impl Drop for HeadlessGpu {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_bytes_eq, pattern};
    use glam::{Mat4, Vec3};
    use tessera_gpu::{GpuError, MemoryLocation};
    use tessera_render::{Camera, UniformBuffer, UniformBufferOptions, UniformObjects};

    // These tests require a GPU and will be skipped in CI without GPU support

    fn gpu() -> HeadlessGpu {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        HeadlessGpu::new().unwrap()
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_visible_load_and_read() {
        let gpu = gpu();
        let mut buffer = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("host", 256, vk::BufferUsageFlags::TRANSFER_SRC),
        )
        .unwrap();
        assert!(buffer.is_host_visible());
        assert!(buffer
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

        let head = pattern(128, 1);
        let tail = pattern(128, 2);
        buffer.load_data(&head, 0).unwrap();
        buffer.load_data(&tail, 128).unwrap();

        assert_bytes_eq(&head, &buffer.read_data(0, 128).unwrap()).unwrap();
        assert_bytes_eq(&tail, &buffer.read_data(128, 128).unwrap()).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn load_slice_places_values_at_offset() {
        let gpu = gpu();
        let mut buffer = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("slice", 64, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();

        let values = [1.5f32, -2.0, 3.25, 8.0];
        buffer.load_slice(&values, 16).unwrap();
        buffer.load_slice(&[7u32; 4], 0).unwrap();

        let bytes = buffer.read_data(0, 32).unwrap();
        let words: Vec<u32> = bytes[..16]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let floats: Vec<f32> = bytes[16..]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(words, [7; 4]);
        assert_eq!(floats, values);

        assert!(buffer.load_slice(&values, 56).is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_visible_flags_steer_default_location() {
        let gpu = gpu();
        // Default location is device-only; the flags have to move it.
        let desc = BufferDesc::new("steered", 128, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .required_flags(vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(desc.location, MemoryLocation::GpuOnly);

        let mut buffer = Buffer::new(gpu.context(), &desc).unwrap();
        assert!(buffer
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        buffer.load_data(&pattern(128, 6), 0).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn load_past_end_is_rejected() {
        let gpu = gpu();
        let mut buffer = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("small", 64, vk::BufferUsageFlags::UNIFORM_BUFFER),
        )
        .unwrap();

        let err = buffer.load_data(&[0; 32], 40).unwrap_err();
        assert!(matches!(
            err,
            GpuError::OutOfBounds {
                offset: 40,
                len: 32,
                size: 64
            }
        ));
        assert!(buffer.read_data(60, 8).is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn staged_upload_reaches_device_local_memory() {
        let gpu = gpu();
        let data = pattern(4096, 3);
        let buffer = gpu
            .upload(
                &BufferDesc::device_local(
                    "vertices",
                    0,
                    vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                ),
                &data,
            )
            .unwrap();

        assert_eq!(buffer.size(), 4096);
        assert!(buffer
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert_bytes_eq(&data, &gpu.read_back(&buffer).unwrap()).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn upload_zero_fills_tail() {
        let gpu = gpu();
        let data = pattern(100, 4);
        let buffer = gpu
            .upload(
                &BufferDesc::device_local("padded", 256, vk::BufferUsageFlags::TRANSFER_SRC),
                &data,
            )
            .unwrap();

        let bytes = gpu.read_back(&buffer).unwrap();
        assert_bytes_eq(&data, &bytes[..100]).unwrap();
        assert!(bytes[100..].iter().all(|&b| b == 0));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn upload_larger_than_buffer_fails() {
        let gpu = gpu();
        let result = gpu.upload(
            &BufferDesc::device_local("tiny", 8, vk::BufferUsageFlags::STORAGE_BUFFER),
            &[0; 16],
        );
        assert!(result.is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn recorded_copy_into_existing_command_buffer() {
        let gpu = gpu();
        let data = pattern(512, 5);

        let mut src = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("src", 512, vk::BufferUsageFlags::TRANSFER_SRC),
        )
        .unwrap();
        src.load_data(&data, 0).unwrap();

        let dst = Buffer::new(
            gpu.context(),
            &BufferDesc::readback("dst", 512, vk::BufferUsageFlags::TRANSFER_DST),
        )
        .unwrap();

        gpu.submit_recorded(|cmd| unsafe { dst.record_copy_from(cmd, &src) })
            .unwrap();

        assert_bytes_eq(&data, &dst.read_data(0, 512).unwrap()).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn copy_from_smaller_source_is_rejected() {
        let gpu = gpu();
        let src = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("src", 16, vk::BufferUsageFlags::TRANSFER_SRC),
        )
        .unwrap();
        let dst = Buffer::new(
            gpu.context(),
            &BufferDesc::readback("dst", 32, vk::BufferUsageFlags::TRANSFER_DST),
        )
        .unwrap();

        let err = unsafe { dst.copy_from(&src, gpu.transfer_queue(), gpu.pool()) }.unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { size: 16, .. }));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn blocking_copy_overwrites_destination() {
        let gpu = gpu();
        let dst = Buffer::new(
            gpu.context(),
            &BufferDesc::readback(
                "dst",
                64,
                vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            ),
        )
        .unwrap();

        for seed in [10, 20] {
            let data = pattern(64, seed);
            let mut src = Buffer::new(
                gpu.context(),
                &BufferDesc::host_visible("src", 64, vk::BufferUsageFlags::TRANSFER_SRC),
            )
            .unwrap();
            src.load_data(&data, 0).unwrap();

            unsafe { dst.copy_from(&src, gpu.transfer_queue(), gpu.pool()) }.unwrap();
            assert_bytes_eq(&data, &dst.read_data(0, 64).unwrap()).unwrap();
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn sharing_mode_follows_queue_families() {
        let gpu = gpu();
        let families = gpu.context().unique_queue_families();

        let shared = Buffer::new(
            gpu.context(),
            &BufferDesc::device_local("shared", 64, vk::BufferUsageFlags::STORAGE_BUFFER)
                .queue_families(&families),
        )
        .unwrap();
        let expected = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        assert_eq!(shared.sharing_mode(), expected);

        let family = gpu.context().graphics_queue_family();
        let exclusive = Buffer::new(
            gpu.context(),
            &BufferDesc::device_local("exclusive", 64, vk::BufferUsageFlags::STORAGE_BUFFER)
                .queue_families(&[family, family]),
        )
        .unwrap();
        assert_eq!(exclusive.sharing_mode(), vk::SharingMode::EXCLUSIVE);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn impossible_memory_flags_are_rejected() {
        let gpu = gpu();
        // Protected memory is never host-visible.
        let desc = BufferDesc::new("protected", 64, vk::BufferUsageFlags::STORAGE_BUFFER)
            .location(MemoryLocation::CpuToGpu)
            .required_flags(
                vk::MemoryPropertyFlags::PROTECTED | vk::MemoryPropertyFlags::HOST_VISIBLE,
            );

        let err = Buffer::new(gpu.context(), &desc).err().unwrap();
        assert!(matches!(err, GpuError::NoSuitableMemoryType { .. }));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn zero_sized_buffer_is_rejected() {
        let gpu = gpu();
        let result = Buffer::new(
            gpu.context(),
            &BufferDesc::host_visible("empty", 0, vk::BufferUsageFlags::UNIFORM_BUFFER),
        );
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn uniform_buffer_holds_record() {
        let gpu = gpu();
        let mut ubo: UniformBuffer = UniformBuffer::new(gpu.context()).unwrap();
        assert_eq!(ubo.size(), 208);

        let camera = Camera::looking_at(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO, 4.0 / 3.0);
        let uniforms = camera.uniforms(1.25, Mat4::from_rotation_y(0.3));
        ubo.load(&uniforms).unwrap();

        let bytes = ubo.buffer().read_data(0, 208).unwrap();
        assert_bytes_eq(bytemuck::bytes_of(&uniforms), &bytes).unwrap();
        let stored: UniformObjects = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(stored, uniforms);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn uniform_buffer_can_be_shared_and_copied() {
        let gpu = gpu();
        let families = gpu.context().unique_queue_families();
        let mut ubo: UniformBuffer<[f32; 4]> = UniformBuffer::with_options(
            gpu.context(),
            &UniformBufferOptions {
                name: "params",
                queue_families: &families,
                additional_usage: vk::BufferUsageFlags::TRANSFER_SRC,
                ..Default::default()
            },
        )
        .unwrap();
        ubo.load(&[1.0, 2.0, 3.0, 4.0]).unwrap();

        let bytes = gpu.read_back(ubo.buffer()).unwrap();
        let stored: [f32; 4] = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(stored, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn uniform_layout_binding_builds() {
        let gpu = gpu();
        let device = gpu.context().device();
        let builder = tessera_gpu::DescriptorSetLayoutBuilder::new()
            .with_binding(UniformObjects::descriptor_set_layout_binding(0))
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE);

        unsafe {
            let layout = builder.build(device).unwrap();
            assert_ne!(layout, vk::DescriptorSetLayout::null());
            device.destroy_descriptor_set_layout(layout, None);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffers_are_written_into_descriptor_set() {
        let gpu = gpu();
        let device = gpu.context().device();

        let mut ubo: UniformBuffer = UniformBuffer::new(gpu.context()).unwrap();
        ubo.load(&UniformObjects::default()).unwrap();
        let storage = Buffer::new(
            gpu.context(),
            &BufferDesc::device_local("storage", 256, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();

        let info = tessera_gpu::descriptors::buffer_info(ubo.buffer());
        assert_eq!(info.buffer, ubo.handle());
        assert_eq!(info.offset, 0);
        assert_eq!(info.range, 208);

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        unsafe {
            let layout = tessera_gpu::DescriptorSetLayoutBuilder::new()
                .with_binding(UniformObjects::descriptor_set_layout_binding(0))
                .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .build(device)
                .unwrap();
            let pool = device.create_descriptor_pool(&pool_info, None).unwrap();
            let layouts = [layout];
            let set = device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(pool)
                        .set_layouts(&layouts),
                )
                .unwrap()[0];

            // Validation reports mismatched types or ranges here.
            tessera_gpu::write_uniform_buffer(device, set, 0, ubo.buffer());
            tessera_gpu::write_storage_buffer(device, set, 1, &storage);

            device.destroy_descriptor_pool(pool, None);
            device.destroy_descriptor_set_layout(layout, None);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_outliving_context_is_leaked_not_freed() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let context = GpuContextBuilder::new().validation(false).build().unwrap();
        let buffer = Buffer::new(
            &context,
            &BufferDesc::host_visible("orphan", 64, vk::BufferUsageFlags::UNIFORM_BUFFER),
        )
        .unwrap();

        drop(context);
        // Must not touch the destroyed device.
        drop(buffer);
    }
}
