//! Uniform parameter records and the buffers that carry them.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::marker::PhantomData;
use tessera_gpu::{Buffer, BufferDesc, GpuContext, MemoryLocation, Result};

/// Binding slot used when a shader does not say otherwise.
pub const DEFAULT_BINDING: u32 = 0;

/// Per-frame shader parameters: elapsed time and the three transforms.
///
/// Laid out for std140: every member starts on a 16-byte boundary, so the
/// scalar `time` is followed by 12 bytes of padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformObjects {
    pub time: f32,
    _pad: [f32; 3],
    pub proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
}

impl Default for UniformObjects {
    fn default() -> Self {
        Self::new(0.0, Mat4::IDENTITY, Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

impl UniformObjects {
    pub fn new(time: f32, proj: Mat4, view: Mat4, model: Mat4) -> Self {
        Self {
            time,
            _pad: [0.0; 3],
            proj: proj.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            model: model.to_cols_array_2d(),
        }
    }

    /// Layout binding for a shader reading this record in the vertex and
    /// fragment stages.
    pub fn descriptor_set_layout_binding(binding: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
    }

    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.proj)
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view)
    }

    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.model)
    }
}

/// Creation options for a [`UniformBuffer`].
#[derive(Debug, Clone, Copy)]
pub struct UniformBufferOptions<'a> {
    pub name: &'a str,
    /// Queue families sharing the buffer; two or more make it concurrent.
    pub queue_families: &'a [u32],
    /// Usage on top of `UNIFORM_BUFFER`.
    pub additional_usage: vk::BufferUsageFlags,
    pub required_flags: vk::MemoryPropertyFlags,
}

impl Default for UniformBufferOptions<'_> {
    fn default() -> Self {
        Self {
            name: "uniforms",
            queue_families: &[],
            additional_usage: vk::BufferUsageFlags::empty(),
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
    }
}

impl<'a> UniformBufferOptions<'a> {
    /// Buffer description for a record of type `T`.
    pub fn desc<T>(&self) -> BufferDesc<'a> {
        BufferDesc::new(
            self.name,
            std::mem::size_of::<T>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER | self.additional_usage,
        )
        .location(MemoryLocation::CpuToGpu)
        .required_flags(self.required_flags)
        .queue_families(self.queue_families)
    }
}

/// A host-writable buffer sized for exactly one `T`.
pub struct UniformBuffer<T: Pod = UniformObjects> {
    buffer: Buffer,
    _marker: PhantomData<T>,
}

impl<T: Pod> UniformBuffer<T> {
    /// Create an exclusive uniform buffer with default options.
    pub fn new(ctx: &GpuContext) -> Result<Self> {
        Self::with_options(ctx, &UniformBufferOptions::default())
    }

    pub fn with_options(ctx: &GpuContext, options: &UniformBufferOptions<'_>) -> Result<Self> {
        let buffer = Buffer::new(ctx, &options.desc::<T>())?;
        Ok(Self {
            buffer,
            _marker: PhantomData,
        })
    }

    /// Copy `value` into the buffer.
    pub fn load(&mut self, value: &T) -> Result<()> {
        self.buffer.load_pod(value, 0)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn into_inner(self) -> Buffer {
        self.buffer
    }
}
