//! Vulkan buffer allocation and transfer layer for Tessera.
//!
//! This crate provides:
//! - Headless Vulkan instance and device management
//! - Memory allocation via gpu-allocator, with memory-type lookup
//! - RAII buffers with host upload and GPU-side copies
//! - Command pool and one-shot submission helpers
//! - Descriptor helpers for binding buffers

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use buffer::{sharing_for, Buffer, BufferDesc};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{execute_single_time_commands, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{write_storage_buffer, write_uniform_buffer, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use gpu_allocator::MemoryLocation;
pub use memory::{find_memory_type, location_for, GpuAllocator};
pub use sync::Fence;
