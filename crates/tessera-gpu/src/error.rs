//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A step of a one-shot command submission failed.
    #[error("Cannot {operation}: {result}")]
    Command {
        operation: &'static str,
        result: vk::Result,
    },

    /// No memory type matches the requested property flags and filter mask.
    #[error("Cannot find suitable memory type (required {required:?}, filter {filter:#034b})")]
    NoSuitableMemoryType {
        required: vk::MemoryPropertyFlags,
        filter: u32,
    },

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The buffer's memory cannot be mapped on the host.
    #[error("Buffer memory is not host-visible")]
    NotHostVisible,

    /// A host access or copy falls outside the buffer.
    #[error("Range {offset}..{offset}+{len} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Build a closure that tags a Vulkan result with the failing step.
    pub(crate) fn command(operation: &'static str) -> impl Fn(vk::Result) -> Self {
        move |result| Self::Command { operation, result }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_names_the_step() {
        let err = GpuError::command("submit queue")(vk::Result::ERROR_DEVICE_LOST);
        let msg = err.to_string();
        assert!(msg.starts_with("Cannot submit queue"), "{msg}");
    }

    #[test]
    fn out_of_bounds_message() {
        let err = GpuError::OutOfBounds {
            offset: 16,
            len: 32,
            size: 40,
        };
        assert_eq!(
            err.to_string(),
            "Range 16..16+32 exceeds buffer of 40 bytes"
        );
    }

    #[test]
    fn vulkan_result_converts() {
        let err: GpuError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }
}
