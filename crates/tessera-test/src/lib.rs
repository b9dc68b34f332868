//! Test harness for Tessera.
//!
//! Provides a headless GPU context with a transfer command pool, plus
//! helpers to submit recorded work and read buffers back to the host.

pub mod harness;

pub use harness::HeadlessGpu;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] tessera_gpu::GpuError),
    #[error("Readback mismatch at byte {index}: expected {expected:#04x}, got {actual:#04x}")]
    Mismatch {
        index: usize,
        expected: u8,
        actual: u8,
    },
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Compare a readback against the expected bytes, reporting the first difference.
pub fn assert_bytes_eq(expected: &[u8], actual: &[u8]) -> Result<()> {
    if let Some(index) = expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
    {
        return Err(TestError::Mismatch {
            index,
            expected: expected[index],
            actual: actual[index],
        });
    }
    if expected.len() != actual.len() {
        let index = expected.len().min(actual.len());
        return Err(TestError::Mismatch {
            index,
            expected: expected.get(index).copied().unwrap_or_default(),
            actual: actual.get(index).copied().unwrap_or_default(),
        });
    }
    Ok(())
}

/// Deterministic byte pattern for upload tests.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
