//! Uniform records and uniform buffers for Tessera.
//!
//! This crate provides:
//! - The std140 `UniformObjects` record (time plus projection, view and model)
//! - `UniformBuffer<T>`, a host-writable buffer sized for one record
//! - A camera that fills the view and projection matrices

pub mod camera;
pub mod uniforms;

pub use camera::Camera;
pub use uniforms::{UniformBuffer, UniformBufferOptions, UniformObjects, DEFAULT_BINDING};
