//! Tessera upload demo
//!
//! Uploads a byte pattern into device-local memory through a staging buffer,
//! copies it back into host-visible memory and checks it, then fills a
//! uniform buffer from a camera.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-upload -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--size <BYTES>`: Number of bytes to upload (default: 65536)
//! - `--validation`: Enable Vulkan validation layers
//! - `--app-name <NAME>`: Application name reported to the driver
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::time::Instant;

use anyhow::{ensure, Context};
use ash::vk;
use glam::{Mat4, Vec3};
use tessera_gpu::{Buffer, BufferDesc, CommandPool, GpuContextBuilder};
use tessera_render::{Camera, UniformBuffer, UniformObjects};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Demo settings (from CLI or defaults).
#[derive(Debug, Clone)]
struct UploadConfig {
    size: u64,
    validation: bool,
    app_name: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            size: 64 * 1024,
            validation: false,
            app_name: "tessera-upload".to_string(),
        }
    }
}

impl UploadConfig {
    /// Parse settings from command line arguments.
    fn from_args(args: &[String]) -> Self {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--size" => {
                    if let Some(v) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        config.size = v;
                        i += 1;
                    }
                }
                "--app-name" => {
                    if let Some(v) = args.get(i + 1) {
                        config.app_name.clone_from(v);
                        i += 1;
                    }
                }
                "--validation" => config.validation = true,
                _ => {}
            }
            i += 1;
        }

        config
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = UploadConfig::from_args(&args);
    ensure!(config.size > 0, "--size must be greater than zero");
    run(&config)
}

fn run(config: &UploadConfig) -> anyhow::Result<()> {
    let context = GpuContextBuilder::new()
        .app_name(config.app_name.as_str())
        .validation(config.validation)
        .build()
        .context("Failed to create GPU context")?;

    // SAFETY: the transfer family belongs to this context's device.
    let pool = unsafe {
        CommandPool::new(
            context.device_arc(),
            context.transfer_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?
    };

    let data: Vec<u8> = (0..config.size).map(|i| (i % 251) as u8).collect();

    let start = Instant::now();
    let device_buffer = Buffer::upload(
        &context,
        &pool,
        &BufferDesc::device_local(
            "demo-data",
            0,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        ),
        &data,
    )?;
    let upload_time = start.elapsed();
    info!(
        bytes = device_buffer.size(),
        memory = ?device_buffer.memory_properties(),
        "Uploaded in {upload_time:?}"
    );

    let readback = Buffer::new(
        &context,
        &BufferDesc::readback("demo-readback", config.size, vk::BufferUsageFlags::TRANSFER_DST),
    )?;
    let start = Instant::now();
    // SAFETY: the transfer queue matches the pool's family.
    unsafe { readback.copy_from(&device_buffer, context.transfer_queue(), &pool)? };
    let bytes = readback.read_data(0, config.size)?;
    info!("Read back in {:?}", start.elapsed());

    ensure!(bytes == data, "Readback does not match uploaded data");
    info!("Readback matches {} uploaded bytes", bytes.len());

    let mut uniforms: UniformBuffer<UniformObjects> = UniformBuffer::new(&context)?;
    let camera = Camera::looking_at(Vec3::new(0.0, 3.0, 8.0), Vec3::ZERO, 16.0 / 9.0);
    uniforms.load(&camera.uniforms(0.0, Mat4::IDENTITY))?;
    info!(size = uniforms.size(), "Uniform buffer loaded");

    // Buffers and the pool must go before the context destroys the device.
    drop(uniforms);
    drop(readback);
    drop(device_buffer);
    drop(pool);
    context.wait_idle()?;

    Ok(())
}

fn print_help() {
    eprintln!(
        "Tessera upload demo

USAGE:
    cargo run -p tessera-upload -- [OPTIONS]

OPTIONS:
    --size <BYTES>      Number of bytes to upload (default: 65536)
    --validation        Enable Vulkan validation layers
    --app-name <NAME>   Application name reported to the driver
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
