//! GPU-accelerated stable radix sort for `u32` keys in device storage
//! buffers.
//!
//! The sort is the 4-way parallel radix sort of Ha, Krüger and Silva,
//! with slight modifications and simplifications: sixteen passes over the
//! 2-bit digits of the key, each pass a per-workgroup digit scan, a
//! multi-level exclusive prefix sum over the block histograms, and a
//! stable scatter between a pair of ping-pong buffers. Prefix sums larger
//! than one workgroup follow the recurrence from NVIDIA's GPU Gems 3.
//!
//! Records wider than the key are sorted whole: configure the record size
//! and the byte offset of the key within it, and payload bytes travel
//! with their key through every pass.
//!
//! The GPU API is abstracted behind the [`ComputeDevice`] trait.
//! [`GlDevice`] drives an OpenGL 4.3 context the caller owns;
//! [`SoftwareDevice`] executes the same kernels on host memory so the
//! pipeline can be tested without a GPU.
//!
//! ## Example
//!
//! ```
//! use gpu_radix_sort::{ComputeDevice, Settings, SoftwareDevice, Sorter};
//!
//! let device = SoftwareDevice::new();
//! let mut sorter = Sorter::new(&device, Settings::new(1024)).unwrap();
//!
//! let keys: Vec<u32> = (0..1024u32).rev().collect();
//! let buffer = device.create_buffer(sorter.capacity() as usize * 4).unwrap();
//! device.write_buffer(buffer, bytemuck::cast_slice(&keys), 0);
//!
//! sorter.sort(buffer, keys.len() as u32).unwrap();
//!
//! let mut sorted = vec![0u32; keys.len()];
//! device.read_buffer(buffer, bytemuck::cast_slice_mut(&mut sorted), 0);
//! assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
//! ```
//!
//! ## References
//!
//! 1. Ha, Linh & Krüger, Jens & Silva, Claudio. (2009). Fast 4-way
//!    parallel radix sorting on GPUs. Comput. Graph. Forum. 28.
//!    2368-2378. 10.1111/j.1467-8659.2009.01542.x.
//! 2. [GPU Gems 3, chapter 39: Parallel Prefix Sum (Scan) with CUDA](https://developer.nvidia.com/gpugems/gpugems3/part-vi-gpu-computing/chapter-39-parallel-prefix-sum-scan-cuda)

mod device;
mod error;
#[cfg(feature = "opengl")]
mod opengl;
mod software;
mod sorter;
mod template;

pub use device::ComputeDevice;
pub use error::Error;
#[cfg(feature = "opengl")]
pub use opengl::GlDevice;
pub use software::{SoftwareBuffer, SoftwareDevice, SoftwareProgram, SoftwareUniform};
pub use sorter::{Settings, Sorter};
