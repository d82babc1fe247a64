//! The compute-device contract the sorter is written against.
//!
//! The sorter never talks to a GPU API directly. Everything it needs is
//! expressed as a handful of primitives on an abstract device: compile a
//! compute program from source, resolve named uniforms, create and fill
//! storage buffers, bind them to slots, dispatch, and fence storage writes
//! between dispatches. [`crate::opengl::GlDevice`] maps these onto an
//! OpenGL 4.3 context; [`crate::software::SoftwareDevice`] executes them
//! on host memory for tests and machines without a GPU.
//!
//! All handles are plain values. A handle is only meaningful on the device
//! that issued it.

use crate::error::Error;

/// Minimal compute API consumed by [`crate::Sorter`].
///
/// Implementations are driven from a single host thread; methods enqueue
/// work and may return before the device has executed it. The only
/// ordering guarantee the sorter relies on is [`memory_barrier`]: storage
/// writes enqueued before the barrier are visible to dispatches enqueued
/// after it.
///
/// [`memory_barrier`]: ComputeDevice::memory_barrier
pub trait ComputeDevice {
    /// Linked compute program handle.
    type Program: Copy;
    /// Resolved uniform location.
    type Uniform: Clone;
    /// Storage buffer handle.
    type Buffer: Copy;

    /// Compile and link a compute program. `name` only labels errors.
    fn compile_program(&self, name: &str, source: &str) -> Result<Self::Program, Error>;

    /// Resolve a uniform by name. Failing to find it is fatal: the
    /// dispatch contract depends on every uniform being settable.
    fn uniform_location(&self, program: Self::Program, name: &str) -> Result<Self::Uniform, Error>;

    /// Allocate a storage buffer of `size` bytes with undefined contents.
    fn create_buffer(&self, size: usize) -> Result<Self::Buffer, Error>;

    /// Copy `bytes` into the buffer at `offset` bytes.
    fn write_buffer(&self, buffer: Self::Buffer, bytes: &[u8], offset: usize);

    /// Read `out.len()` bytes from the buffer at `offset` bytes, blocking
    /// until previously enqueued work has produced them.
    fn read_buffer(&self, buffer: Self::Buffer, out: &mut [u8], offset: usize);

    /// Make `program` current for uniform updates and dispatches.
    fn enable_program(&self, program: Self::Program);

    /// Clear the current program.
    fn disable_program(&self);

    /// Set a `uint` uniform on the currently enabled program.
    fn set_uniform_u32(&self, location: &Self::Uniform, value: u32);

    /// Bind a storage buffer to a shader binding slot.
    fn bind_buffer(&self, buffer: Self::Buffer, slot: u32);

    /// Launch `x * y * z` workgroups of the enabled program.
    fn dispatch(&self, x: u32, y: u32, z: u32);

    /// Fence storage-buffer writes against subsequent dispatches.
    fn memory_barrier(&self);

    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn destroy_program(&self, program: Self::Program);
}
