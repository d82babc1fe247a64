//! Error types for sorter construction and use.
//!
//! Configuration and resource-acquisition failures are fatal at
//! construction; the only error a healthy sorter reports afterwards is a
//! caller passing more records than the configured capacity.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `Settings::new` was given a capacity of zero.
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    /// Workgroups must cover at least two records (one lane).
    #[error("values per workgroup must be at least 2, got {0}")]
    WorkGroupTooSmall(u32),

    /// Block histogram counters are packed 16 bits wide, which bounds the
    /// records a single workgroup may cover.
    #[error("values per workgroup must not exceed 65536, got {0}")]
    WorkGroupTooLarge(u32),

    /// Records are copied word-wise on the device.
    #[error("record size must be a non-zero multiple of 4 bytes, got {0}")]
    InvalidRecordSize(u32),

    /// The 4-byte key must lie word-aligned inside the record.
    #[error("key offset {key_offset} does not fit a 4-byte key in a {record_size}-byte record")]
    InvalidKeyOffset { key_offset: u32, record_size: u32 },

    /// Shader failed to compile or link.
    #[error("failed to build shader `{name}`: {log}")]
    ShaderBuild { name: String, log: String },

    /// A uniform the dispatch contract relies on is missing from the
    /// compiled program.
    #[error("uniform `{name}` not found in shader `{shader}`")]
    MissingUniform { shader: String, name: String },

    /// Device refused a storage buffer allocation.
    #[error("failed to allocate a {size} byte storage buffer")]
    BufferAllocation { size: usize },

    /// `sort` was called with more records than the construction-time
    /// capacity. The sorter never resizes.
    #[error("cannot sort {len} records, capacity is {capacity}")]
    LengthExceedsCapacity { len: u32, capacity: u32 },
}
