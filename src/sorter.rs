//! GPU radix sorter.
//!
//! Implements the 4-way (2 bits per pass) stable radix sort of Ha, Krüger
//! and Silva, with the arbitrarily-large prefix sums done the way GPU Gems
//! 3 chapter 39 does: per-block scans, a recursive scan of the block
//! totals, and an add-back traversal.
//!
//! A [`Sorter`] owns four compiled compute programs, their uniform
//! locations, and three auxiliary storage buffers, all sized once at
//! construction. [`Sorter::sort`] enqueues sixteen passes over the two-bit
//! digits of the key, ping-ponging records between the caller's buffer and
//! an internal scratch buffer; sixteen being even, the sorted records end
//! up back in the caller's buffer.

use log::debug;

use crate::device::ComputeDevice;
use crate::error::Error;
use crate::template::ShaderConfig;

/// Sorter configuration.
///
/// Only the capacity is mandatory. The defaults sort bare `u32` keys with
/// 256 records per workgroup.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    capacity: u32,
    values_per_workgroup: u32,
    key_offset: u32,
    record_size: u32,
}

impl Settings {
    /// Start a configuration for at most `capacity` records per sort.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            values_per_workgroup: 256,
            key_offset: 0,
            record_size: 4,
        }
    }

    /// Records covered by one workgroup. Rounded up to the next power of
    /// two; must be between 2 and 65536.
    pub fn with_values_per_workgroup(mut self, count: u32) -> Self {
        self.values_per_workgroup = count;
        self
    }

    /// Byte offset of the 4-byte key inside each record. Must be a
    /// multiple of 4 and leave room for the key.
    pub fn with_key_offset(mut self, bytes: u32) -> Self {
        self.key_offset = bytes;
        self
    }

    /// Byte size of each record. Must be a non-zero multiple of 4.
    pub fn with_record_size(mut self, bytes: u32) -> Self {
        self.record_size = bytes;
        self
    }

    fn resolve(self) -> Result<Geometry, Error> {
        if self.capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        if self.values_per_workgroup < 2 {
            return Err(Error::WorkGroupTooSmall(self.values_per_workgroup));
        }
        if self.values_per_workgroup > 1 << 16 {
            return Err(Error::WorkGroupTooLarge(self.values_per_workgroup));
        }
        if self.record_size == 0 || self.record_size % 4 != 0 {
            return Err(Error::InvalidRecordSize(self.record_size));
        }
        if self.key_offset % 4 != 0 || self.key_offset + 4 > self.record_size {
            return Err(Error::InvalidKeyOffset {
                key_offset: self.key_offset,
                record_size: self.record_size,
            });
        }
        let values_per_workgroup = self.values_per_workgroup.next_power_of_two();
        Ok(Geometry {
            values_per_workgroup,
            capacity: self.capacity.next_multiple_of(values_per_workgroup),
            key_offset: self.key_offset,
            record_size: self.record_size,
        })
    }
}

/// Validated construction-time geometry. `capacity` is the effective
/// capacity, rounded up to a whole number of workgroups.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    values_per_workgroup: u32,
    capacity: u32,
    key_offset: u32,
    record_size: u32,
}

struct RadixScanProgram<D: ComputeDevice> {
    program: D::Program,
    n_input: D::Uniform,
    n_workgroups: D::Uniform,
    offset: D::Uniform,
}

struct PrefixSumProgram<D: ComputeDevice> {
    program: D::Program,
    n_input: D::Uniform,
    input_offset: D::Uniform,
    sum_offset: D::Uniform,
}

struct AddBlockProgram<D: ComputeDevice> {
    program: D::Program,
    input_offset: D::Uniform,
    sum_offset: D::Uniform,
}

struct ScatterProgram<D: ComputeDevice> {
    program: D::Program,
    n_input: D::Uniform,
    n_workgroups: D::Uniform,
    offset: D::Uniform,
}

/// Destroys partially constructed resources if `Sorter::new` bails out.
struct ResourceGuard<'a, D: ComputeDevice> {
    device: &'a D,
    programs: Vec<D::Program>,
    buffers: Vec<D::Buffer>,
}

impl<'a, D: ComputeDevice> ResourceGuard<'a, D> {
    fn new(device: &'a D) -> Self {
        Self {
            device,
            programs: Vec::new(),
            buffers: Vec::new(),
        }
    }

    fn program(&mut self, name: &str, source: &str) -> Result<D::Program, Error> {
        let program = self.device.compile_program(name, source)?;
        self.programs.push(program);
        Ok(program)
    }

    fn buffer(&mut self, size: usize) -> Result<D::Buffer, Error> {
        let buffer = self.device.create_buffer(size)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    fn disarm(&mut self) {
        self.programs.clear();
        self.buffers.clear();
    }
}

impl<D: ComputeDevice> Drop for ResourceGuard<'_, D> {
    fn drop(&mut self) {
        for buffer in self.buffers.iter().rev() {
            self.device.destroy_buffer(*buffer);
        }
        for program in self.programs.iter().rev() {
            self.device.destroy_program(*program);
        }
    }
}

/// Stable GPU radix sort over `u32` keys in device storage buffers.
pub struct Sorter<'a, D: ComputeDevice> {
    device: &'a D,
    values_per_workgroup: u32,
    capacity: u32,
    record_size: u32,
    radix_scan: RadixScanProgram<D>,
    prefix_sum: PrefixSumProgram<D>,
    add_block: AddBlockProgram<D>,
    scatter: ScatterProgram<D>,
    /// Ping-pong partner of the caller's record buffer.
    scratch: D::Buffer,
    /// Per-record rank among same-digit records of its block.
    local_prefix: D::Buffer,
    /// Digit-major block histograms plus every scan level.
    block_sums: D::Buffer,
}

impl<'a, D: ComputeDevice> Sorter<'a, D> {
    /// Compile the four kernels for this configuration, resolve their
    /// uniforms and allocate the auxiliary buffers.
    ///
    /// Any failure destroys whatever was already created before returning.
    pub fn new(device: &'a D, settings: Settings) -> Result<Self, Error> {
        let geometry = settings.resolve()?;
        let shader = ShaderConfig {
            workgroup_items: geometry.values_per_workgroup,
            record_words: geometry.record_size / 4,
            key_word: geometry.key_offset / 4,
        };

        let mut guard = ResourceGuard::new(device);

        let program = guard.program("radix_scan", &shader.render_radix_scan())?;
        let radix_scan = RadixScanProgram {
            n_input: device.uniform_location(program, "n_input")?,
            n_workgroups: device.uniform_location(program, "n_workgroups")?,
            offset: device.uniform_location(program, "offset")?,
            program,
        };

        let program = guard.program("prefix_sum", &shader.render_prefix_sum())?;
        let prefix_sum = PrefixSumProgram {
            n_input: device.uniform_location(program, "n_input")?,
            input_offset: device.uniform_location(program, "input_offset")?,
            sum_offset: device.uniform_location(program, "sum_offset")?,
            program,
        };

        let program = guard.program("add_block", &shader.render_add_block())?;
        let add_block = AddBlockProgram {
            input_offset: device.uniform_location(program, "input_offset")?,
            sum_offset: device.uniform_location(program, "sum_offset")?,
            program,
        };

        let program = guard.program("scatter", &shader.render_scatter())?;
        let scatter = ScatterProgram {
            n_input: device.uniform_location(program, "n_input")?,
            n_workgroups: device.uniform_location(program, "n_workgroups")?,
            offset: device.uniform_location(program, "offset")?,
            program,
        };

        let capacity = geometry.capacity as usize;
        let scratch = guard.buffer(capacity * geometry.record_size as usize)?;
        let local_prefix = guard.buffer(capacity * 4)?;
        let block_sums = guard.buffer(block_sum_entries(geometry) as usize * 4)?;

        guard.disarm();
        debug!(
            "radix sorter ready: {} records of {} bytes, {} values per workgroup",
            geometry.capacity, geometry.record_size, geometry.values_per_workgroup
        );

        Ok(Self {
            device,
            values_per_workgroup: geometry.values_per_workgroup,
            capacity: geometry.capacity,
            record_size: geometry.record_size,
            radix_scan,
            prefix_sum,
            add_block,
            scatter,
            scratch,
            local_prefix,
            block_sums,
        })
    }

    /// Effective capacity in records, rounded up to a whole number of
    /// workgroups. The caller's buffer must hold at least this many
    /// records so the scatter of a ragged final block stays in bounds.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Records covered by one workgroup, after power-of-two rounding.
    pub fn values_per_workgroup(&self) -> u32 {
        self.values_per_workgroup
    }

    /// Byte size of one record.
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Stable-sort the first `len` records of `records` in place by their
    /// `u32` key, ascending.
    ///
    /// Work is enqueued, not awaited; it is complete by the time a
    /// subsequent buffer read observes it. The sorter mutates `records`
    /// and its own buffers for the duration, so the caller must not touch
    /// any of them until then.
    pub fn sort(&mut self, records: D::Buffer, len: u32) -> Result<(), Error> {
        if len > self.capacity {
            return Err(Error::LengthExceedsCapacity {
                len,
                capacity: self.capacity,
            });
        }
        // Zero workgroups is driver roulette, and there is nothing to do.
        if len == 0 {
            return Ok(());
        }
        let workgroups = len.next_multiple_of(self.values_per_workgroup) / self.values_per_workgroup;
        let device = self.device;

        let mut src = records;
        let mut dst = self.scratch;
        for pass in 0..16u32 {
            let offset = pass * 2;

            // Build each record's in-block rank and the digit-major block
            // histogram rows.
            device.enable_program(self.radix_scan.program);
            device.set_uniform_u32(&self.radix_scan.n_input, len);
            device.set_uniform_u32(&self.radix_scan.n_workgroups, workgroups);
            device.set_uniform_u32(&self.radix_scan.offset, offset);
            device.bind_buffer(src, 1);
            device.bind_buffer(self.local_prefix, 2);
            device.bind_buffer(self.block_sums, 3);
            device.dispatch(workgroups, 1, 1);
            device.disable_program();
            device.memory_barrier();

            // Scan the flat 4×N histogram into global bucket offsets.
            self.prefix_sum_block_sums(workgroups);

            // Place every record at its bucket offset plus local rank.
            device.enable_program(self.scatter.program);
            device.set_uniform_u32(&self.scatter.n_input, len);
            device.set_uniform_u32(&self.scatter.n_workgroups, workgroups);
            device.set_uniform_u32(&self.scatter.offset, offset);
            device.bind_buffer(src, 1);
            device.bind_buffer(dst, 2);
            device.bind_buffer(self.local_prefix, 3);
            device.bind_buffer(self.block_sums, 4);
            device.dispatch(workgroups, 1, 1);
            device.disable_program();
            device.memory_barrier();

            std::mem::swap(&mut src, &mut dst);
        }
        // Sixteen passes are even, so the final swap leaves the sorted
        // records in the caller's buffer.
        Ok(())
    }

    /// Exclusive prefix sum over the flat `4 * workgroups` histogram
    /// entries at the start of the block-sum buffer.
    ///
    /// The downward sweep scans each level in place and emits block totals
    /// into the next region of the buffer; once a level fits in a single
    /// workgroup the add-back traversal folds the scanned totals back in,
    /// deepest level first.
    fn prefix_sum_block_sums(&self, workgroups: u32) {
        let levels = ScanLevels::plan(workgroups, self.values_per_workgroup);
        for level in &levels.down {
            self.run_prefix_sum(level);
        }
        let Some(top) = levels.top else {
            return;
        };
        self.run_prefix_sum(&top);
        for level in levels.down.iter().rev() {
            self.run_add_block(level);
        }
    }

    fn run_prefix_sum(&self, level: &ScanLevel) {
        let device = self.device;
        device.enable_program(self.prefix_sum.program);
        device.set_uniform_u32(&self.prefix_sum.n_input, level.len);
        device.set_uniform_u32(&self.prefix_sum.input_offset, level.input_offset);
        device.set_uniform_u32(&self.prefix_sum.sum_offset, level.sum_offset);
        device.bind_buffer(self.block_sums, 1);
        device.dispatch((level.size / self.values_per_workgroup).max(1), 1, 1);
        device.disable_program();
        device.memory_barrier();
    }

    fn run_add_block(&self, level: &ScanLevel) {
        let device = self.device;
        device.enable_program(self.add_block.program);
        device.set_uniform_u32(&self.add_block.input_offset, level.input_offset);
        device.set_uniform_u32(&self.add_block.sum_offset, level.sum_offset);
        device.bind_buffer(self.block_sums, 1);
        device.dispatch((level.size / self.values_per_workgroup).max(1), 1, 1);
        device.disable_program();
        device.memory_barrier();
    }
}

impl<D: ComputeDevice> Drop for Sorter<'_, D> {
    /// Releases device resources in reverse creation order.
    fn drop(&mut self) {
        let device = self.device;
        device.destroy_buffer(self.block_sums);
        device.destroy_buffer(self.local_prefix);
        device.destroy_buffer(self.scratch);
        device.destroy_program(self.scatter.program);
        device.destroy_program(self.add_block.program);
        device.destroy_program(self.prefix_sum.program);
        device.destroy_program(self.radix_scan.program);
    }
}

/// Entries (32-bit words) of the block-sum buffer: room for the four
/// histogram rows of the largest possible dispatch and, via the factor
/// two, for every recursive scan level above them.
fn block_sum_entries(geometry: Geometry) -> u32 {
    let per_row = (geometry.capacity.next_power_of_two() / geometry.values_per_workgroup)
        .max(geometry.values_per_workgroup);
    per_row * 4 * 2
}

/// One level of the multi-level scan: `size` entries starting at
/// `input_offset`, of which the first `len` are meaningful, with block
/// totals deposited at `sum_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanLevel {
    size: u32,
    input_offset: u32,
    sum_offset: u32,
    len: u32,
}

/// The region walk for one histogram scan. `down` holds the levels of at
/// least one full workgroup; `top` is the final sub-workgroup scan of the
/// remaining totals, absent when the whole sequence fits one workgroup.
#[derive(Debug, PartialEq, Eq)]
struct ScanLevels {
    down: Vec<ScanLevel>,
    top: Option<ScanLevel>,
}

impl ScanLevels {
    fn plan(workgroups: u32, values_per_workgroup: u32) -> Self {
        let len = 4 * workgroups;
        let initial_size = len.next_multiple_of(values_per_workgroup).next_power_of_two();

        let mut down = Vec::new();
        let mut size = initial_size;
        let mut input_offset = 0;
        let mut sum_offset = initial_size;
        let mut len = len;
        while size >= values_per_workgroup {
            down.push(ScanLevel {
                size,
                input_offset,
                sum_offset,
                len,
            });
            input_offset += size;
            sum_offset = input_offset + size / values_per_workgroup;
            size /= values_per_workgroup;
            len = size;
        }
        let top = (initial_size > values_per_workgroup).then_some(ScanLevel {
            size,
            input_offset,
            sum_offset,
            len,
        });
        Self { down, top }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_reject_zero_capacity() {
        assert!(matches!(
            Settings::new(0).resolve(),
            Err(Error::ZeroCapacity)
        ));
    }

    #[test]
    fn settings_reject_workgroup_bounds() {
        assert!(matches!(
            Settings::new(16).with_values_per_workgroup(1).resolve(),
            Err(Error::WorkGroupTooSmall(1))
        ));
        assert!(matches!(
            Settings::new(16).with_values_per_workgroup(1 << 17).resolve(),
            Err(Error::WorkGroupTooLarge(_))
        ));
    }

    #[test]
    fn settings_reject_bad_record_layout() {
        assert!(matches!(
            Settings::new(16).with_record_size(6).resolve(),
            Err(Error::InvalidRecordSize(6))
        ));
        assert!(matches!(
            Settings::new(16).with_record_size(0).resolve(),
            Err(Error::InvalidRecordSize(0))
        ));
        assert!(matches!(
            Settings::new(16).with_key_offset(4).resolve(),
            Err(Error::InvalidKeyOffset { .. })
        ));
        assert!(matches!(
            Settings::new(16).with_record_size(8).with_key_offset(2).resolve(),
            Err(Error::InvalidKeyOffset { .. })
        ));
    }

    #[test]
    fn settings_round_workgroup_and_capacity() {
        let geometry = Settings::new(1000)
            .with_values_per_workgroup(300)
            .resolve()
            .unwrap();
        assert_eq!(geometry.values_per_workgroup, 512);
        assert_eq!(geometry.capacity, 1024);

        let geometry = Settings::new(1024).resolve().unwrap();
        assert_eq!(geometry.values_per_workgroup, 256);
        assert_eq!(geometry.capacity, 1024);
    }

    #[test]
    fn single_level_scan_has_no_add_back() {
        // 4 entries round up to one workgroup of 256.
        let levels = ScanLevels::plan(1, 256);
        assert_eq!(
            levels.down,
            vec![ScanLevel {
                size: 256,
                input_offset: 0,
                sum_offset: 256,
                len: 4,
            }]
        );
        assert_eq!(levels.top, None);
    }

    #[test]
    fn deep_scan_levels_tile_the_buffer() {
        // 3 workgroups of 2 values: 12 entries, rounded to 16.
        let levels = ScanLevels::plan(3, 2);
        assert_eq!(
            levels.down,
            vec![
                ScanLevel { size: 16, input_offset: 0, sum_offset: 16, len: 12 },
                ScanLevel { size: 8, input_offset: 16, sum_offset: 24, len: 8 },
                ScanLevel { size: 4, input_offset: 24, sum_offset: 28, len: 4 },
                ScanLevel { size: 2, input_offset: 28, sum_offset: 30, len: 2 },
            ]
        );
        assert_eq!(
            levels.top,
            Some(ScanLevel { size: 1, input_offset: 30, sum_offset: 31, len: 1 })
        );

        // Every level's totals land exactly where the next level reads.
        for pair in levels.down.windows(2) {
            assert_eq!(pair[0].sum_offset, pair[1].input_offset);
        }
    }

    #[test]
    fn scan_levels_fit_the_block_sum_buffer() {
        for (capacity, values_per_workgroup) in
            [(1024, 2), (8192, 256), (1 << 20, 256), (1 << 20, 4), (6, 2)]
        {
            let geometry = Settings::new(capacity)
                .with_values_per_workgroup(values_per_workgroup)
                .resolve()
                .unwrap();
            let entries = block_sum_entries(geometry);
            let workgroups = geometry.capacity / geometry.values_per_workgroup;
            let levels = ScanLevels::plan(workgroups, geometry.values_per_workgroup);
            for level in levels.down.iter().chain(levels.top.iter()) {
                let groups = (level.size / geometry.values_per_workgroup).max(1);
                assert!(level.input_offset + level.size <= entries);
                assert!(level.sum_offset + groups <= entries);
            }
        }
    }
}
