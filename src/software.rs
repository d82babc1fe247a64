//! Host-memory compute device.
//!
//! A [`ComputeDevice`] that executes the sorting kernels on the CPU, one
//! workgroup at a time. It exists so the dispatch orchestration, the
//! block-sum region walk and the edge-lane masking can be exercised by
//! `cargo test` on machines without a GPU; it is not a sorting fallback
//! and makes no attempt at speed.
//!
//! "Compiling" a program classifies the templated source by the interface
//! it declares and reads the substituted geometry back out of its
//! `#define` lines, the same specialisation a real driver would perform.
//! Dispatches then run the matching kernel with the semantics of the GLSL:
//! lanes at or past `n_input` contribute nothing and store nothing, and
//! buffer arithmetic wraps like device `uint`s.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::device::ComputeDevice;
use crate::error::Error;

/// Which of the four sorting kernels a compiled source implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kernel {
    RadixScan,
    PrefixSum,
    AddBlock,
    Scatter,
}

/// Geometry substituted into a program at templating time.
#[derive(Debug, Clone, Copy)]
struct Shape {
    items: u32,
    record_words: u32,
    key_word: u32,
}

struct Program {
    name: String,
    kernel: Kernel,
    shape: Shape,
    declared_uniforms: Vec<String>,
    uniforms: HashMap<String, u32>,
}

#[derive(Default)]
struct State {
    programs: Vec<Option<Program>>,
    buffers: Vec<Option<Vec<u32>>>,
    bindings: HashMap<u32, usize>,
    enabled: Option<usize>,
}

/// CPU-backed device for tests. Single-threaded, like the host contract.
#[derive(Default)]
pub struct SoftwareDevice {
    state: RefCell<State>,
}

/// Program handle issued by [`SoftwareDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareProgram(usize);

/// Buffer handle issued by [`SoftwareDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareBuffer(usize);

/// Uniform handle issued by [`SoftwareDevice`].
#[derive(Debug, Clone)]
pub struct SoftwareUniform {
    program: usize,
    name: String,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeDevice for SoftwareDevice {
    type Program = SoftwareProgram;
    type Uniform = SoftwareUniform;
    type Buffer = SoftwareBuffer;

    fn compile_program(&self, name: &str, source: &str) -> Result<Self::Program, Error> {
        let build_error = |log: &str| Error::ShaderBuild {
            name: name.to_owned(),
            log: log.to_owned(),
        };
        let kernel = classify(source).ok_or_else(|| build_error("unrecognised kernel interface"))?;
        let shape = Shape {
            items: parse_define(source, "WORKGROUP_ITEMS")
                .ok_or_else(|| build_error("missing WORKGROUP_ITEMS"))?,
            record_words: parse_define(source, "RECORD_WORDS")
                .ok_or_else(|| build_error("missing RECORD_WORDS"))?,
            key_word: parse_define(source, "KEY_WORD")
                .ok_or_else(|| build_error("missing KEY_WORD"))?,
        };
        if !shape.items.is_power_of_two() || shape.items < 2 {
            return Err(build_error("workgroup items must be a power of two >= 2"));
        }

        let mut state = self.state.borrow_mut();
        state.programs.push(Some(Program {
            name: name.to_owned(),
            kernel,
            shape,
            declared_uniforms: declared_uniforms(source),
            uniforms: HashMap::new(),
        }));
        Ok(SoftwareProgram(state.programs.len() - 1))
    }

    fn uniform_location(&self, program: Self::Program, name: &str) -> Result<Self::Uniform, Error> {
        let state = self.state.borrow();
        let program_state = state.programs[program.0]
            .as_ref()
            .expect("program used after destroy");
        if !program_state.declared_uniforms.iter().any(|u| u == name) {
            return Err(Error::MissingUniform {
                shader: program_state.name.clone(),
                name: name.to_owned(),
            });
        }
        Ok(SoftwareUniform {
            program: program.0,
            name: name.to_owned(),
        })
    }

    fn create_buffer(&self, size: usize) -> Result<Self::Buffer, Error> {
        let mut state = self.state.borrow_mut();
        state.buffers.push(Some(vec![0u32; size.div_ceil(4)]));
        Ok(SoftwareBuffer(state.buffers.len() - 1))
    }

    fn write_buffer(&self, buffer: Self::Buffer, bytes: &[u8], offset: usize) {
        let mut state = self.state.borrow_mut();
        let words = state.buffers[buffer.0]
            .as_mut()
            .expect("buffer used after destroy");
        bytemuck::cast_slice_mut::<u32, u8>(words)[offset..offset + bytes.len()]
            .copy_from_slice(bytes);
    }

    fn read_buffer(&self, buffer: Self::Buffer, out: &mut [u8], offset: usize) {
        let state = self.state.borrow();
        let words = state.buffers[buffer.0]
            .as_ref()
            .expect("buffer used after destroy");
        out.copy_from_slice(&bytemuck::cast_slice::<u32, u8>(words)[offset..offset + out.len()]);
    }

    fn enable_program(&self, program: Self::Program) {
        self.state.borrow_mut().enabled = Some(program.0);
    }

    fn disable_program(&self) {
        self.state.borrow_mut().enabled = None;
    }

    fn set_uniform_u32(&self, location: &Self::Uniform, value: u32) {
        let mut state = self.state.borrow_mut();
        let program = state.programs[location.program]
            .as_mut()
            .expect("program used after destroy");
        program.uniforms.insert(location.name.clone(), value);
    }

    fn bind_buffer(&self, buffer: Self::Buffer, slot: u32) {
        self.state.borrow_mut().bindings.insert(slot, buffer.0);
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) {
        let state = &mut *self.state.borrow_mut();
        let groups = x * y * z;
        let enabled = state.enabled.expect("dispatch without an enabled program");
        let (kernel, shape, uniforms) = {
            let program = state.programs[enabled]
                .as_ref()
                .expect("program used after destroy");
            (program.kernel, program.shape, program.uniforms.clone())
        };
        let uniform = |name: &str| uniforms.get(name).copied().unwrap_or(0);

        match kernel {
            Kernel::RadixScan => {
                let records = take_bound(state, 1);
                let mut local_prefix = take_bound(state, 2);
                let mut block_sums = take_bound(state, 3);
                run_radix_scan(
                    shape,
                    uniform("n_input"),
                    uniform("n_workgroups"),
                    uniform("offset"),
                    groups,
                    &records.1,
                    &mut local_prefix.1,
                    &mut block_sums.1,
                );
                restore(state, records);
                restore(state, local_prefix);
                restore(state, block_sums);
            }
            Kernel::PrefixSum => {
                let mut sums = take_bound(state, 1);
                run_prefix_sum(
                    shape,
                    uniform("n_input"),
                    uniform("input_offset"),
                    uniform("sum_offset"),
                    groups,
                    &mut sums.1,
                );
                restore(state, sums);
            }
            Kernel::AddBlock => {
                let mut sums = take_bound(state, 1);
                run_add_block(
                    shape,
                    uniform("input_offset"),
                    uniform("sum_offset"),
                    groups,
                    &mut sums.1,
                );
                restore(state, sums);
            }
            Kernel::Scatter => {
                let records = take_bound(state, 1);
                let mut out_records = take_bound(state, 2);
                let local_prefix = take_bound(state, 3);
                let block_sums = take_bound(state, 4);
                run_scatter(
                    shape,
                    uniform("n_input"),
                    uniform("n_workgroups"),
                    uniform("offset"),
                    groups,
                    &records.1,
                    &mut out_records.1,
                    &local_prefix.1,
                    &block_sums.1,
                );
                restore(state, records);
                restore(state, out_records);
                restore(state, local_prefix);
                restore(state, block_sums);
            }
        }
    }

    fn memory_barrier(&self) {
        // Dispatches execute synchronously; writes are always visible.
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        self.state.borrow_mut().buffers[buffer.0] = None;
    }

    fn destroy_program(&self, program: Self::Program) {
        self.state.borrow_mut().programs[program.0] = None;
    }
}

/// Detach the buffer bound at `slot` so kernels can borrow several
/// buffers at once. Slots of one dispatch must name distinct buffers.
fn take_bound(state: &mut State, slot: u32) -> (usize, Vec<u32>) {
    let index = *state
        .bindings
        .get(&slot)
        .unwrap_or_else(|| panic!("dispatch with nothing bound at slot {slot}"));
    let words = state.buffers[index]
        .take()
        .expect("buffer used after destroy or bound to two slots");
    (index, words)
}

fn restore(state: &mut State, taken: (usize, Vec<u32>)) {
    state.buffers[taken.0] = Some(taken.1);
}

fn classify(source: &str) -> Option<Kernel> {
    if source.contains("OutputRecords") {
        Some(Kernel::Scatter)
    } else if source.contains("LocalPrefix") {
        Some(Kernel::RadixScan)
    } else if source.contains("uniform uint n_input") {
        Some(Kernel::PrefixSum)
    } else if source.contains("uniform uint input_offset") {
        Some(Kernel::AddBlock)
    } else {
        None
    }
}

fn parse_define(source: &str, name: &str) -> Option<u32> {
    let marker = format!("#define {name} ");
    let start = source.find(&marker)? + marker.len();
    let line = source[start..].lines().next()?;
    line.trim().trim_end_matches('u').parse().ok()
}

fn declared_uniforms(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix("uniform uint ")?
                .strip_suffix(';')
                .map(str::to_owned)
        })
        .collect()
}

/// Digit histogram and local ranks, per block. A lane past `n_input`
/// contributes no count and stores no rank, mirroring the shader masks.
#[allow(clippy::too_many_arguments)]
fn run_radix_scan(
    shape: Shape,
    n_input: u32,
    n_workgroups: u32,
    offset: u32,
    groups: u32,
    records: &[u32],
    local_prefix: &mut [u32],
    block_sums: &mut [u32],
) {
    for group in 0..groups {
        let base = group * shape.items;
        let mut counts = [0u32; 4];
        for item in 0..shape.items {
            let index = base + item;
            if index >= n_input {
                continue;
            }
            let key = records[(index * shape.record_words + shape.key_word) as usize];
            let digit = ((key >> offset) & 3) as usize;
            local_prefix[index as usize] = counts[digit];
            counts[digit] += 1;
        }
        for digit in 0..4u32 {
            block_sums[(digit * n_workgroups + group) as usize] = counts[digit as usize];
        }
    }
}

/// One level of the block-wise exclusive scan. Entries past `n_input`
/// read as zero and are not stored; block totals are always written.
fn run_prefix_sum(
    shape: Shape,
    n_input: u32,
    input_offset: u32,
    sum_offset: u32,
    groups: u32,
    sums: &mut [u32],
) {
    for group in 0..groups {
        let base = group * shape.items;
        let mut total = 0u32;
        for item in 0..shape.items {
            let index = base + item;
            let value = if index < n_input {
                let entry = &mut sums[(input_offset + index) as usize];
                std::mem::replace(entry, total)
            } else {
                0
            };
            total = total.wrapping_add(value);
        }
        sums[(sum_offset + group) as usize] = total;
    }
}

/// Add-back traversal step. Padded entries are adjusted too, with device
/// `uint` wrapping.
fn run_add_block(shape: Shape, input_offset: u32, sum_offset: u32, groups: u32, sums: &mut [u32]) {
    for group in 0..groups {
        let total = sums[(sum_offset + group) as usize];
        let base = input_offset + group * shape.items;
        for item in 0..shape.items {
            let entry = &mut sums[(base + item) as usize];
            *entry = entry.wrapping_add(total);
        }
    }
}

/// Whole-record scatter to globally scanned positions. Lanes past
/// `n_input` write nothing.
#[allow(clippy::too_many_arguments)]
fn run_scatter(
    shape: Shape,
    n_input: u32,
    n_workgroups: u32,
    offset: u32,
    groups: u32,
    records: &[u32],
    out_records: &mut [u32],
    local_prefix: &[u32],
    block_sums: &[u32],
) {
    let words = shape.record_words as usize;
    for group in 0..groups {
        let base = group * shape.items;
        for item in 0..shape.items {
            let index = base + item;
            if index >= n_input {
                continue;
            }
            let src = index as usize * words;
            let key = records[src + shape.key_word as usize];
            let digit = (key >> offset) & 3;
            let position =
                block_sums[(digit * n_workgroups + group) as usize] + local_prefix[index as usize];
            let dst = position as usize * words;
            out_records[dst..dst + words].copy_from_slice(&records[src..src + words]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ShaderConfig;

    fn shape(items: u32) -> Shape {
        Shape {
            items,
            record_words: 1,
            key_word: 0,
        }
    }

    #[test]
    fn classifies_every_rendered_kernel() {
        let config = ShaderConfig {
            workgroup_items: 8,
            record_words: 2,
            key_word: 1,
        };
        let device = SoftwareDevice::new();

        let program = device
            .compile_program("radix_scan", &config.render_radix_scan())
            .unwrap();
        assert!(device.uniform_location(program, "n_workgroups").is_ok());

        let program = device
            .compile_program("prefix_sum", &config.render_prefix_sum())
            .unwrap();
        assert!(device.uniform_location(program, "sum_offset").is_ok());
        assert!(matches!(
            device.uniform_location(program, "n_workgroups"),
            Err(Error::MissingUniform { .. })
        ));

        assert!(device
            .compile_program("add_block", &config.render_add_block())
            .is_ok());
        assert!(device
            .compile_program("scatter", &config.render_scatter())
            .is_ok());
        assert!(device.compile_program("junk", "void main() {}").is_err());
    }

    #[test]
    fn radix_scan_ranks_and_histograms() {
        // Digits at offset 0: [1, 0, 1, 3 | 0, 0, 2, _] with n_input = 7.
        let records = [1u32, 0, 1, 3, 4, 8, 2, 999];
        let mut local_prefix = [u32::MAX; 8];
        let mut block_sums = [u32::MAX; 8];
        run_radix_scan(shape(4), 7, 2, 0, 2, &records, &mut local_prefix, &mut block_sums);

        assert_eq!(local_prefix[..7], [0, 0, 1, 0, 0, 1, 0]);
        // Masked lane stores nothing.
        assert_eq!(local_prefix[7], u32::MAX);
        // Digit-major rows: [c0_g0, c0_g1, c1_g0, c1_g1, ...].
        assert_eq!(block_sums, [1, 2, 2, 0, 0, 1, 1, 0]);
    }

    #[test]
    fn prefix_sum_masks_the_padded_tail() {
        let mut sums = [3u32, 1, 4, 99, 0, 0, 0, 0, u32::MAX, u32::MAX];
        // Two blocks of 4, only the first 3 entries are meaningful.
        run_prefix_sum(shape(4), 3, 0, 8, 2, &mut sums);
        assert_eq!(sums[..3], [0, 3, 4]);
        // Padded entry is left alone.
        assert_eq!(sums[3], 99);
        // Totals are written even for the all-padded block.
        assert_eq!(sums[8..], [8, 0]);
    }

    #[test]
    fn add_block_folds_totals_back() {
        let mut sums = [0u32, 1, 2, 3, 10, 20];
        run_add_block(shape(2), 0, 4, 2, &mut sums);
        assert_eq!(sums[..4], [10, 11, 22, 23]);
    }

    #[test]
    fn scatter_places_records_stably() {
        // One block, digits [1, 0, 1, 0] at offset 0.
        let records = [5u32, 4, 9, 8];
        let local_prefix = [0u32, 0, 1, 1];
        // Scanned histogram for one block: digit 0 starts at 0, digit 1 at 2.
        let block_sums = [0u32, 2, 4, 4];
        let mut out = [0u32; 4];
        run_scatter(
            shape(4),
            4,
            1,
            0,
            1,
            &records,
            &mut out,
            &local_prefix,
            &block_sums,
        );
        assert_eq!(out, [4, 8, 5, 9]);
    }

    #[test]
    fn scatter_carries_payload_words() {
        // Two-word records, key in word 1, one block of two records.
        let records = [100u32, 1, 200, 0];
        let local_prefix = [0u32, 0];
        let block_sums = [0u32, 1, 2, 2];
        let mut out = [0u32; 4];
        run_scatter(
            Shape {
                items: 2,
                record_words: 2,
                key_word: 1,
            },
            2,
            1,
            0,
            1,
            &records,
            &mut out,
            &local_prefix,
            &block_sums,
        );
        assert_eq!(out, [200, 0, 100, 1]);
    }
}
