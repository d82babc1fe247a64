//! OpenGL 4.3 compute device.
//!
//! Maps the device contract onto a `glow` context supplied by the caller.
//! Creating the context (and the window or pbuffer behind it) stays the
//! caller's job, as does keeping all calls on the thread the context is
//! current on; the sorter inherits that affinity through this type.
//!
//! Uniforms are set with `glUniform1ui` against the program's declared
//! `uint` type, storage buffers bind with `glBindBufferBase`, and the
//! pass-to-pass ordering contract is `glMemoryBarrier` on storage writes.

use glow::HasContext;

use crate::device::ComputeDevice;
use crate::error::Error;

/// A [`ComputeDevice`] backed by an OpenGL 4.3-core context.
pub struct GlDevice {
    gl: glow::Context,
}

impl GlDevice {
    /// Wrap an already-current context. The context must support compute
    /// shaders (GL 4.3 or `ARB_compute_shader`).
    pub fn new(gl: glow::Context) -> Self {
        Self { gl }
    }

    /// Access the underlying context, e.g. to create the record buffer.
    pub fn context(&self) -> &glow::Context {
        &self.gl
    }
}

impl ComputeDevice for GlDevice {
    type Program = <glow::Context as HasContext>::Program;
    type Uniform = <glow::Context as HasContext>::UniformLocation;
    type Buffer = <glow::Context as HasContext>::Buffer;

    fn compile_program(&self, name: &str, source: &str) -> Result<Self::Program, Error> {
        let build_error = |log: String| Error::ShaderBuild {
            name: name.to_owned(),
            log,
        };
        unsafe {
            let shader = self
                .gl
                .create_shader(glow::COMPUTE_SHADER)
                .map_err(&build_error)?;
            self.gl.shader_source(shader, source);
            self.gl.compile_shader(shader);
            if !self.gl.get_shader_compile_status(shader) {
                let log = self.gl.get_shader_info_log(shader);
                self.gl.delete_shader(shader);
                return Err(build_error(log));
            }

            let program = match self.gl.create_program() {
                Ok(program) => program,
                Err(log) => {
                    self.gl.delete_shader(shader);
                    return Err(build_error(log));
                }
            };
            self.gl.attach_shader(program, shader);
            self.gl.link_program(program);
            let linked = self.gl.get_program_link_status(program);
            self.gl.detach_shader(program, shader);
            self.gl.delete_shader(shader);
            if !linked {
                let log = self.gl.get_program_info_log(program);
                self.gl.delete_program(program);
                return Err(build_error(log));
            }
            Ok(program)
        }
    }

    fn uniform_location(&self, program: Self::Program, name: &str) -> Result<Self::Uniform, Error> {
        unsafe { self.gl.get_uniform_location(program, name) }.ok_or_else(|| {
            Error::MissingUniform {
                shader: format!("{program:?}"),
                name: name.to_owned(),
            }
        })
    }

    fn create_buffer(&self, size: usize) -> Result<Self::Buffer, Error> {
        unsafe {
            let buffer = self
                .gl
                .create_buffer()
                .map_err(|_| Error::BufferAllocation { size })?;
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(buffer));
            self.gl
                .buffer_data_size(glow::SHADER_STORAGE_BUFFER, size as i32, glow::DYNAMIC_COPY);
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, None);
            Ok(buffer)
        }
    }

    fn write_buffer(&self, buffer: Self::Buffer, bytes: &[u8], offset: usize) {
        unsafe {
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(buffer));
            self.gl
                .buffer_sub_data_u8_slice(glow::SHADER_STORAGE_BUFFER, offset as i32, bytes);
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, None);
        }
    }

    fn read_buffer(&self, buffer: Self::Buffer, out: &mut [u8], offset: usize) {
        unsafe {
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(buffer));
            self.gl
                .get_buffer_sub_data(glow::SHADER_STORAGE_BUFFER, offset as i32, out);
            self.gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, None);
        }
    }

    fn enable_program(&self, program: Self::Program) {
        unsafe { self.gl.use_program(Some(program)) }
    }

    fn disable_program(&self) {
        unsafe { self.gl.use_program(None) }
    }

    fn set_uniform_u32(&self, location: &Self::Uniform, value: u32) {
        unsafe { self.gl.uniform_1_u32(Some(location), value) }
    }

    fn bind_buffer(&self, buffer: Self::Buffer, slot: u32) {
        unsafe {
            self.gl
                .bind_buffer_base(glow::SHADER_STORAGE_BUFFER, slot, Some(buffer))
        }
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { self.gl.dispatch_compute(x, y, z) }
    }

    fn memory_barrier(&self) {
        unsafe { self.gl.memory_barrier(glow::SHADER_STORAGE_BARRIER_BIT) }
    }

    fn destroy_buffer(&self, buffer: Self::Buffer) {
        unsafe { self.gl.delete_buffer(buffer) }
    }

    fn destroy_program(&self, program: Self::Program) {
        unsafe { self.gl.delete_program(program) }
    }
}
