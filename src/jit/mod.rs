//! Runtime code generation: byte encoding, register budgeting and the
//! executable kernels they produce.
//!
//! This is the only place generated bytes become callable. Everything above
//! it deals in signatures and typed entry points.

pub mod budget;
pub mod emitter;
pub mod encode;

use std::fmt;

use dynasmrt::ExecutableBuffer;

pub use budget::{Role, VectorRegisterBudget};
pub use emitter::{Emitter, REMAINDER_MASK};
pub use encode::{Gp, Mem, Rm};

/// Function-pointer types that a generated kernel can be called through.
pub trait KernelFn: Copy + Send + Sync + 'static {
    /// Reinterprets the start of generated code as this function type.
    ///
    /// # Safety
    ///
    /// `entry` must point to executable code following the calling
    /// convention and argument list of `Self`, and must outlive every use
    /// of the returned pointer.
    unsafe fn from_entry(entry: *const u8) -> Self;
}

/// Machine code committed to executable memory plus its typed entry point.
///
/// The entry point stays valid for as long as this value lives.
pub struct CompiledKernel<F: KernelFn> {
    name: String,
    entry: F,
    code_size: usize,
    _code: ExecutableBuffer,
}

impl<F: KernelFn> CompiledKernel<F> {
    pub(crate) fn new(name: String, entry: F, code_size: usize, code: ExecutableBuffer) -> Self {
        CompiledKernel {
            name,
            entry,
            code_size,
            _code: code,
        }
    }

    /// Typed entry point. Calling it is unsafe; see the kernel's contract.
    pub fn entry(&self) -> F {
        self.entry
    }

    /// Size of the generated code in bytes.
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Descriptive name derived from the signature.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F: KernelFn> fmt::Debug for CompiledKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("code_size", &self.code_size)
            .finish()
    }
}
