//! Instruction emission into an x86-64 `dynasmrt` assembler.
//!
//! Kernel builders write general-purpose code, labels and branches with
//! `dynasm!` directly on [`Emitter::ops`]. Vector instructions go through
//! the typed methods here, which pick VEX or EVEX from the ISA parameter so
//! one builder body serves both widths.

use std::marker::PhantomData;
use std::path::Path;

use dynasmrt::x64::Assembler;
use dynasmrt::{AssemblyOffset, DynasmApi};

use super::encode::{self, Encoding, Gp, Insn, Mem, Opcode, Rm};
use super::{CompiledKernel, KernelFn};
use crate::error::{Error, Result};
use crate::isa::{Isa, VReg, VectorIsa};

impl From<VReg> for Rm {
    fn from(reg: VReg) -> Self {
        Rm::Reg(reg.id())
    }
}

impl From<Mem> for Rm {
    fn from(mem: Mem) -> Self {
        Rm::Mem(mem)
    }
}

/// Opmask register used for remainder lanes on AVX-512.
pub const REMAINDER_MASK: u8 = 1;

/// Code buffer for one kernel, specialized for an instruction set.
pub struct Emitter<I: VectorIsa> {
    /// Underlying assembler; builders emit scalar code here with `dynasm!`.
    pub ops: Assembler,
    entry: AssemblyOffset,
    scratch: Vec<u8>,
    _isa: PhantomData<I>,
}

impl<I: VectorIsa> Emitter<I> {
    /// Fresh emitter. Fails only if the assembler cannot map its buffer.
    pub fn new() -> Result<Self> {
        let ops = Assembler::new()?;
        let entry = ops.offset();
        Ok(Emitter {
            ops,
            entry,
            scratch: Vec::with_capacity(16),
            _isa: PhantomData,
        })
    }

    /// Bytes emitted so far.
    pub fn code_len(&self) -> usize {
        self.ops.offset().0 - self.entry.0
    }

    fn flush(&mut self) {
        for &b in self.scratch.iter() {
            self.ops.push(b);
        }
        self.scratch.clear();
    }

    fn vector(&mut self, opcode: Opcode, reg: u8, vvvv: u8, rm: Rm, mask: u8) {
        debug_assert!(mask == 0 || I::HAS_OPMASK, "opmask on {}", I::ISA);
        let enc = match I::ISA {
            Isa::Avx2 => Encoding::Vex256,
            Isa::Avx512 => Encoding::Evex512,
        };
        let insn = Insn {
            opcode,
            reg,
            vvvv,
            rm,
            mask,
        };
        encode::encode(&mut self.scratch, enc, &insn);
        self.flush();
    }

    /// `dst = 0`
    pub fn vzero(&mut self, dst: VReg) {
        self.vector(encode::VPXOR, dst.id(), dst.id(), dst.into(), 0);
    }

    /// `dst = [mem]`, lanes outside `mask` keep their value.
    pub fn vload(&mut self, dst: VReg, mem: Mem, mask: u8) {
        self.vector(encode::VMOVUPS_LOAD, dst.id(), 0, mem.into(), mask);
    }

    /// `[mem] = src`, lanes outside `mask` untouched.
    pub fn vstore(&mut self, mem: Mem, src: VReg, mask: u8) {
        self.vector(encode::VMOVUPS_STORE, src.id(), 0, mem.into(), mask);
    }

    /// `dst = a + b` (f32)
    pub fn vaddps(&mut self, dst: VReg, a: VReg, b: impl Into<Rm>, mask: u8) {
        self.vector(encode::VADDPS, dst.id(), a.id(), b.into(), mask);
    }

    /// `dst = a * b` (f32)
    pub fn vmulps(&mut self, dst: VReg, a: VReg, b: impl Into<Rm>) {
        self.vector(encode::VMULPS, dst.id(), a.id(), b.into(), 0);
    }

    /// `dst = num / den` (f32)
    pub fn vdivps(&mut self, dst: VReg, num: VReg, den: impl Into<Rm>) {
        self.vector(encode::VDIVPS, dst.id(), num.id(), den.into(), 0);
    }

    /// `acc += a * b` (f32)
    pub fn vfmadd231ps(&mut self, acc: VReg, a: VReg, b: impl Into<Rm>, mask: u8) {
        self.vector(encode::VFMADD231PS, acc.id(), a.id(), b.into(), mask);
    }

    /// i32 lanes to f32 lanes.
    pub fn vcvtdq2ps(&mut self, dst: VReg, src: impl Into<Rm>) {
        self.vector(encode::VCVTDQ2PS, dst.id(), 0, src.into(), 0);
    }

    /// Broadcasts the f32 at `mem` to every lane.
    pub fn vbroadcastss(&mut self, dst: VReg, mem: Mem) {
        self.vector(encode::VBROADCASTSS, dst.id(), 0, mem.into(), 0);
    }

    /// Broadcasts the dword at `mem` to every lane.
    pub fn vpbroadcastd(&mut self, dst: VReg, mem: Mem) {
        self.vector(encode::VPBROADCASTD, dst.id(), 0, mem.into(), 0);
    }

    /// Zero-extends one byte per dword lane from `mem`.
    pub fn vpmovzxbd(&mut self, dst: VReg, mem: Mem, mask: u8) {
        self.vector(encode::VPMOVZXBD, dst.id(), 0, mem.into(), mask);
    }

    /// Multiplies unsigned bytes of `a` with signed bytes of `b` and adds
    /// adjacent pairs into saturated i16 lanes.
    pub fn vpmaddubsw(&mut self, dst: VReg, a: VReg, b: impl Into<Rm>) {
        self.vector(encode::VPMADDUBSW, dst.id(), a.id(), b.into(), 0);
    }

    /// Multiplies i16 lanes and adds adjacent pairs into i32 lanes.
    pub fn vpmaddwd(&mut self, dst: VReg, a: VReg, b: impl Into<Rm>) {
        self.vector(encode::VPMADDWD, dst.id(), a.id(), b.into(), 0);
    }

    /// `dst = a + b` (i32, wrapping)
    pub fn vpaddd(&mut self, dst: VReg, a: VReg, b: impl Into<Rm>) {
        self.vector(encode::VPADDD, dst.id(), a.id(), b.into(), 0);
    }

    /// AVX2 masked load; lanes whose mask sign bit is clear read as zero
    /// and are never touched in memory.
    pub fn vmaskmovps_load(&mut self, dst: VReg, mask: VReg, mem: Mem) {
        debug_assert!(!I::HAS_OPMASK);
        self.vector(encode::VMASKMOVPS_LOAD, dst.id(), mask.id(), mem.into(), 0);
    }

    /// AVX2 masked store.
    pub fn vmaskmovps_store(&mut self, mem: Mem, mask: VReg, src: VReg) {
        debug_assert!(!I::HAS_OPMASK);
        self.vector(encode::VMASKMOVPS_STORE, src.id(), mask.id(), mem.into(), 0);
    }

    /// `k = src[15:0]`
    pub fn kmovw(&mut self, k: u8, src: Gp) {
        debug_assert!(I::HAS_OPMASK);
        let insn = Insn {
            opcode: encode::KMOVW_FROM_GP,
            reg: k,
            vvvv: 0,
            rm: Rm::Reg(src as u8),
            mask: 0,
        };
        encode::encode(&mut self.scratch, Encoding::Vex128, &insn);
        self.flush();
    }

    pub fn prefetcht0(&mut self, mem: Mem) {
        encode::encode_prefetcht0(&mut self.scratch, mem);
        self.flush();
    }

    /// Sign-extending 32-bit load into a 64-bit register.
    pub fn movsxd(&mut self, dst: Gp, mem: Mem) {
        encode::encode_movsxd(&mut self.scratch, dst, mem);
        self.flush();
    }

    pub fn vzeroupper(&mut self) {
        encode::encode_vzeroupper(&mut self.scratch);
        self.flush();
    }

    /// Commits the code to executable memory.
    ///
    /// When `dump_dir` is set the raw machine code is also written to
    /// `<dump_dir>/<name>.bin`; a failed dump is logged, not returned.
    pub fn finalize<F: KernelFn>(self, name: &str, dump_dir: Option<&Path>) -> Result<CompiledKernel<F>> {
        let entry = self.entry;
        let buffer = self.ops.finalize().map_err(|_| Error::Commit)?;
        let code_size = buffer.len() - entry.0;

        if let Some(dir) = dump_dir {
            let path = dir.join(format!("{name}.bin"));
            if let Err(err) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, &buffer[entry.0..])) {
                log::warn!("could not dump {name} to {}: {err}", path.display());
            }
        }

        log::debug!("generated {name}: {code_size} bytes");

        // SAFETY: `entry` is the first instruction of a function emitted with
        // the calling convention `F` describes, and the buffer that holds it
        // is stored alongside the pointer.
        let func = unsafe { F::from_entry(buffer.ptr(entry)) };
        Ok(CompiledKernel::new(name.to_owned(), func, code_size, buffer))
    }
}
