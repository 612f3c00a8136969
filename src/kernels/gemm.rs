//! u8 × s8 → s32 GEMM tile kernels.
//!
//! A tile computes `C[0:mc, 0:nc] (+)= A[0:mc, 0:k] × B[0:k, 0:nc]` from
//! packed operands:
//!
//! - A: row `i` starts at `a[i * KCB]`, one byte per k.
//! - B: groups of `ROW_INTERLEAVE` consecutive k values are interleaved per
//!   column, so group `g` of column `n` lives at
//!   `b[g * NCB * RI + n * RI .. + RI]`.
//!
//! Each k-group is reduced with `vpmaddubsw` (u8 × s8, adjacent pairs summed
//! into saturated i16) and `vpmaddwd` against a vector of 16-bit ones, then
//! added into i32 accumulators.
//!
//! ```text
//! void kernel(const u8* a, const i8* b, const i8* b_prefetch,
//!             i32* c, i64 k, i64 ldc)
//! ```
//!
//! `k` must be a positive multiple of `ROW_INTERLEAVE`; `ldc` is in
//! elements.

use std::fmt;
use std::path::Path;

use dynasm::dynasm;
use dynasmrt::{DynasmApi, DynasmLabelApi};

use crate::error::{Error, Result};
use crate::isa::{Avx2, Avx512, Isa, VReg, VectorIsa};
use crate::jit::{CompiledKernel, Emitter, Gp, KernelFn, Mem, Role, VectorRegisterBudget};

/// Raw entry point of a GEMM tile kernel.
pub type RawGemmKernel =
    unsafe extern "sysv64" fn(a: *const u8, b: *const i8, b_prefetch: *const i8, c: *mut i32, k: i64, ldc: i64);

impl KernelFn for RawGemmKernel {
    unsafe fn from_entry(entry: *const u8) -> Self {
        unsafe { std::mem::transmute::<*const u8, RawGemmKernel>(entry) }
    }
}

/// Bytes of k folded into one i32 lane.
pub const ROW_INTERLEAVE: usize = 4;

/// Cache and register blocking of the packed operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockingParams {
    /// Rows of A per cache block.
    pub mcb: usize,
    /// Columns of B per cache block (the packed B row stride in groups).
    pub ncb: usize,
    /// Depth of a cache block (the packed A row stride).
    pub kcb: usize,
    /// Rows per register block.
    pub mr: usize,
    /// Columns per register block.
    pub nr: usize,
    /// Column granularity; `nc` must be a multiple of it.
    pub nr_min: usize,
    pub row_interleave: usize,
}

impl BlockingParams {
    /// Default blocking for `isa`.
    pub const fn for_isa(isa: Isa) -> Self {
        match isa {
            Isa::Avx2 => BlockingParams {
                mcb: 120,
                ncb: 8,
                kcb: 512,
                mr: 12,
                nr: 8,
                nr_min: 8,
                row_interleave: ROW_INTERLEAVE,
            },
            Isa::Avx512 => BlockingParams {
                mcb: 56,
                ncb: 32,
                kcb: 256,
                mr: 14,
                nr: 32,
                nr_min: 16,
                row_interleave: ROW_INTERLEAVE,
            },
        }
    }
}

/// Everything that distinguishes one generated GEMM tile kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmSignature {
    /// Add into C instead of overwriting it.
    pub accumulate: bool,
    pub mc: usize,
    pub nc: usize,
    pub kc: usize,
    pub params: BlockingParams,
    pub isa: Isa,
}

impl fmt::Display for GemmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.params;
        write!(
            f,
            "gemm_u8s8s32acc32_{}_accum{}_mc{}_nc{}_kc{}_NCB{}_KCB{}_MR{}_NR{}_NRMIN{}",
            self.isa, self.accumulate as u8, self.mc, self.nc, self.kc, p.ncb, p.kcb, p.mr, p.nr, p.nr_min
        )
    }
}

impl GemmSignature {
    /// Tile signature with the default blocking for `isa`.
    pub fn new(accumulate: bool, mc: usize, nc: usize, kc: usize, isa: Isa) -> Self {
        GemmSignature {
            accumulate,
            mc,
            nc,
            kc,
            params: BlockingParams::for_isa(isa),
            isa,
        }
    }

    /// Name used for logging and code dumps.
    pub fn kernel_name(&self) -> String {
        self.to_string()
    }

    /// Column registers of a full register block.
    fn col_regs(&self) -> usize {
        self.params.nr * self.params.row_interleave / self.isa.vector_bytes()
    }

    /// Checks the tile against its blocking before any code is emitted.
    pub fn validate(&self) -> Result<()> {
        let p = &self.params;
        let vb = self.isa.vector_bytes();
        let fail = |msg: String| Err(Error::InvalidConfig(msg));

        if p.row_interleave != ROW_INTERLEAVE {
            return fail(format!("ROW_INTERLEAVE must be {ROW_INTERLEAVE}, got {}", p.row_interleave));
        }
        if p.mr == 0 || p.nr == 0 || p.nr_min == 0 {
            return fail("MR, NR and NR_MIN must be non-zero".into());
        }
        if (p.nr_min * p.row_interleave) % vb != 0 || p.nr % p.nr_min != 0 {
            return fail(format!(
                "NR ({}) and NR_MIN ({}) must cover whole {vb}-byte vectors",
                p.nr, p.nr_min
            ));
        }
        if self.kc == 0 || self.kc % p.row_interleave != 0 {
            return fail(format!("kc ({}) must be a positive multiple of ROW_INTERLEAVE", self.kc));
        }
        if self.kc > p.kcb {
            return fail(format!("kc ({}) exceeds KCB ({})", self.kc, p.kcb));
        }
        if self.nc == 0 || self.nc % p.nr_min != 0 {
            return fail(format!("nc ({}) must be a positive multiple of NR_MIN ({})", self.nc, p.nr_min));
        }
        if self.nc > p.ncb {
            return fail(format!("nc ({}) exceeds NCB ({})", self.nc, p.ncb));
        }
        if self.mc == 0 {
            return fail("mc must be positive".into());
        }
        let max = i32::MAX as usize;
        if p.kcb.saturating_mul(p.mr) > max || p.ncb.saturating_mul(p.row_interleave) > max {
            return fail("blocking strides exceed the addressable range".into());
        }
        Ok(())
    }

    /// Bytes the kernel reads from packed A.
    pub fn a_len(&self) -> usize {
        (self.mc - 1) * self.params.kcb + self.kc
    }

    /// Offset of the `b_prefetch` argument from `b`: one k-group, so the
    /// kernel touches the next group of B while it multiplies the current
    /// one.
    pub fn b_prefetch_distance(&self) -> usize {
        self.params.ncb * self.params.row_interleave
    }

    /// Bytes the kernel reads from packed B.
    pub fn b_len(&self) -> usize {
        (self.kc / self.params.row_interleave - 1) * self.params.ncb * self.params.row_interleave
            + self.nc * self.params.row_interleave
    }
}

/// Generates the kernel for `sig` on the ISA it names.
pub fn generate(sig: &GemmSignature, dump_dir: Option<&Path>) -> Result<CompiledKernel<RawGemmKernel>> {
    match sig.isa {
        Isa::Avx2 => build::<Avx2>(sig, dump_dir),
        Isa::Avx512 => build::<Avx512>(sig, dump_dir),
    }
}

/// Generates the kernel for `sig` with ISA `I`.
pub fn build<I: VectorIsa>(sig: &GemmSignature, dump_dir: Option<&Path>) -> Result<CompiledKernel<RawGemmKernel>> {
    if sig.isa != I::ISA {
        return Err(Error::InvalidConfig(format!(
            "signature targets {} but builder is {}",
            sig.isa,
            I::ISA
        )));
    }
    sig.validate()?;

    let builder = TileBuilder::<I>::new(sig)?;
    builder.emit().finalize(&sig.kernel_name(), dump_dir)
}

const ONES_SLOT: i32 = 0;
const SCRATCH_BYTES: i32 = 16;
/// Two 16-bit ones in one dword.
const ONES_I16X2: i32 = 0x0001_0001;

struct TileBuilder<'a, I: VectorIsa> {
    e: Emitter<I>,
    sig: &'a GemmSignature,
    a: VReg,
    b: VReg,
    ones: VReg,
    product: VReg,
    acc: Vec<VReg>,
}

impl<'a, I: VectorIsa> TileBuilder<'a, I> {
    fn new(sig: &'a GemmSignature) -> Result<Self> {
        let mut budget = VectorRegisterBudget::new(I::NUM_VEC_REGS);
        let a = budget.reserve(Role::GemmA)?;
        let b = budget.reserve(Role::GemmB)?;
        let ones = budget.reserve(Role::GemmOnes)?;
        let product = budget.reserve(Role::GemmProduct)?;
        let acc = budget.accumulators(sig.params.mr * sig.col_regs())?;

        Ok(TileBuilder {
            e: Emitter::new()?,
            sig,
            a,
            b,
            ones,
            product,
            acc,
        })
    }

    /// | reg | role                       |
    /// |-----|----------------------------|
    /// | rdi | A                          |
    /// | rsi | B                          |
    /// | rdx | B prefetch                 |
    /// | rcx | C                          |
    /// | r8  | k                          |
    /// | r9  | ldc in bytes               |
    /// | r10 | B at entry                 |
    /// | r11 | C row offset / temp        |
    /// | r12 | B prefetch at entry        |
    /// | r13 | row block counter          |
    /// | r14 | column block counter       |
    /// | r15 | k counter                  |
    fn emit(mut self) -> Emitter<I> {
        let p = self.sig.params;

        dynasm!(self.e.ops
            ; .arch x64
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, SCRATCH_BYTES
            ; mov DWORD [rsp + ONES_SLOT], ONES_I16X2
            ; imul r9, r9, 4
            ; mov r10, rsi
            ; mov r12, rdx
        );
        self.e.vpbroadcastd(self.ones, Mem::base(Gp::Rsp, ONES_SLOT));

        let row_blocks = self.sig.mc / p.mr;
        let row_rem = self.sig.mc % p.mr;

        if row_blocks > 0 {
            let m_loop = self.e.ops.new_dynamic_label();
            let a_step = (p.mr * p.kcb) as i32;
            let mr = p.mr as i32;
            let trips = row_blocks as i32;
            dynasm!(self.e.ops
                ; .arch x64
                ; xor r13d, r13d
                ; =>m_loop
                ; inc r13
            );
            self.emit_col_sweep(p.mr);
            dynasm!(self.e.ops
                ; .arch x64
                ; add rdi, a_step
                ; imul r11, r9, mr
                ; add rcx, r11
                ; cmp r13, trips
                ; jl =>m_loop
            );
        }
        if row_rem > 0 {
            self.emit_col_sweep(row_rem);
        }

        self.e.vzeroupper();
        dynasm!(self.e.ops
            ; .arch x64
            ; add rsp, SCRATCH_BYTES
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; ret
        );
        self.e
    }

    /// All column blocks of `rows` rows of C. Leaves A, B and C where they
    /// were on entry.
    fn emit_col_sweep(&mut self, rows: usize) {
        let p = self.sig.params;
        let ri = p.row_interleave;
        let full_blocks = self.sig.nc / p.nr;
        let tail_cols = self.sig.nc % p.nr;
        let b_block = (p.nr * ri) as i32;
        let c_block = (p.nr * 4) as i32;

        if full_blocks > 0 {
            let n_loop = self.e.ops.new_dynamic_label();
            let trips = full_blocks as i32;
            dynasm!(self.e.ops
                ; .arch x64
                ; xor r14d, r14d
                ; =>n_loop
                ; inc r14
            );
            self.emit_tile(rows, self.sig.col_regs());
            dynasm!(self.e.ops
                ; .arch x64
                ; imul r11, r14, b_block
                ; mov rsi, r10
                ; add rsi, r11
                ; mov rdx, r12
                ; add rdx, r11
                ; add rcx, c_block
                ; cmp r14, trips
                ; jl =>n_loop
            );
        }
        if tail_cols > 0 {
            let cols = tail_cols * ri / I::VECTOR_BYTES;
            let c_tail = (tail_cols * 4) as i32;
            self.emit_tile(rows, cols);
            dynasm!(self.e.ops ; .arch x64 ; add rcx, c_tail);
        }

        let c_sweep = (self.sig.nc * 4) as i32;
        dynasm!(self.e.ops
            ; .arch x64
            ; mov rsi, r10
            ; mov rdx, r12
            ; sub rcx, c_sweep
        );
    }

    /// One register block: `rows` × `cols` accumulators over the full k.
    fn emit_tile(&mut self, rows: usize, cols: usize) {
        let p = self.sig.params;
        let vb = I::VECTOR_BYTES;
        let ri = p.row_interleave as i32;
        let b_step = (p.ncb * p.row_interleave) as i32;

        for idx in 0..rows * cols {
            let acc = self.acc[idx];
            self.e.vzero(acc);
        }

        let k_loop = self.e.ops.new_dynamic_label();
        dynasm!(self.e.ops
            ; .arch x64
            ; xor r15d, r15d
            ; =>k_loop
            ; add r15, ri
        );

        for j in 0..cols {
            let col_off = (j * vb) as i32;
            self.e.vload(self.b, Mem::base(Gp::Rsi, col_off), 0);
            for i in 0..rows {
                let acc = self.acc[i * cols + j];
                self.e.vpbroadcastd(self.a, Mem::base(Gp::Rdi, (i * p.kcb) as i32));
                self.e.vpmaddubsw(self.product, self.a, self.b);
                self.e.vpmaddwd(self.product, self.ones, self.product);
                self.e.vpaddd(acc, self.product, acc);
            }
            self.e.prefetcht0(Mem::base(Gp::Rdx, col_off));
        }

        dynasm!(self.e.ops
            ; .arch x64
            ; add rdi, ri
            ; add rsi, b_step
            ; add rdx, b_step
            ; cmp r15, r8
            ; jl =>k_loop
        );

        for i in 0..rows {
            if i == 0 {
                dynasm!(self.e.ops ; .arch x64 ; xor r11d, r11d);
            } else {
                dynasm!(self.e.ops ; .arch x64 ; add r11, r9);
            }
            for j in 0..cols {
                let acc = self.acc[i * cols + j];
                let dst = Mem::indexed(Gp::Rcx, Gp::R11, (j * vb) as i32);
                if self.sig.accumulate {
                    self.e.vpaddd(acc, acc, dst);
                }
                self.e.vstore(dst, acc, 0);
            }
        }

        dynasm!(self.e.ops ; .arch x64 ; sub rdi, r8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_fit_register_file() {
        for isa in [Isa::Avx2, Isa::Avx512] {
            let p = BlockingParams::for_isa(isa);
            let sig = GemmSignature::new(false, p.mr, p.nr, p.kcb, isa);
            assert!(sig.validate().is_ok(), "{isa}");
            assert!(p.mr * sig.col_regs() <= isa.num_vec_regs() - 4);
        }
    }

    #[test]
    fn test_validate_rejects_bad_tiles() {
        let isa = Isa::Avx512;
        let ok = GemmSignature::new(false, 14, 32, 256, isa);
        assert!(ok.validate().is_ok());

        let bad_k = GemmSignature { kc: 6, ..ok };
        assert!(matches!(bad_k.validate(), Err(Error::InvalidConfig(_))));

        let bad_n = GemmSignature { nc: 24, ..ok };
        assert!(matches!(bad_n.validate(), Err(Error::InvalidConfig(_))));

        let too_deep = GemmSignature { kc: 260, ..ok };
        assert!(matches!(too_deep.validate(), Err(Error::InvalidConfig(_))));

        let bad_ri = GemmSignature {
            params: BlockingParams {
                row_interleave: 2,
                ..ok.params
            },
            ..ok
        };
        assert!(matches!(bad_ri.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_register_budget_enforced() {
        let isa = Isa::Avx2;
        let sig = GemmSignature {
            params: BlockingParams {
                mr: 13,
                ..BlockingParams::for_isa(isa)
            },
            ..GemmSignature::new(false, 13, 8, 64, isa)
        };
        assert!(sig.validate().is_ok());
        assert!(matches!(
            generate(&sig, None),
            Err(Error::RegisterBudget { needed: 17, available: 16 })
        ));
    }

    #[test]
    fn test_operand_extents() {
        let sig = GemmSignature::new(false, 14, 16, 64, Isa::Avx512);
        assert_eq!(sig.a_len(), 13 * 256 + 64);
        assert_eq!(sig.b_len(), 15 * 32 * 4 + 16 * 4);
    }

    #[test]
    fn test_kernel_name() {
        let sig = GemmSignature::new(true, 12, 8, 512, Isa::Avx2);
        assert_eq!(
            sig.kernel_name(),
            "gemm_u8s8s32acc32_avx2_accum1_mc12_nc8_kc512_NCB8_KCB512_MR12_NR8_NRMIN8"
        );
    }

    #[test]
    fn test_generates_remainder_tiles() {
        for (mc, nc) in [(1, 16), (15, 32), (28, 16)] {
            let sig = GemmSignature::new(false, mc, nc, 64, Isa::Avx512);
            assert!(generate(&sig, None).unwrap().code_size() > 0);
        }
    }
}
