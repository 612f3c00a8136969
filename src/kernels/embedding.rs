//! Embedding-bag pooling kernels (SpMDM).
//!
//! For every output row the kernel gathers `lengths[row]` rows of the
//! embedding table, optionally scales each by a weight, sums them and
//! optionally divides by the bag length. Tables are either plain `f32`
//! rows or fused 8-bit rows (`block_size` bytes followed by an f32 scale
//! and an f32 bias).
//!
//! Generated code follows the System V ABI:
//!
//! ```text
//! bool kernel(i64 output_size, i64 index_size, i64 data_size,
//!             const T* data, const I* indices, const i32* lengths,
//!             const f32* weights, f32* out)
//! ```
//!
//! It returns `false` when an index falls outside `[0, data_size)`, when a
//! bag runs past the end of `indices`, or when the lengths do not add up
//! to `index_size`.

use std::path::Path;

use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::error::{Error, Result};
use crate::isa::{Avx2, Avx512, Isa, VReg, VectorIsa};
use crate::jit::{CompiledKernel, Emitter, Gp, KernelFn, Mem, REMAINDER_MASK, Rm, Role, VectorRegisterBudget};

/// Raw entry point of a pooling kernel. `data` and `indices` are passed as
/// byte pointers; their element types are fixed by the signature.
pub type RawEmbeddingKernel = unsafe extern "sysv64" fn(
    output_size: i64,
    index_size: i64,
    data_size: i64,
    data: *const u8,
    indices: *const u8,
    lengths: *const i32,
    weights: *const f32,
    out: *mut f32,
) -> bool;

impl KernelFn for RawEmbeddingKernel {
    unsafe fn from_entry(entry: *const u8) -> Self {
        unsafe { std::mem::transmute::<*const u8, RawEmbeddingKernel>(entry) }
    }
}

/// Trailing bytes of a fused 8-bit row: f32 scale then f32 bias.
pub const FUSED_TRAILER_BYTES: usize = 8;

/// Default number of indices to look ahead when prefetching rows.
pub const DEFAULT_PREFETCH: usize = 16;

/// Table row encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// `block_size` u8 values followed by f32 scale and f32 bias.
    Fused8Bit,
    /// `block_size` f32 values.
    Float32,
}

/// Width of the entries in the index array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    I32,
    I64,
}

impl IndexWidth {
    pub const fn bytes(self) -> usize {
        match self {
            IndexWidth::I32 => 4,
            IndexWidth::I64 => 8,
        }
    }
}

/// How a weights array is applied to the gathered rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WeightMode {
    /// One weight per index; `weights[i]` scales the row named by
    /// `indices[i]`.
    #[default]
    PerIndex,
    /// One weight per bag, applied to every row of that bag.
    PerBag,
    /// Weight picked by the position inside the bag: the `j`-th row of
    /// every bag is scaled by `weights[j]`.
    Positional,
}

impl WeightMode {
    fn tag(self) -> &'static str {
        match self {
            WeightMode::PerIndex => "hasweight",
            WeightMode::PerBag => "bagweight",
            WeightMode::Positional => "positionweight",
        }
    }
}

/// Table element types a pooling kernel can read.
pub trait EmbeddingElement: Copy + Send + Sync + 'static {
    const KIND: ElementKind;

    /// Elements of `Self` making up one table row of width `block_size`.
    fn row_len(block_size: usize) -> usize;

    /// `acc[j] += weight * value(row, j)` for `j < block_size`, rounding
    /// the way the generated code does.
    fn accumulate_row(row: &[Self], block_size: usize, weight: Option<f32>, acc: &mut [f32]);
}

impl EmbeddingElement for f32 {
    const KIND: ElementKind = ElementKind::Float32;

    fn row_len(block_size: usize) -> usize {
        block_size
    }

    fn accumulate_row(row: &[f32], block_size: usize, weight: Option<f32>, acc: &mut [f32]) {
        let row = &row[..block_size];
        match weight {
            Some(w) => acc.iter_mut().zip(row).for_each(|(a, &x)| *a = w.mul_add(x, *a)),
            None => acc.iter_mut().zip(row).for_each(|(a, &x)| *a += x),
        }
    }
}

impl EmbeddingElement for u8 {
    const KIND: ElementKind = ElementKind::Fused8Bit;

    fn row_len(block_size: usize) -> usize {
        block_size + FUSED_TRAILER_BYTES
    }

    fn accumulate_row(row: &[u8], block_size: usize, weight: Option<f32>, acc: &mut [f32]) {
        let (values, trailer) = row.split_at(block_size);
        let mut scale = f32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let mut bias = f32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
        if let Some(w) = weight {
            scale *= w;
            bias *= w;
        }
        for (a, &q) in acc.iter_mut().zip(values) {
            *a = (q as f32).mul_add(scale, *a) + bias;
        }
    }
}

/// Index types a pooling kernel can read.
pub trait EmbeddingIndex: Copy + Send + Sync + 'static {
    const WIDTH: IndexWidth;

    fn as_i64(self) -> i64;
}

impl EmbeddingIndex for i32 {
    const WIDTH: IndexWidth = IndexWidth::I32;

    fn as_i64(self) -> i64 {
        self as i64
    }
}

impl EmbeddingIndex for i64 {
    const WIDTH: IndexWidth = IndexWidth::I64;

    fn as_i64(self) -> i64 {
        self
    }
}

/// Caller-facing pooling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingOptions {
    /// How weights are applied when a weights slice is given.
    pub weight_mode: WeightMode,
    /// Divide each output row by its bag length.
    pub normalize_by_lengths: bool,
    /// Indices to look ahead when prefetching; 0 disables prefetching.
    pub prefetch: usize,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        PoolingOptions {
            weight_mode: WeightMode::PerIndex,
            normalize_by_lengths: false,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Everything that distinguishes one generated pooling kernel from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbeddingSignature {
    pub block_size: usize,
    /// `None` for unweighted pooling.
    pub weights: Option<WeightMode>,
    pub normalize_by_lengths: bool,
    pub prefetch: usize,
    pub element: ElementKind,
    pub index: IndexWidth,
    pub isa: Isa,
}

impl EmbeddingSignature {
    /// Signature for element type `T` and index type `I`.
    pub fn new<T: EmbeddingElement, I: EmbeddingIndex>(
        block_size: usize,
        weighted: bool,
        options: &PoolingOptions,
        isa: Isa,
    ) -> Self {
        EmbeddingSignature {
            block_size,
            weights: weighted.then_some(options.weight_mode),
            normalize_by_lengths: options.normalize_by_lengths,
            prefetch: options.prefetch,
            element: T::KIND,
            index: I::WIDTH,
            isa,
        }
    }

    /// Bytes from one table row to the next.
    pub fn row_stride(&self) -> usize {
        match self.element {
            ElementKind::Fused8Bit => self.block_size + FUSED_TRAILER_BYTES,
            ElementKind::Float32 => self.block_size * 4,
        }
    }

    fn element_bytes(&self) -> usize {
        match self.element {
            ElementKind::Fused8Bit => 1,
            ElementKind::Float32 => 4,
        }
    }

    /// Name used for logging and code dumps.
    pub fn kernel_name(&self) -> String {
        let mut name = format!(
            "embeddinglookup_{}_emd_dim_{}_{}_{}",
            match self.element {
                ElementKind::Fused8Bit => "8bit",
                ElementKind::Float32 => "float",
            },
            self.block_size,
            match self.index {
                IndexWidth::I32 => "32bit",
                IndexWidth::I64 => "64bit",
            },
            self.isa,
        );
        if self.prefetch > 0 {
            name.push_str("_prefetch");
        }
        if let Some(mode) = self.weights {
            name.push('_');
            name.push_str(mode.tag());
        }
        if self.normalize_by_lengths {
            name.push_str("_normalize_by_lengths");
        }
        name
    }

    /// Rejects shapes the generated code cannot address.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be at least 1".into()));
        }
        let max = i32::MAX as usize;
        if self.block_size > max / 4 {
            return Err(Error::InvalidConfig(format!(
                "block_size {} exceeds the addressable row width",
                self.block_size
            )));
        }
        if self.prefetch.saturating_mul(self.index.bytes()) > max {
            return Err(Error::InvalidConfig(format!("prefetch distance {} too large", self.prefetch)));
        }
        Ok(())
    }
}

/// Generates the kernel for `sig` on the ISA it names.
pub fn generate(sig: &EmbeddingSignature, dump_dir: Option<&Path>) -> Result<CompiledKernel<RawEmbeddingKernel>> {
    match sig.isa {
        Isa::Avx2 => build::<Avx2>(sig, dump_dir),
        Isa::Avx512 => build::<Avx512>(sig, dump_dir),
    }
}

/// Generates the kernel for `sig` with ISA `I`.
pub fn build<I: VectorIsa>(sig: &EmbeddingSignature, dump_dir: Option<&Path>) -> Result<CompiledKernel<RawEmbeddingKernel>> {
    if sig.isa != I::ISA {
        return Err(Error::InvalidConfig(format!(
            "signature targets {} but builder is {}",
            sig.isa,
            I::ISA
        )));
    }
    sig.validate()?;

    let builder = PoolingBuilder::<I>::new(sig)?;
    builder.emit()?.finalize(&sig.kernel_name(), dump_dir)
}

// Stack scratch layout below the saved registers.
const SCRATCH_BYTES: i32 = 128;
const SPILL: i32 = 0;
const AVX2_MASK: i32 = 64;
const LENGTH_SLOT: i32 = 96;
const ONE_SLOT: i32 = 100;
const ONE_F32_BITS: i32 = 0x3f80_0000;

// Stack arguments after six pushes and the return address.
const ARG_WEIGHTS: i32 = 56;
const ARG_OUT: i32 = 64;

/// Registers of the dequantization path.
#[derive(Debug, Clone, Copy)]
struct QuantRegs {
    scale: VReg,
    bias: VReg,
    convert: VReg,
}

#[derive(Debug, Clone)]
struct PoolingRegs {
    quant: Option<QuantRegs>,
    weight: Option<VReg>,
    /// AVX2 remainder lane mask.
    lane_mask: Option<VReg>,
    /// AVX2 destination for masked f32 loads.
    masked_tmp: Option<VReg>,
    norm: Option<VReg>,
    acc: Vec<VReg>,
}

struct PoolingBuilder<'a, I: VectorIsa> {
    e: Emitter<I>,
    sig: &'a EmbeddingSignature,
    regs: PoolingRegs,
    /// Vectors spanning one row.
    num_vecs: usize,
    /// Lanes in the final partial vector, 0 if the row is a whole number
    /// of vectors.
    remainder: usize,
    error: DynamicLabel,
}

impl<'a, I: VectorIsa> PoolingBuilder<'a, I> {
    fn new(sig: &'a EmbeddingSignature) -> Result<Self> {
        let lanes = I::F32_LANES;
        let num_vecs = sig.block_size.div_ceil(lanes);
        let remainder = sig.block_size % lanes;

        let mut budget = VectorRegisterBudget::new(I::NUM_VEC_REGS);
        let quant = match sig.element {
            ElementKind::Fused8Bit => Some(QuantRegs {
                scale: budget.reserve(Role::Scale)?,
                bias: budget.reserve(Role::Bias)?,
                convert: budget.reserve(Role::ConvertTemp)?,
            }),
            ElementKind::Float32 => None,
        };
        let weight = match sig.weights {
            Some(_) => Some(budget.reserve(Role::Weight)?),
            None => None,
        };
        let avx2_remainder = remainder != 0 && !I::HAS_OPMASK;
        let lane_mask = if avx2_remainder {
            Some(budget.reserve(Role::RemainderMask)?)
        } else {
            None
        };
        let masked_tmp = if avx2_remainder && quant.is_none() {
            Some(budget.reserve(Role::MaskedLoadTemp)?)
        } else {
            None
        };
        let norm = if sig.normalize_by_lengths {
            Some(budget.reserve(Role::Normalization)?)
        } else {
            None
        };
        let chunk = num_vecs.min(budget.available_accumulators());
        let acc = budget.accumulators(chunk)?;

        let mut e = Emitter::new()?;
        let error = e.ops.new_dynamic_label();

        Ok(PoolingBuilder {
            e,
            sig,
            regs: PoolingRegs {
                quant,
                weight,
                lane_mask,
                masked_tmp,
                norm,
                acc,
            },
            num_vecs,
            remainder,
            error,
        })
    }

    fn index_bytes(&self) -> i32 {
        self.sig.index.bytes() as i32
    }

    fn is_remainder(&self, vec: usize) -> bool {
        self.remainder != 0 && vec + 1 == self.num_vecs
    }

    /// Register roles:
    ///
    /// | reg  | role                                  |
    /// |------|---------------------------------------|
    /// | rdi  | output rows left                      |
    /// | rsi  | one past the last index               |
    /// | rdx  | data_size                             |
    /// | rcx  | table base                            |
    /// | r8   | index cursor                          |
    /// | r9   | lengths cursor                        |
    /// | r10  | weights cursor                        |
    /// | r11  | output row                            |
    /// | r12  | end of the current bag                |
    /// | r13  | byte offset of the gathered row       |
    /// | r14  | byte offset of the prefetched row     |
    /// | r15  | weights base                          |
    /// | rbx  | first index of the current bag        |
    /// | rbp  | weights cursor at the start of the bag|
    fn emit(mut self) -> Result<Emitter<I>> {
        self.emit_prologue();

        let row_loop = self.e.ops.new_dynamic_label();
        let rows_done = self.e.ops.new_dynamic_label();
        let error = self.error;

        dynasm!(self.e.ops
            ; .arch x64
            ; cmp rdi, 0
            ; jle =>rows_done
            ; =>row_loop
        );

        self.emit_bag_header();

        let chunk = self.regs.acc.len();
        let mut first = 0;
        while first < self.num_vecs {
            let count = chunk.min(self.num_vecs - first);
            self.emit_chunk(first, count, first == 0);
            first += count;
        }

        let out_row_bytes = (self.sig.block_size * 4) as i32;
        if self.sig.weights == Some(WeightMode::PerBag) {
            dynasm!(self.e.ops ; .arch x64 ; add r10, 4);
        }
        dynasm!(self.e.ops
            ; .arch x64
            ; mov r8, r12
            ; add r11, out_row_bytes
            ; add r9, 4
            ; dec rdi
            ; jnz =>row_loop
            ; =>rows_done
            ; cmp r8, rsi
            ; jne =>error
        );

        self.emit_epilogue();
        Ok(self.e)
    }

    fn emit_prologue(&mut self) {
        dynasm!(self.e.ops
            ; .arch x64
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; mov r10, QWORD [rsp + ARG_WEIGHTS]
            ; mov r11, QWORD [rsp + ARG_OUT]
            ; mov r15, r10
            ; sub rsp, SCRATCH_BYTES
            ; mov DWORD [rsp + ONE_SLOT], ONE_F32_BITS
        );

        match self.sig.index {
            IndexWidth::I32 => dynasm!(self.e.ops ; .arch x64 ; lea rsi, [r8 + rsi * 4]),
            IndexWidth::I64 => dynasm!(self.e.ops ; .arch x64 ; lea rsi, [r8 + rsi * 8]),
        }

        if self.remainder == 0 {
            return;
        }
        if I::HAS_OPMASK {
            let bits = (1i32 << self.remainder) - 1;
            dynasm!(self.e.ops ; .arch x64 ; mov eax, bits);
            self.e.kmovw(REMAINDER_MASK, Gp::Rax);
        } else if let Some(mask) = self.regs.lane_mask {
            for lane in 0..I::F32_LANES {
                let slot = AVX2_MASK + 4 * lane as i32;
                let bits: i32 = if lane < self.remainder { -1 } else { 0 };
                dynasm!(self.e.ops ; .arch x64 ; mov DWORD [rsp + slot], bits);
            }
            self.e.vload(mask, Mem::base(Gp::Rsp, AVX2_MASK), 0);
        }
    }

    /// Reads the bag length, checks it against the remaining indices and
    /// prepares per-bag state.
    fn emit_bag_header(&mut self) {
        let error = self.error;
        dynasm!(self.e.ops
            ; .arch x64
            ; mov eax, DWORD [r9]
        );
        // eax is zero-extended, so a negative length reads as a huge one
        // and fails the check below.
        match self.sig.index {
            IndexWidth::I32 => dynasm!(self.e.ops ; .arch x64 ; lea r12, [r8 + rax * 4]),
            IndexWidth::I64 => dynasm!(self.e.ops ; .arch x64 ; lea r12, [r8 + rax * 8]),
        }
        dynasm!(self.e.ops
            ; .arch x64
            ; cmp r12, rsi
            ; ja =>error
            ; mov rbx, r8
            ; mov rbp, r10
        );

        if let Some(norm) = self.regs.norm {
            let empty = self.e.ops.new_dynamic_label();
            let done = self.e.ops.new_dynamic_label();
            dynasm!(self.e.ops
                ; .arch x64
                ; cmp eax, 1
                ; jl =>empty
                ; mov DWORD [rsp + LENGTH_SLOT], eax
            );
            self.e.vpbroadcastd(norm, Mem::base(Gp::Rsp, LENGTH_SLOT));
            self.e.vcvtdq2ps(norm, norm);
            self.e.vstore(Mem::base(Gp::Rsp, SPILL), norm, 0);
            self.e.vbroadcastss(norm, Mem::base(Gp::Rsp, ONE_SLOT));
            self.e.vdivps(norm, norm, Mem::base(Gp::Rsp, SPILL));
            dynasm!(self.e.ops
                ; .arch x64
                ; jmp =>done
                ; =>empty
            );
            self.e.vzero(norm);
            dynasm!(self.e.ops ; .arch x64 ; =>done);
        }

        if let (Some(WeightMode::PerBag), Some(weight)) = (self.sig.weights, self.regs.weight) {
            self.e.vbroadcastss(weight, Mem::base(Gp::R10, 0));
        }
    }

    /// Pools vectors `first..first + count` of the row over the whole bag.
    fn emit_chunk(&mut self, first: usize, count: usize, first_chunk: bool) {
        let error = self.error;
        let index_bytes = self.index_bytes();

        if !first_chunk {
            dynasm!(self.e.ops ; .arch x64 ; mov r8, rbx);
            if self.sig.weights == Some(WeightMode::PerIndex) {
                dynasm!(self.e.ops ; .arch x64 ; mov r10, rbp);
            }
        }
        if self.sig.weights == Some(WeightMode::Positional) {
            dynasm!(self.e.ops ; .arch x64 ; mov r10, r15);
        }
        for i in 0..count {
            let acc = self.regs.acc[i];
            self.e.vzero(acc);
        }

        let index_loop = self.e.ops.new_dynamic_label();
        let index_done = self.e.ops.new_dynamic_label();
        dynasm!(self.e.ops
            ; .arch x64
            ; =>index_loop
            ; cmp r8, r12
            ; jae =>index_done
        );

        match self.sig.index {
            IndexWidth::I32 => self.e.movsxd(Gp::R13, Mem::base(Gp::R8, 0)),
            IndexWidth::I64 => dynasm!(self.e.ops ; .arch x64 ; mov r13, QWORD [r8]),
        }
        // unsigned compare also rejects negative indices
        dynasm!(self.e.ops
            ; .arch x64
            ; cmp r13, rdx
            ; jae =>error
        );

        let stride = self.sig.row_stride() as i32;
        if self.sig.prefetch > 0 {
            self.emit_prefetch_target(stride);
        }
        dynasm!(self.e.ops ; .arch x64 ; imul r13, r13, stride);

        if let (Some(WeightMode::PerIndex | WeightMode::Positional), Some(weight)) =
            (self.sig.weights, self.regs.weight)
        {
            self.e.vbroadcastss(weight, Mem::base(Gp::R10, 0));
            dynasm!(self.e.ops ; .arch x64 ; add r10, 4);
        }

        if let Some(q) = self.regs.quant {
            let block = self.sig.block_size as i32;
            self.e.vbroadcastss(q.scale, Mem::indexed(Gp::Rcx, Gp::R13, block));
            self.e.vbroadcastss(q.bias, Mem::indexed(Gp::Rcx, Gp::R13, block + 4));
            if let Some(weight) = self.regs.weight {
                self.e.vmulps(q.scale, q.scale, weight);
                self.e.vmulps(q.bias, q.bias, weight);
            }
        }

        let pf_every = (64 / (I::F32_LANES * self.sig.element_bytes())).max(1);
        for i in 0..count {
            let vec = first + i;
            let data_off = (vec * I::F32_LANES * self.sig.element_bytes()) as i32;
            if self.sig.prefetch > 0 && vec % pf_every == 0 {
                self.e.prefetcht0(Mem::indexed(Gp::Rcx, Gp::R14, data_off));
            }
            self.emit_accumulate(self.regs.acc[i], vec, data_off);
        }

        dynasm!(self.e.ops
            ; .arch x64
            ; add r8, index_bytes
            ; jmp =>index_loop
            ; =>index_done
        );

        for i in 0..count {
            let vec = first + i;
            let acc = self.regs.acc[i];
            if let Some(norm) = self.regs.norm {
                self.e.vmulps(acc, acc, norm);
            }
            let dst = Mem::base(Gp::R11, (vec * I::F32_LANES * 4) as i32);
            match (self.is_remainder(vec), self.regs.lane_mask) {
                (false, _) => self.e.vstore(dst, acc, 0),
                (true, Some(mask)) => self.e.vmaskmovps_store(dst, mask, acc),
                (true, None) => self.e.vstore(dst, acc, REMAINDER_MASK),
            }
        }
    }

    /// Sets r14 to the byte offset of the row `prefetch` indices ahead, or
    /// of the current row when that index is past the end or out of range.
    fn emit_prefetch_target(&mut self, stride: i32) {
        let ready = self.e.ops.new_dynamic_label();
        let ahead = (self.sig.prefetch * self.sig.index.bytes()) as i32;
        dynasm!(self.e.ops
            ; .arch x64
            ; mov r14, r13
            ; lea rax, [r8 + ahead]
            ; cmp rax, rsi
            ; jae =>ready
        );
        match self.sig.index {
            IndexWidth::I32 => self.e.movsxd(Gp::Rax, Mem::base(Gp::Rax, 0)),
            IndexWidth::I64 => dynasm!(self.e.ops ; .arch x64 ; mov rax, QWORD [rax]),
        }
        dynasm!(self.e.ops
            ; .arch x64
            ; cmp rax, rdx
            ; jae =>ready
            ; mov r14, rax
            ; =>ready
            ; imul r14, r14, stride
        );
    }

    /// Adds one vector of the gathered row into `acc`.
    fn emit_accumulate(&mut self, acc: VReg, vec: usize, data_off: i32) {
        let src = Mem::indexed(Gp::Rcx, Gp::R13, data_off);
        let tail = self.is_remainder(vec);
        let mask = if tail && I::HAS_OPMASK { REMAINDER_MASK } else { 0 };

        if let Some(q) = self.regs.quant {
            // AVX2 tails read whole 8-byte groups; the fused trailer keeps
            // the read inside the row.
            self.e.vpmovzxbd(q.convert, src, mask);
            self.e.vcvtdq2ps(q.convert, q.convert);
            self.e.vfmadd231ps(acc, q.convert, q.scale, mask);
            self.e.vaddps(acc, acc, q.bias, mask);
            return;
        }

        let operand: Rm = match (tail, self.regs.lane_mask, self.regs.masked_tmp) {
            (true, Some(lane_mask), Some(tmp)) => {
                self.e.vmaskmovps_load(tmp, lane_mask, src);
                tmp.into()
            }
            _ => src.into(),
        };
        match self.regs.weight {
            Some(weight) => self.e.vfmadd231ps(acc, weight, operand, mask),
            None => self.e.vaddps(acc, acc, operand, mask),
        }
    }

    fn emit_epilogue(&mut self) {
        let error = self.error;
        let exit = self.e.ops.new_dynamic_label();
        dynasm!(self.e.ops
            ; .arch x64
            ; mov eax, 1
            ; jmp =>exit
            ; =>error
            ; xor eax, eax
            ; =>exit
        );
        self.e.vzeroupper();
        dynasm!(self.e.ops
            ; .arch x64
            ; add rsp, SCRATCH_BYTES
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(block_size: usize, isa: Isa) -> EmbeddingSignature {
        EmbeddingSignature::new::<u8, i64>(block_size, true, &PoolingOptions::default(), isa)
    }

    #[test]
    fn test_kernel_name() {
        let sig = signature(64, Isa::Avx512);
        assert_eq!(sig.kernel_name(), "embeddinglookup_8bit_emd_dim_64_64bit_avx512_prefetch_hasweight");

        let sig = EmbeddingSignature {
            prefetch: 0,
            weights: None,
            normalize_by_lengths: true,
            element: ElementKind::Float32,
            index: IndexWidth::I32,
            ..signature(8, Isa::Avx2)
        };
        assert_eq!(sig.kernel_name(), "embeddinglookup_float_emd_dim_8_32bit_avx2_normalize_by_lengths");
    }

    #[test]
    fn test_row_stride() {
        assert_eq!(signature(5, Isa::Avx2).row_stride(), 13);
        let float = EmbeddingSignature {
            element: ElementKind::Float32,
            ..signature(5, Isa::Avx2)
        };
        assert_eq!(float.row_stride(), 20);
    }

    #[test]
    fn test_zero_block_rejected() {
        let sig = signature(0, Isa::Avx2);
        assert!(matches!(generate(&sig, None), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_mismatched_isa_rejected() {
        let sig = signature(16, Isa::Avx512);
        assert!(matches!(build::<Avx2>(&sig, None), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_fused_row_accumulate() {
        let mut row = vec![2u8, 4, 6];
        row.extend_from_slice(&0.5f32.to_le_bytes());
        row.extend_from_slice(&1.0f32.to_le_bytes());
        let mut acc = vec![0.0f32; 3];
        u8::accumulate_row(&row, 3, None, &mut acc);
        assert_eq!(acc, vec![2.0, 3.0, 4.0]);

        u8::accumulate_row(&row, 3, Some(2.0), &mut acc);
        assert_eq!(acc, vec![6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_generates_code_for_every_shape() {
        // Code generation itself needs no vector support on the host.
        for isa in [Isa::Avx2, Isa::Avx512] {
            for block_size in [1, 7, 8, 16, 33, 300] {
                let sig = EmbeddingSignature {
                    normalize_by_lengths: true,
                    ..signature(block_size, isa)
                };
                let kernel = generate(&sig, None).unwrap();
                assert!(kernel.code_size() > 0);
                assert_eq!(kernel.name(), sig.kernel_name());
            }
        }
    }

    #[test]
    fn test_generates_masked_float_tails() {
        // AVX2 float rows with a partial last vector go through vmaskmovps.
        for weighted in [false, true] {
            for block_size in [3, 13] {
                let sig = EmbeddingSignature::new::<f32, i32>(block_size, weighted, &PoolingOptions::default(), Isa::Avx2);
                let kernel = generate(&sig, None).unwrap();
                assert!(kernel.code_size() > 0, "{}", sig.kernel_name());
            }
        }
    }
}
