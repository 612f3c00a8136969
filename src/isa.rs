//! Instruction-set variants and host capability detection.
//!
//! Builders never hard-code a vector width or register count. They ask a
//! [`VectorIsa`] implementation, so one builder body serves both AVX2 and
//! AVX-512. [`Isa`] is the runtime tag of the same information and is what
//! kernel signatures carry.

use std::fmt;

use once_cell::sync::Lazy;

/// A vector register by hardware number (ymm/zmm 0..31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

impl VReg {
    /// Hardware register number.
    #[inline]
    pub fn id(self) -> u8 {
        self.0
    }
}

/// Vector instruction sets the generators can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Isa {
    /// 256-bit vectors, 16 registers, VEX encoding.
    Avx2,
    /// 512-bit vectors, 32 registers, EVEX encoding with opmask registers.
    Avx512,
}

impl Isa {
    /// Bytes per vector register.
    pub const fn vector_bytes(self) -> usize {
        match self {
            Isa::Avx2 => 32,
            Isa::Avx512 => 64,
        }
    }

    /// f32 lanes per vector register.
    pub const fn f32_lanes(self) -> usize {
        self.vector_bytes() / 4
    }

    /// Physical vector registers available to generated code.
    pub const fn num_vec_regs(self) -> usize {
        match self {
            Isa::Avx2 => 16,
            Isa::Avx512 => 32,
        }
    }

    /// Whether remainder lanes can be predicated with an opmask register.
    pub const fn has_opmask(self) -> bool {
        matches!(self, Isa::Avx512)
    }

    /// Short lowercase name, used in kernel names and configuration.
    pub const fn name(self) -> &'static str {
        match self {
            Isa::Avx2 => "avx2",
            Isa::Avx512 => "avx512",
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile-time view of an instruction set, used to monomorphize builders.
pub trait VectorIsa: Send + Sync + 'static {
    /// Runtime tag for this variant.
    const ISA: Isa;
    /// Bytes per vector register.
    const VECTOR_BYTES: usize = Self::ISA.vector_bytes();
    /// f32 lanes per vector register.
    const F32_LANES: usize = Self::ISA.f32_lanes();
    /// Physical vector registers.
    const NUM_VEC_REGS: usize = Self::ISA.num_vec_regs();
    /// Opmask registers available for remainder predication.
    const HAS_OPMASK: bool = Self::ISA.has_opmask();

    /// Maps a logical register index to the register handle.
    #[inline]
    fn vec_reg(idx: usize) -> VReg {
        debug_assert!(idx < Self::NUM_VEC_REGS, "vector register {idx} out of range");
        VReg(idx as u8)
    }
}

/// AVX2 + FMA.
#[derive(Debug, Clone, Copy)]
pub struct Avx2;

impl VectorIsa for Avx2 {
    const ISA: Isa = Isa::Avx2;
}

/// AVX-512 F/BW/DQ/VL.
#[derive(Debug, Clone, Copy)]
pub struct Avx512;

impl VectorIsa for Avx512 {
    const ISA: Isa = Isa::Avx512;
}

/// Host CPU capabilities relevant to kernel selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub avx2: bool,
    pub fma: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512dq: bool,
    pub avx512vl: bool,
}

static HOST_FEATURES: Lazy<CpuFeatures> = Lazy::new(CpuFeatures::detect);

impl CpuFeatures {
    /// Probes the running CPU.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        CpuFeatures {
            avx2: is_x86_feature_detected!("avx2"),
            fma: is_x86_feature_detected!("fma"),
            avx512f: is_x86_feature_detected!("avx512f"),
            avx512bw: is_x86_feature_detected!("avx512bw"),
            avx512dq: is_x86_feature_detected!("avx512dq"),
            avx512vl: is_x86_feature_detected!("avx512vl"),
        }
    }

    /// Generated code is x86-64 only; every other target takes the
    /// reference path.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        CpuFeatures::default()
    }

    /// Process-wide probe result, computed once on first access.
    pub fn host() -> &'static CpuFeatures {
        &HOST_FEATURES
    }

    /// Whether kernels generated for `isa` can run here.
    pub fn supports(&self, isa: Isa) -> bool {
        match isa {
            Isa::Avx2 => self.avx2 && self.fma,
            Isa::Avx512 => self.avx512f && self.avx512bw && self.avx512dq && self.avx512vl,
        }
    }

    /// Widest supported ISA, if any.
    pub fn best_isa(&self) -> Option<Isa> {
        [Isa::Avx512, Isa::Avx2]
            .into_iter()
            .find(|&isa| self.supports(isa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_lookups() {
        assert_eq!(Avx2::F32_LANES, 8);
        assert_eq!(Avx2::NUM_VEC_REGS, 16);
        assert!(!Avx2::HAS_OPMASK);
        assert_eq!(Avx512::F32_LANES, 16);
        assert_eq!(Avx512::VECTOR_BYTES, 64);
        assert_eq!(Avx512::NUM_VEC_REGS, 32);
        assert_eq!(Avx512::vec_reg(31), VReg(31));
    }

    #[test]
    fn test_best_isa_prefers_widest() {
        let all = CpuFeatures {
            avx2: true,
            fma: true,
            avx512f: true,
            avx512bw: true,
            avx512dq: true,
            avx512vl: true,
        };
        assert_eq!(all.best_isa(), Some(Isa::Avx512));

        let partial_512 = CpuFeatures {
            avx512bw: false,
            ..all
        };
        assert_eq!(partial_512.best_isa(), Some(Isa::Avx2));

        let no_fma = CpuFeatures {
            fma: false,
            ..partial_512
        };
        assert_eq!(no_fma.best_isa(), None);
        assert_eq!(CpuFeatures::default().best_isa(), None);
    }
}
