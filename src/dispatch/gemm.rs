//! Quantized GEMM tile entry points.

use std::sync::Arc;

use once_cell::sync::Lazy;

use super::{require_host_support, select_isa};
use crate::cache::KernelCache;
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::isa::Isa;
use crate::jit::CompiledKernel;
use crate::kernels::gemm::{self, BlockingParams, GemmSignature, RawGemmKernel};
use crate::reference;

/// Shared handle to a compiled GEMM tile kernel.
pub type GemmKernel = Arc<CompiledKernel<RawGemmKernel>>;

/// u8 × s8 → s32 tile dispatcher.
pub struct GemmU8S8Acc32 {
    isa: Option<Isa>,
    config: JitConfig,
    cache: KernelCache<GemmSignature, GemmKernel>,
}

impl Default for GemmU8S8Acc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl GemmU8S8Acc32 {
    /// Dispatcher using the process configuration and the best host ISA.
    pub fn new() -> Self {
        Self::with_config(JitConfig::global().clone())
    }

    pub fn with_config(config: JitConfig) -> Self {
        GemmU8S8Acc32 {
            isa: select_isa(&config),
            config,
            cache: KernelCache::new(),
        }
    }

    /// Dispatcher pinned to `isa`; `None` forces the scalar path.
    pub fn for_isa(isa: Option<Isa>) -> Result<Self> {
        let isa = require_host_support(isa)?;
        Ok(GemmU8S8Acc32 {
            isa,
            config: JitConfig::global().clone(),
            cache: KernelCache::new(),
        })
    }

    /// ISA in use, `None` on the scalar path.
    pub fn isa(&self) -> Option<Isa> {
        self.isa
    }

    pub fn cache(&self) -> &KernelCache<GemmSignature, GemmKernel> {
        &self.cache
    }

    /// Blocking that operands must be packed with for this dispatcher.
    ///
    /// The scalar path uses the AVX2 layout.
    pub fn blocking(&self) -> BlockingParams {
        BlockingParams::for_isa(self.layout_isa())
    }

    fn layout_isa(&self) -> Isa {
        self.isa.unwrap_or(Isa::Avx2)
    }

    /// Signature of an `mc × nc × kc` tile with the default blocking.
    pub fn signature(&self, accumulate: bool, mc: usize, nc: usize, kc: usize) -> GemmSignature {
        GemmSignature::new(accumulate, mc, nc, kc, self.layout_isa())
    }

    /// Kernel for `sig`, generated on first request.
    pub fn kernel(&self, sig: &GemmSignature) -> Result<GemmKernel> {
        self.cache
            .get_or_create(sig, || gemm::generate(sig, self.config.dump_dir.as_deref()).map(Arc::new))
    }

    /// Computes one tile: `C[0:mc, 0:nc] (+)= A × B` over `kc`.
    ///
    /// `a` and `b` must be packed with [`blocking`](Self::blocking)
    /// (see [`crate::pack`]); `c` is row-major with stride `ldc`.
    ///
    /// Adjacent k pairs are summed in 16 bits before widening (the
    /// `vpmaddubsw` step), so `a[k]*b[k] + a[k+1]*b[k+1]` saturates at
    /// `i16::MIN..=i16::MAX`. Results match an exact product only while
    /// every such pair sum stays in that range, e.g. A in `0..=127` with
    /// B in `-128..=127`, or A in `0..=255` with B in `-64..=63`. The
    /// scalar path saturates the same way.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        accumulate: bool,
        mc: usize,
        nc: usize,
        kc: usize,
        a: &[u8],
        b: &[i8],
        c: &mut [i32],
        ldc: usize,
    ) -> Result<()> {
        let sig = self.signature(accumulate, mc, nc, kc);
        sig.validate()?;
        check_tile_args(&sig, a.len(), b.len(), c.len(), ldc)?;

        match self.isa {
            Some(_) => {
                let kernel = self.kernel(&sig)?;
                let b_prefetch = b.as_ptr().wrapping_add(sig.b_prefetch_distance());
                // SAFETY: buffer extents were checked against the tile shape
                // above; prefetches never fault, so `b_prefetch` may point
                // past the end of `b`.
                unsafe {
                    (kernel.entry())(a.as_ptr(), b.as_ptr(), b_prefetch, c.as_mut_ptr(), kc as i64, ldc as i64);
                }
            }
            None => reference::gemm_packed_tile(&sig, a, b, c, ldc),
        }
        Ok(())
    }
}

fn check_tile_args(sig: &GemmSignature, a_len: usize, b_len: usize, c_len: usize, ldc: usize) -> Result<()> {
    if a_len < sig.a_len() {
        return Err(Error::InvalidArgument(format!(
            "packed A has {a_len} bytes, tile needs {}",
            sig.a_len()
        )));
    }
    if b_len < sig.b_len() {
        return Err(Error::InvalidArgument(format!(
            "packed B has {b_len} bytes, tile needs {}",
            sig.b_len()
        )));
    }
    if ldc < sig.nc {
        return Err(Error::InvalidArgument(format!("ldc ({ldc}) smaller than nc ({})", sig.nc)));
    }
    let c_needed = (sig.mc - 1) * ldc + sig.nc;
    if c_len < c_needed {
        return Err(Error::InvalidArgument(format!("C has {c_len} elements, tile needs {c_needed}")));
    }
    Ok(())
}

static SHARED_GEMM: Lazy<GemmU8S8Acc32> = Lazy::new(GemmU8S8Acc32::new);

/// Runs one tile through the process-wide GEMM dispatcher.
///
/// See [`GemmU8S8Acc32::run`]; operands are packed with
/// `shared_gemm().blocking()`. Pairs of products saturate at 16 bits, so
/// keep A in `0..=127` (or B in `-64..=63`) for exact results.
#[allow(clippy::too_many_arguments)]
pub fn gemm_u8s8_tile(
    accumulate: bool,
    mc: usize,
    nc: usize,
    kc: usize,
    a: &[u8],
    b: &[i8],
    c: &mut [i32],
    ldc: usize,
) -> Result<()> {
    SHARED_GEMM.run(accumulate, mc, nc, kc, a, b, c, ldc)
}

/// The process-wide GEMM dispatcher.
pub fn shared_gemm() -> &'static GemmU8S8Acc32 {
    &SHARED_GEMM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_argument_checks() {
        let gemm = GemmU8S8Acc32::for_isa(None).unwrap();
        let p = gemm.blocking();
        let a = vec![0u8; p.kcb];
        let b = vec![0i8; 4 * p.ncb];
        let mut c = vec![0i32; p.nr];

        assert!(gemm.run(false, 1, p.nr, 4, &a, &b, &mut c, p.nr).is_ok());
        assert!(matches!(
            gemm.run(false, 2, p.nr, 4, &a, &b, &mut c, p.nr),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            gemm.run(false, 1, p.nr, 6, &a, &b, &mut c, p.nr),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            gemm.run(false, 1, p.nr, 4, &a, &b, &mut c, p.nr - 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pair_sums_saturate_at_16_bits() {
        let mut gemms = vec![GemmU8S8Acc32::for_isa(None).unwrap()];
        if let Some(isa) = crate::isa::CpuFeatures::host().best_isa() {
            gemms.push(GemmU8S8Acc32::for_isa(Some(isa)).unwrap());
        }

        for gemm in gemms {
            let p = gemm.blocking();
            let (mc, nc, kc) = (1, p.nr, 4);
            let mut a = vec![0u8; p.kcb];
            let mut c = vec![0i32; nc];

            // 255 * -128 twice per pair: -65280 clamps to -32768, two pairs
            a[..kc].fill(255);
            let b = vec![-128i8; kc * p.ncb];
            gemm.run(false, mc, nc, kc, &a, &b, &mut c, nc).unwrap();
            assert!(c.iter().all(|&v| v == 2 * i16::MIN as i32), "{:?}", gemm.isa());

            // inside the documented range the result is exact
            a[..kc].fill(127);
            gemm.run(false, mc, nc, kc, &a, &b, &mut c, nc).unwrap();
            assert!(c.iter().all(|&v| v == 4 * 127 * -128), "{:?}", gemm.isa());
        }
    }

    #[test]
    fn test_b_prefetch_runs_one_group_ahead() {
        for isa in [Isa::Avx2, Isa::Avx512] {
            let sig = GemmSignature::new(false, 4, 16, 64, isa);
            let p = sig.params;
            assert_eq!(sig.b_prefetch_distance(), p.ncb * p.row_interleave);
            assert!(sig.b_prefetch_distance() > 0);
        }
    }
}
