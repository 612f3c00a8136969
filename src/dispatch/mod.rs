//! Runtime selection and invocation of generated kernels.
//!
//! A dispatcher picks the widest ISA the CPU supports (capped by
//! [`JitConfig`]), fetches kernels through its own [`KernelCache`] and calls
//! them on the caller's buffers after checking every slice length. Without
//! a usable ISA it runs the scalar reference instead.
//!
//! [`KernelCache`]: crate::cache::KernelCache

pub mod embedding;
pub mod gemm;

use std::sync::Once;

pub use embedding::{EmbeddingKernel, EmbeddingSpmdm, SharedSpmdm, embedding_spmdm};
pub use gemm::{GemmKernel, GemmU8S8Acc32, gemm_u8s8_tile, shared_gemm};

use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::isa::{CpuFeatures, Isa};

static SCALAR_FALLBACK: Once = Once::new();

/// ISA a dispatcher built from `config` runs on, `None` for scalar code.
pub fn select_isa(config: &JitConfig) -> Option<Isa> {
    let isa = config.select_isa(CpuFeatures::host());
    if isa.is_none() {
        SCALAR_FALLBACK.call_once(|| {
            log::info!("no usable vector ISA (cap {:?}); using scalar kernels", config.max_isa);
        });
    }
    isa
}

/// Checks that an explicitly requested ISA can run on this host.
fn require_host_support(isa: Option<Isa>) -> Result<Option<Isa>> {
    match isa {
        Some(isa) if !CpuFeatures::host().supports(isa) => {
            Err(Error::InvalidConfig(format!("{isa} is not supported by this CPU")))
        }
        other => Ok(other),
    }
}
