//! Embedding-bag pooling entry points.

use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::{require_host_support, select_isa};
use crate::cache::KernelCache;
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::isa::Isa;
use crate::jit::CompiledKernel;
use crate::kernels::embedding::{
    self, EmbeddingElement, EmbeddingIndex, EmbeddingSignature, PoolingOptions, RawEmbeddingKernel, WeightMode,
};
use crate::reference;

/// Shared handle to a compiled pooling kernel.
pub type EmbeddingKernel = Arc<CompiledKernel<RawEmbeddingKernel>>;

/// Pooling dispatcher for table element `T` and index type `I`.
///
/// Owns its kernel cache: kernels generated here live as long as the
/// dispatcher.
pub struct EmbeddingSpmdm<T, I> {
    isa: Option<Isa>,
    config: JitConfig,
    cache: KernelCache<EmbeddingSignature, EmbeddingKernel>,
    _types: PhantomData<fn(T, I)>,
}

impl<T: EmbeddingElement, I: EmbeddingIndex> Default for EmbeddingSpmdm<T, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: EmbeddingElement, I: EmbeddingIndex> EmbeddingSpmdm<T, I> {
    /// Dispatcher using the process configuration and the best host ISA.
    pub fn new() -> Self {
        Self::with_config(JitConfig::global().clone())
    }

    pub fn with_config(config: JitConfig) -> Self {
        EmbeddingSpmdm {
            isa: select_isa(&config),
            config,
            cache: KernelCache::new(),
            _types: PhantomData,
        }
    }

    /// Dispatcher pinned to `isa`; `None` forces the scalar path.
    ///
    /// Fails if the host cannot run `isa`.
    pub fn for_isa(isa: Option<Isa>) -> Result<Self> {
        let isa = require_host_support(isa)?;
        Ok(EmbeddingSpmdm {
            isa,
            config: JitConfig::global().clone(),
            cache: KernelCache::new(),
            _types: PhantomData,
        })
    }

    /// ISA in use, `None` on the scalar path.
    pub fn isa(&self) -> Option<Isa> {
        self.isa
    }

    pub fn cache(&self) -> &KernelCache<EmbeddingSignature, EmbeddingKernel> {
        &self.cache
    }

    /// Kernel for this shape, generated on first request.
    pub fn kernel(&self, block_size: usize, weighted: bool, options: &PoolingOptions) -> Result<EmbeddingKernel> {
        let isa = self
            .isa
            .ok_or_else(|| Error::InvalidConfig("no vector ISA selected".into()))?;
        let sig = EmbeddingSignature::new::<T, I>(block_size, weighted, options, isa);
        self.cache.get_or_create(&sig, || {
            embedding::generate(&sig, self.config.dump_dir.as_deref()).map(Arc::new)
        })
    }

    /// Pools `lengths.len()` bags into `out` (`lengths.len() × block_size`).
    ///
    /// `data` holds whole table rows of `T::row_len(block_size)` elements.
    /// With `weights`, `options.weight_mode` decides how they are read:
    /// one per index, one per bag, or one per position inside a bag.
    ///
    /// Returns [`Error::BoundsCheck`] when an index is outside the table or
    /// the lengths do not cover `indices` exactly.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        block_size: usize,
        data: &[T],
        indices: &[I],
        lengths: &[i32],
        weights: Option<&[f32]>,
        options: &PoolingOptions,
        out: &mut [f32],
    ) -> Result<()> {
        check_pooling_args::<T>(block_size, data, indices.len(), lengths, weights, options, out.len())?;

        let ok = match self.isa {
            Some(_) => {
                let kernel = self.kernel(block_size, weights.is_some(), options)?;
                let data_size = data.len() / T::row_len(block_size);
                // SAFETY: the kernel reads at most `lengths.len()` lengths,
                // `indices.len()` indices and the weights counted by
                // `check_pooling_args`, reads table rows only after checking
                // them against `data_size`, and writes exactly `out.len()`
                // floats.
                unsafe {
                    (kernel.entry())(
                        lengths.len() as i64,
                        indices.len() as i64,
                        data_size as i64,
                        data.as_ptr().cast::<u8>(),
                        indices.as_ptr().cast::<u8>(),
                        lengths.as_ptr(),
                        weights.map_or(std::ptr::null(), <[f32]>::as_ptr),
                        out.as_mut_ptr(),
                    )
                }
            }
            None => reference::embedding_spmdm_ref(block_size, data, indices, lengths, weights, options, out),
        };

        if ok { Ok(()) } else { Err(Error::BoundsCheck) }
    }
}

fn check_pooling_args<T: EmbeddingElement>(
    block_size: usize,
    data: &[T],
    index_count: usize,
    lengths: &[i32],
    weights: Option<&[f32]>,
    options: &PoolingOptions,
    out_len: usize,
) -> Result<()> {
    if block_size == 0 {
        return Err(Error::InvalidConfig("block_size must be at least 1".into()));
    }
    let row_len = T::row_len(block_size);
    if data.len() % row_len != 0 {
        return Err(Error::InvalidArgument(format!(
            "table length {} is not a multiple of the row length {row_len}",
            data.len()
        )));
    }
    if out_len != lengths.len() * block_size {
        return Err(Error::InvalidArgument(format!(
            "output holds {out_len} floats, expected {} bags × {block_size}",
            lengths.len()
        )));
    }
    if let Some(weights) = weights {
        let needed = match options.weight_mode {
            WeightMode::PerIndex => index_count,
            WeightMode::PerBag => lengths.len(),
            WeightMode::Positional => lengths.iter().copied().max().unwrap_or(0).max(0) as usize,
        };
        if weights.len() < needed {
            return Err(Error::InvalidArgument(format!(
                "{} weights given, {:?} weighting needs {needed}",
                weights.len(),
                options.weight_mode
            )));
        }
    }
    Ok(())
}

/// Process-wide dispatcher instances, built on first use.
pub trait SharedSpmdm: Sized + 'static {
    fn shared() -> &'static Self;
}

macro_rules! shared_spmdm {
    ($($name:ident: $t:ty, $i:ty;)*) => {
        $(
            static $name: Lazy<EmbeddingSpmdm<$t, $i>> = Lazy::new(EmbeddingSpmdm::new);

            impl SharedSpmdm for EmbeddingSpmdm<$t, $i> {
                fn shared() -> &'static Self {
                    &$name
                }
            }
        )*
    };
}

shared_spmdm! {
    SPMDM_U8_I32: u8, i32;
    SPMDM_U8_I64: u8, i64;
    SPMDM_F32_I32: f32, i32;
    SPMDM_F32_I64: f32, i64;
}

/// Pools embedding bags with the process-wide dispatcher for `(T, I)`.
///
/// See [`EmbeddingSpmdm::run`].
///
/// # Example
///
/// ```
/// use quantjit::{embedding_spmdm, PoolingOptions};
///
/// // four rows of width 4, row r filled with r
/// let table: Vec<f32> = (0..16).map(|i| (i / 4) as f32).collect();
/// let indices = [1i32, 3, 2];
/// let lengths = [2, 1];
/// let mut out = vec![0.0f32; 8];
///
/// embedding_spmdm(4, &table, &indices, &lengths, None, &PoolingOptions::default(), &mut out).unwrap();
/// assert_eq!(out, vec![4.0, 4.0, 4.0, 4.0, 2.0, 2.0, 2.0, 2.0]);
/// ```
pub fn embedding_spmdm<T, I>(
    block_size: usize,
    data: &[T],
    indices: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    options: &PoolingOptions,
    out: &mut [f32],
) -> Result<()>
where
    T: EmbeddingElement,
    I: EmbeddingIndex,
    EmbeddingSpmdm<T, I>: SharedSpmdm,
{
    EmbeddingSpmdm::<T, I>::shared().run(block_size, data, indices, lengths, weights, options, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_checks() {
        let spmdm = EmbeddingSpmdm::<f32, i32>::for_isa(None).unwrap();
        let opts = PoolingOptions::default();
        let data = vec![0.0f32; 12];
        let mut out = vec![0.0f32; 8];

        let err = spmdm.run(5, &data, &[0], &[1], None, &opts, &mut out[..5]);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        let err = spmdm.run(4, &data, &[0], &[1, 0], None, &opts, &mut out[..4]);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        let err = spmdm.run(4, &data, &[0, 1], &[1, 1], Some(&[1.0]), &opts, &mut out);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        let err = spmdm.run(0, &data, &[0], &[1], None, &opts, &mut out[..0]);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_scalar_path_reports_bounds_errors() {
        let spmdm = EmbeddingSpmdm::<f32, i64>::for_isa(None).unwrap();
        assert_eq!(spmdm.isa(), None);
        let data = vec![1.0f32; 8];
        let mut out = vec![0.0f32; 4];
        let err = spmdm.run(4, &data, &[2], &[1], None, &PoolingOptions::default(), &mut out);
        assert!(matches!(err, Err(Error::BoundsCheck)));
        assert!(spmdm.cache().is_empty());
    }
}
