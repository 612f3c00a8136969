//! Runtime x86-64 code generation for quantized inference kernels.
//!
//! Instead of shipping one precompiled kernel per shape, this crate writes
//! machine code at runtime for exactly the shape you ask for, for whichever
//! vector ISA the CPU has (AVX2 or AVX-512). Two kernel families:
//!
//! - **Embedding-bag pooling (SpMDM)**: gather variable-length bags of
//!   table rows, optionally weight them, sum, optionally divide by the bag
//!   length. Tables are f32 or fused 8-bit rows with a per-row scale and
//!   bias.
//! - **u8 × s8 → s32 GEMM tiles**: register-blocked tiles over packed
//!   operands, built on `vpmaddubsw` / `vpmaddwd`.
//!
//! Each shape is compiled once per dispatcher and cached for its lifetime.
//!
//! ## Usage
//!
//! ```
//! use quantjit::{embedding_spmdm, PoolingOptions};
//!
//! let block_size = 8;
//! let table: Vec<f32> = (0..10 * block_size).map(|i| (i / block_size) as f32 + 1.0).collect();
//! let indices = [0i64, 0, 1, 1, 4];
//! let lengths = [2, 3];
//! let mut out = vec![0.0f32; lengths.len() * block_size];
//!
//! embedding_spmdm(block_size, &table, &indices, &lengths, None, &PoolingOptions::default(), &mut out).unwrap();
//! assert_eq!(&out[..8], &[2.0; 8]);
//! assert_eq!(&out[8..], &[9.0; 8]);
//! ```
//!
//! GEMM tiles take packed operands:
//!
//! ```
//! use quantjit::{gemm_u8s8_tile, shared_gemm};
//! use quantjit::pack::{pack_a, pack_b};
//!
//! let p = shared_gemm().blocking();
//! let (mc, nc, kc) = (4, p.nr, 64);
//! let a = vec![1u8; mc * kc];
//! let b = vec![2i8; kc * nc];
//! let mut c = vec![0i32; mc * nc];
//!
//! let a_packed = pack_a(&a, kc, mc, kc, p.kcb);
//! let b_packed = pack_b(&b, nc, kc, nc, p.ncb);
//! gemm_u8s8_tile(false, mc, nc, kc, &a_packed, &b_packed, &mut c, nc).unwrap();
//! assert!(c.iter().all(|&v| v == 128));
//! ```
//!
//! ## What's inside
//!
//! - `isa`: AVX2 / AVX-512 descriptions and CPU feature detection
//! - `jit`: VEX/EVEX encoding on top of `dynasmrt`, register budgeting
//! - `cache`: compile-once kernel cache
//! - `kernels`: the two code generators
//! - `dispatch`: safe entry points with scalar fallback
//! - `reference`, `pack`: scalar baselines and operand packing

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod isa;
pub mod jit;
pub mod kernels;
pub mod pack;
pub mod reference;

pub use cache::KernelCache;
pub use config::{IsaLimit, JitConfig};
pub use dispatch::{EmbeddingSpmdm, GemmU8S8Acc32, embedding_spmdm, gemm_u8s8_tile, shared_gemm};
pub use error::{Error, Result};
pub use isa::{Avx2, Avx512, CpuFeatures, Isa, VectorIsa};
pub use kernels::{BlockingParams, EmbeddingSignature, GemmSignature, PoolingOptions, WeightMode};
