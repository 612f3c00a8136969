//! Code generators for the two kernel families.
//!
//! Each builder turns a signature into machine code through the
//! [`jit`](crate::jit) emitter. Builders are generic over
//! [`VectorIsa`](crate::isa::VectorIsa); `generate` picks the
//! instantiation from the ISA tag inside the signature.
//!
//! - `embedding`: embedding-bag pooling over f32 or fused 8-bit tables
//! - `gemm`: u8 × s8 → s32 register-blocked GEMM tiles

pub mod embedding;
pub mod gemm;

pub use embedding::{
    ElementKind, EmbeddingElement, EmbeddingIndex, EmbeddingSignature, IndexWidth, PoolingOptions, RawEmbeddingKernel,
    WeightMode,
};
pub use gemm::{BlockingParams, GemmSignature, RawGemmKernel};
