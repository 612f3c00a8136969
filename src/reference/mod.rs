//! Portable scalar implementations.
//!
//! Used when the host has no supported vector ISA, and as the comparison
//! baseline in tests. Both follow the generated kernels' contracts exactly.

pub mod embedding;
pub mod gemm;

pub use embedding::{embedding_spmdm_ref, fused_row_len, quantize_row, write_fused_row};
pub use gemm::{gemm_packed_tile, gemm_u8s8s32_naive};
