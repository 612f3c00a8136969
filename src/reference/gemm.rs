//! Scalar u8 × s8 → s32 matrix multiplication.

use crate::kernels::gemm::GemmSignature;

/// Plain matrix multiply on row-major operands: C += A × B
///
/// Loop order is i-k-j so that B and C are walked with stride 1. Products
/// are exact; sums wrap like the vector accumulators do.
///
/// # Arguments
///
/// * `a` - Matrix A (m × k), row-major
/// * `b` - Matrix B (k × n), row-major
/// * `c` - Matrix C (m × n), row-major, accumulated into
pub fn gemm_u8s8s32_naive(a: &[u8], b: &[i8], c: &mut [i32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p] as i32;
            for j in 0..n {
                c[i * n + j] = c[i * n + j].wrapping_add(a_ip * b[p * n + j] as i32);
            }
        }
    }
}

/// Same result as the generated tile kernel for `sig`, bit for bit.
///
/// Reads packed A and B in the layouts described in
/// [`kernels::gemm`](crate::kernels::gemm) and reproduces the i16
/// saturation of `vpmaddubsw` on each pair of products.
///
/// # Panics
///
/// Panics if a buffer is shorter than the tile needs.
pub fn gemm_packed_tile(sig: &GemmSignature, a: &[u8], b: &[i8], c: &mut [i32], ldc: usize) {
    let p = &sig.params;
    let ri = p.row_interleave;
    let b_stride = p.ncb * ri;

    for i in 0..sig.mc {
        let a_row = &a[i * p.kcb..i * p.kcb + sig.kc];
        for j in 0..sig.nc {
            let mut acc = 0i32;
            for (g, a_group) in a_row.chunks_exact(ri).enumerate() {
                let b_group = &b[g * b_stride + j * ri..g * b_stride + j * ri + ri];
                for pair in 0..ri / 2 {
                    let lo = a_group[2 * pair] as i32 * b_group[2 * pair] as i32;
                    let hi = a_group[2 * pair + 1] as i32 * b_group[2 * pair + 1] as i32;
                    let sat = (lo + hi).clamp(i16::MIN as i32, i16::MAX as i32);
                    acc = acc.wrapping_add(sat);
                }
            }
            let dst = &mut c[i * ldc + j];
            *dst = if sig.accumulate { dst.wrapping_add(acc) } else { acc };
        }
    }
}
