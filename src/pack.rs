//! Lays row-major operands out the way GEMM tile kernels read them.
//!
//! A keeps its rows but gets a fixed row stride of `KCB`. B is regrouped so
//! the `ROW_INTERLEAVE` consecutive k values of one column sit next to each
//! other: after packing, one vector load picks up a whole k-group for
//! several columns.

use crate::kernels::gemm::ROW_INTERLEAVE;

/// Packs the top-left `mc × kc` block of A (row stride `lda`) into rows of
/// `kcb` bytes. Padding bytes are zero.
///
/// # Panics
///
/// Panics if `kc > kcb` or A is too short for the block.
pub fn pack_a(a: &[u8], lda: usize, mc: usize, kc: usize, kcb: usize) -> Vec<u8> {
    assert!(kc <= kcb, "kc ({kc}) larger than KCB ({kcb})");
    let mut packed = vec![0u8; mc * kcb];
    for i in 0..mc {
        packed[i * kcb..i * kcb + kc].copy_from_slice(&a[i * lda..i * lda + kc]);
    }
    packed
}

/// Packs the top-left `kc × nc` block of B (row stride `ldb`) into
/// k-groups of `ncb` interleaved columns.
///
/// Column `n` of k-group `g` lands at
/// `packed[g * ncb * 4 + n * 4 .. + 4]`. `kc` is rounded up to a whole
/// group; missing rows and columns are zero.
///
/// # Panics
///
/// Panics if `nc > ncb` or B is too short for the block.
pub fn pack_b(b: &[i8], ldb: usize, kc: usize, nc: usize, ncb: usize) -> Vec<i8> {
    assert!(nc <= ncb, "nc ({nc}) larger than NCB ({ncb})");
    let groups = kc.div_ceil(ROW_INTERLEAVE);
    let group_stride = ncb * ROW_INTERLEAVE;
    let mut packed = vec![0i8; groups * group_stride];

    for p in 0..kc {
        let (g, r) = (p / ROW_INTERLEAVE, p % ROW_INTERLEAVE);
        for n in 0..nc {
            packed[g * group_stride + n * ROW_INTERLEAVE + r] = b[p * ldb + n];
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_a_stride() {
        let a: Vec<u8> = (1..=6).collect(); // 2x3
        let packed = pack_a(&a, 3, 2, 3, 4);
        assert_eq!(packed, vec![1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn test_pack_b_interleaves_k() {
        // 4x2 matrix, one k-group, NCB = 2
        let b: Vec<i8> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let packed = pack_b(&b, 2, 4, 2, 2);
        assert_eq!(packed, vec![1, 3, 5, 7, 2, 4, 6, 8]);
    }
}
