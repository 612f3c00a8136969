//! Scalar embedding-bag pooling and fused-row helpers.

use crate::kernels::embedding::{EmbeddingElement, EmbeddingIndex, FUSED_TRAILER_BYTES, PoolingOptions, WeightMode};

/// Scalar version of the pooling kernel, with the same contract.
///
/// `data` holds `data.len() / T::row_len(block_size)` rows. Returns `false`
/// exactly when the generated kernel would: an index outside the table, a
/// bag running past the end of `indices`, or lengths not summing to
/// `indices.len()`. Rows written before the failure keep their values.
///
/// # Panics
///
/// Panics if `out` or `weights` are too short for the bags described.
pub fn embedding_spmdm_ref<T: EmbeddingElement, I: EmbeddingIndex>(
    block_size: usize,
    data: &[T],
    indices: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    options: &PoolingOptions,
    out: &mut [f32],
) -> bool {
    let row_len = T::row_len(block_size);
    let data_size = (data.len() / row_len) as i64;
    let mut cursor = 0usize;

    for (bag, &len) in lengths.iter().enumerate() {
        if len < 0 || cursor + len as usize > indices.len() {
            return false;
        }
        let len = len as usize;
        let out_row = &mut out[bag * block_size..(bag + 1) * block_size];
        out_row.fill(0.0);

        for pos in 0..len {
            let idx = indices[cursor + pos].as_i64();
            if idx < 0 || idx >= data_size {
                return false;
            }
            let weight = weights.map(|w| match options.weight_mode {
                WeightMode::PerIndex => w[cursor + pos],
                WeightMode::PerBag => w[bag],
                WeightMode::Positional => w[pos],
            });
            let start = idx as usize * row_len;
            T::accumulate_row(&data[start..start + row_len], block_size, weight, out_row);
        }

        if options.normalize_by_lengths {
            let scale = if len >= 1 { 1.0 / len as f32 } else { 0.0 };
            out_row.iter_mut().for_each(|v| *v *= scale);
        }
        cursor += len;
    }

    cursor == indices.len()
}

/// Bytes of one fused 8-bit row of width `block_size`.
pub fn fused_row_len(block_size: usize) -> usize {
    block_size + FUSED_TRAILER_BYTES
}

/// Writes `values` followed by `scale` and `bias` into `dst`.
///
/// # Panics
///
/// Panics if `dst` is not exactly `fused_row_len(values.len())` bytes.
pub fn write_fused_row(dst: &mut [u8], values: &[u8], scale: f32, bias: f32) {
    assert_eq!(dst.len(), fused_row_len(values.len()), "fused row length");
    let (body, trailer) = dst.split_at_mut(values.len());
    body.copy_from_slice(values);
    trailer[..4].copy_from_slice(&scale.to_le_bytes());
    trailer[4..].copy_from_slice(&bias.to_le_bytes());
}

/// Quantizes an f32 row to a fused 8-bit row with min/max range.
///
/// `value ≈ q * scale + bias`, where `bias` is the row minimum.
pub fn quantize_row(row: &[f32]) -> Vec<u8> {
    let min = row.iter().copied().fold(f32::INFINITY, f32::min);
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let (min, max) = if row.is_empty() { (0.0, 0.0) } else { (min, max) };
    let range = max - min;
    let scale = if range > 0.0 { range / 255.0 } else { 1.0 };

    let values: Vec<u8> = row
        .iter()
        .map(|&v| ((v - min) / scale).round().clamp(0.0, 255.0) as u8)
        .collect();
    let mut fused = vec![0u8; fused_row_len(row.len())];
    write_fused_row(&mut fused, &values, scale, min);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones_table(rows: usize, block: usize) -> Vec<f32> {
        (0..rows * block).map(|i| (i / block + 1) as f32).collect()
    }

    #[test]
    fn test_sum_pooling() {
        // row r is filled with r + 1
        let data = ones_table(10, 8);
        let indices = [0i32, 0, 1, 1, 4];
        let lengths = [2, 3];
        let mut out = vec![0.0f32; 16];

        assert!(embedding_spmdm_ref(8, &data, &indices, &lengths, None, &PoolingOptions::default(), &mut out));
        assert!(out[..8].iter().all(|&v| v == 2.0));
        assert!(out[8..].iter().all(|&v| v == 9.0));
    }

    #[test]
    fn test_weight_modes() {
        let data = ones_table(4, 2);
        let indices = [0i64, 1, 2, 3];
        let lengths = [2, 2];
        let mut out = vec![0.0f32; 4];

        let per_index = PoolingOptions::default();
        let weights = [1.0, 2.0, 3.0, 4.0];
        assert!(embedding_spmdm_ref(2, &data, &indices, &lengths, Some(&weights), &per_index, &mut out));
        assert_eq!(out, vec![5.0, 5.0, 25.0, 25.0]);

        let per_bag = PoolingOptions {
            weight_mode: WeightMode::PerBag,
            ..per_index
        };
        assert!(embedding_spmdm_ref(2, &data, &indices, &lengths, Some(&[10.0, 0.5]), &per_bag, &mut out));
        assert_eq!(out, vec![30.0, 30.0, 3.5, 3.5]);

        let positional = PoolingOptions {
            weight_mode: WeightMode::Positional,
            ..per_index
        };
        assert!(embedding_spmdm_ref(2, &data, &indices, &lengths, Some(&[1.0, -1.0]), &positional, &mut out));
        assert_eq!(out, vec![-1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_rejections() {
        let data = ones_table(10, 4);
        let opts = PoolingOptions::default();
        let mut out = vec![0.0f32; 8];

        assert!(!embedding_spmdm_ref(4, &data, &[0i32, 10], &[1, 1], None, &opts, &mut out));
        assert!(!embedding_spmdm_ref(4, &data, &[0i32, -1], &[1, 1], None, &opts, &mut out));
        assert!(!embedding_spmdm_ref(4, &data, &[0i32, 1, 2], &[1, 1], None, &opts, &mut out));
        assert!(!embedding_spmdm_ref(4, &data, &[0i32, 1], &[1, 2], None, &opts, &mut out));
        assert!(!embedding_spmdm_ref(4, &data, &[0i32, 1], &[-1, 3], None, &opts, &mut out));
    }

    #[test]
    fn test_empty_bag_normalized_is_zero() {
        let data = ones_table(3, 4);
        let opts = PoolingOptions {
            normalize_by_lengths: true,
            ..PoolingOptions::default()
        };
        let mut out = vec![7.0f32; 8];
        assert!(embedding_spmdm_ref(4, &data, &[2i32, 2], &[0, 2], None, &opts, &mut out));
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(&out[4..], &[3.0; 4]);
    }

    #[test]
    fn test_quantize_row_roundtrip_is_close() {
        let row: Vec<f32> = (0..20).map(|i| i as f32 * 0.25 - 2.0).collect();
        let fused = quantize_row(&row);
        let mut acc = vec![0.0f32; row.len()];
        u8::accumulate_row(&fused, row.len(), None, &mut acc);
        for (x, y) in row.iter().zip(&acc) {
            assert!((x - y).abs() < 0.02, "{x} vs {y}");
        }
    }
}
