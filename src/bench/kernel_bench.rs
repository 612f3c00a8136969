//! Criterion benchmarks: generated kernels against the scalar reference.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use quantjit::pack::{pack_a, pack_b};
use quantjit::reference::{embedding_spmdm_ref, gemm_packed_tile, quantize_row};
use quantjit::{EmbeddingSpmdm, GemmU8S8Acc32, PoolingOptions};

fn fused_table(rows: usize, block_size: usize) -> Vec<u8> {
    let mut table = Vec::with_capacity(rows * (block_size + 8));
    for r in 0..rows {
        let row: Vec<f32> = (0..block_size)
            .map(|j| {
                let v = ((r * block_size + j) as u32).wrapping_mul(2654435761) >> 16;
                (v % 200) as f32 / 100.0 - 1.0
            })
            .collect();
        table.extend_from_slice(&quantize_row(&row));
    }
    table
}

fn bench_pooling(c: &mut Criterion) {
    let mut group = c.benchmark_group("embedding_spmdm_u8");
    let rows = 50_000;
    let bags = 1_000;
    let bag_len = 40;
    let spmdm = EmbeddingSpmdm::<u8, i32>::new();
    let options = PoolingOptions::default();

    for block_size in [32, 64, 128] {
        let table = fused_table(rows, block_size);
        let indices: Vec<i32> = (0..bags * bag_len).map(|i| ((i * 7919) % rows) as i32).collect();
        let lengths = vec![bag_len as i32; bags];
        let mut out = vec![0.0f32; bags * block_size];
        group.throughput(Throughput::Bytes((bags * bag_len * (block_size + 8)) as u64));

        group.bench_with_input(BenchmarkId::new("reference", block_size), &block_size, |b, &bs| {
            b.iter(|| embedding_spmdm_ref(bs, &table, &indices, &lengths, None, &options, black_box(&mut out)));
        });
        group.bench_with_input(BenchmarkId::new("dispatch", block_size), &block_size, |b, &bs| {
            b.iter(|| spmdm.run(bs, &table, &indices, &lengths, None, &options, black_box(&mut out)));
        });
    }
    group.finish();
}

fn bench_gemm_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm_u8s8s32");
    let gemm = GemmU8S8Acc32::new();
    let p = gemm.blocking();
    let (mc, nc) = (p.mr * 2, p.ncb);

    for kc in [64, 256] {
        let a: Vec<u8> = (0..mc * kc).map(|i| (i % 251) as u8).collect();
        let b: Vec<i8> = (0..kc * nc).map(|i| ((i % 61) as i8) - 30).collect();
        let a_packed = pack_a(&a, kc, mc, kc, p.kcb);
        let b_packed = pack_b(&b, nc, kc, nc, p.ncb);
        let mut out = vec![0i32; mc * nc];
        let sig = gemm.signature(false, mc, nc, kc);
        group.throughput(Throughput::Elements((2 * mc * nc * kc) as u64));

        group.bench_with_input(BenchmarkId::new("reference", kc), &kc, |bench, _| {
            bench.iter(|| gemm_packed_tile(&sig, &a_packed, &b_packed, black_box(&mut out), nc));
        });
        group.bench_with_input(BenchmarkId::new("dispatch", kc), &kc, |bench, &kc| {
            bench.iter(|| gemm.run(false, mc, nc, kc, &a_packed, &b_packed, black_box(&mut out), nc));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pooling, bench_gemm_tile);
criterion_main!(benches);
