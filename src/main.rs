//! Benchmark runner for the generated kernels.

use quantjit::pack::{pack_a, pack_b};
use quantjit::reference::{embedding_spmdm_ref, gemm_packed_tile, quantize_row};
use quantjit::{CpuFeatures, EmbeddingSpmdm, GemmU8S8Acc32, Isa, PoolingOptions};
use std::time::Instant;

fn main() {
    println!("=== quantjit Kernel Benchmark ===\n");

    let cpu = CpuFeatures::host();
    let has_avx2 = cpu.supports(Isa::Avx2);
    let has_avx512 = cpu.supports(Isa::Avx512);
    println!("CPU Features: AVX2={}, AVX-512={}\n", has_avx2, has_avx512);

    let mut isas = vec![None];
    if has_avx2 {
        isas.push(Some(Isa::Avx2));
    }
    if has_avx512 {
        isas.push(Some(Isa::Avx512));
    }

    let iterations = 5;
    let mut all_results = Vec::new();

    for &block_size in &[64, 128, 256] {
        println!("Embedding pooling: block {}", block_size);
        println!("{}", "-".repeat(60));
        let results = bench_pooling(block_size, &isas, iterations);
        print_results(&results, "GB/s");
        all_results.push((format!("pool {block_size}"), results));
    }

    for &kc in &[64, 256] {
        println!("GEMM tile: k {}", kc);
        println!("{}", "-".repeat(60));
        let results = bench_gemm(kc, &isas, iterations);
        print_results(&results, "GOPS");
        all_results.push((format!("gemm k{kc}"), results));
    }

    print_summary_table(&all_results);
}

fn isa_label(isa: Option<Isa>) -> &'static str {
    match isa {
        None => "Scalar",
        Some(Isa::Avx2) => "JIT AVX2",
        Some(Isa::Avx512) => "JIT AVX-512",
    }
}

/// Time `f` over `iterations` runs after one warmup run; returns ms.
fn time_ms<F: FnMut()>(iterations: usize, mut f: F) -> f64 {
    f();
    let start = Instant::now();
    for _ in 0..iterations {
        f();
    }
    start.elapsed().as_secs_f64() * 1000.0 / iterations as f64
}

fn bench_pooling(block_size: usize, isas: &[Option<Isa>], iterations: usize) -> Vec<(&'static str, (f64, f64))> {
    let rows = 100_000;
    let bags = 10_000;
    let bag_len = 32;

    let mut table = Vec::with_capacity(rows * (block_size + 8));
    for r in 0..rows {
        let row: Vec<f32> = (0..block_size).map(|j| ((r * 31 + j * 7) % 97) as f32 / 97.0).collect();
        table.extend_from_slice(&quantize_row(&row));
    }
    let indices: Vec<i64> = (0..bags * bag_len).map(|i| ((i * 7919) % rows) as i64).collect();
    let lengths = vec![bag_len as i32; bags];
    let options = PoolingOptions::default();
    let mut out = vec![0.0f32; bags * block_size];

    let bytes = (bags * bag_len * (block_size + 8)) as f64;
    let mut results = Vec::new();
    for &isa in isas {
        let ms = match isa {
            None => time_ms(iterations, || {
                embedding_spmdm_ref(block_size, &table, &indices, &lengths, None, &options, &mut out);
            }),
            Some(isa) => {
                let spmdm = match EmbeddingSpmdm::<u8, i64>::for_isa(Some(isa)) {
                    Ok(spmdm) => spmdm,
                    Err(err) => {
                        println!("{}: {}", isa_label(Some(isa)), err);
                        continue;
                    }
                };
                time_ms(iterations, || {
                    if let Err(err) = spmdm.run(block_size, &table, &indices, &lengths, None, &options, &mut out) {
                        println!("{}: {}", isa_label(Some(isa)), err);
                    }
                })
            }
        };
        results.push((isa_label(isa), (ms, bytes / (ms / 1000.0) / 1e9)));
    }
    results
}

fn bench_gemm(kc: usize, isas: &[Option<Isa>], iterations: usize) -> Vec<(&'static str, (f64, f64))> {
    let tiles = 2_000;
    let mut results = Vec::new();

    for &isa in isas {
        let gemm = match GemmU8S8Acc32::for_isa(isa) {
            Ok(gemm) => gemm,
            Err(err) => {
                println!("{}: {}", isa_label(isa), err);
                continue;
            }
        };
        let p = gemm.blocking();
        let (mc, nc) = (p.mr * 4, p.ncb);
        let a: Vec<u8> = (0..mc * kc).map(|i| (i % 251) as u8).collect();
        let b: Vec<i8> = (0..kc * nc).map(|i| ((i % 61) as i8) - 30).collect();
        let a_packed = pack_a(&a, kc, mc, kc, p.kcb);
        let b_packed = pack_b(&b, nc, kc, nc, p.ncb);
        let mut c = vec![0i32; mc * nc];

        let ms = time_ms(iterations, || {
            for _ in 0..tiles {
                match isa {
                    None => gemm_packed_tile(&gemm.signature(false, mc, nc, kc), &a_packed, &b_packed, &mut c, nc),
                    Some(_) => {
                        if let Err(err) = gemm.run(false, mc, nc, kc, &a_packed, &b_packed, &mut c, nc) {
                            println!("{}: {}", isa_label(isa), err);
                            return;
                        }
                    }
                }
            }
        });
        let ops = 2.0 * (tiles * mc * nc * kc) as f64;
        results.push((isa_label(isa), (ms, ops / (ms / 1000.0) / 1e9)));
    }
    results
}

fn print_results(results: &[(&str, (f64, f64))], unit: &str) {
    let baseline_time = results[0].1.0;
    for (i, (name, (time_ms, rate))) in results.iter().enumerate() {
        println!(
            "{}. {:14} {:8.2} ms  {:8.2} {}  ({:.1}×)",
            i + 1,
            name,
            time_ms,
            rate,
            unit,
            baseline_time / time_ms
        );
    }
    println!();
}

#[allow(clippy::type_complexity)]
fn print_summary_table(all_results: &[(String, Vec<(&str, (f64, f64))>)]) {
    println!("\n{}", "=".repeat(60));
    println!("SUMMARY (speedup over scalar)");
    println!("{}", "=".repeat(60));

    for (name, results) in all_results {
        let baseline_time = results[0].1.0;
        let cells: Vec<String> = results
            .iter()
            .skip(1)
            .map(|(method, (time_ms, _))| format!("{} {:.1}×", method, baseline_time / time_ms))
            .collect();
        println!("{:<12} {}", name, cells.join("   "));
    }

    println!("{}", "=".repeat(60));
}
