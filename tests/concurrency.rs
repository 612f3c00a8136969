use std::sync::{Arc, Barrier};
use std::thread;

use quantjit::pack::{pack_a, pack_b};
use quantjit::{CpuFeatures, EmbeddingSpmdm, GemmU8S8Acc32, PoolingOptions};

// ============================================================
// Many callers, one dispatcher
// ============================================================

#[test]
fn test_racing_pooling_calls_share_one_kernel() {
    let spmdm = Arc::new(EmbeddingSpmdm::<f32, i64>::new());
    if spmdm.isa().is_none() {
        println!("Skipping - AVX2/AVX-512 not available");
        return;
    }

    let block_size = 40;
    let table: Arc<Vec<f32>> = Arc::new((0..8 * block_size).map(|i| (i / block_size) as f32).collect());
    let barrier = Arc::new(Barrier::new(32));

    let handles: Vec<_> = (0..32)
        .map(|t| {
            let spmdm = Arc::clone(&spmdm);
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let row = (t % 8) as i64;
                let mut out = vec![0.0f32; block_size];
                barrier.wait();
                spmdm
                    .run(block_size, &table, &[row, row], &[2], None, &PoolingOptions::default(), &mut out)
                    .unwrap();
                assert!(out.iter().all(|&v| v == 2.0 * row as f32), "thread {t}");
                spmdm.kernel(block_size, false, &PoolingOptions::default()).unwrap()
            })
        })
        .collect();

    let kernels: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(spmdm.cache().compilations(), 1);
    assert!(kernels.iter().all(|k| Arc::ptr_eq(k, &kernels[0])));
}

#[test]
fn test_racing_gemm_tiles() {
    let cpu = CpuFeatures::host();
    let Some(isa) = cpu.best_isa() else {
        println!("Skipping - AVX2/AVX-512 not available");
        return;
    };

    let gemm = Arc::new(GemmU8S8Acc32::for_isa(Some(isa)).unwrap());
    let p = gemm.blocking();
    let (mc, nc, kc) = (p.mr, p.nr, 32);
    let a_packed = Arc::new(pack_a(&vec![1u8; mc * kc], kc, mc, kc, p.kcb));
    let b_packed = Arc::new(pack_b(&vec![-1i8; kc * nc], nc, kc, nc, p.ncb));
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let gemm = Arc::clone(&gemm);
            let a_packed = Arc::clone(&a_packed);
            let b_packed = Arc::clone(&b_packed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut c = vec![0i32; mc * nc];
                barrier.wait();
                gemm.run(false, mc, nc, kc, &a_packed, &b_packed, &mut c, nc).unwrap();
                c
            })
        })
        .collect();

    for h in handles {
        let c = h.join().unwrap();
        assert!(c.iter().all(|&v| v == -(kc as i32)));
    }
    assert_eq!(gemm.cache().compilations(), 1);
}
