//! Criterion benchmarks for the three LoRA kernel variants.
//!
//! Runs shrink and expand on CPU for a few hidden sizes, batch 8, 8 adapters,
//! rank 16, one token per batch item. Also covers layout construction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device};
use lora_bench_core::kernels::{IndexedBgmv, LoraKernel, PackedSgmv, SegmentedBgmv};
use lora_bench_core::layout::KernelLayouts;
use lora_bench_core::problem::{generate, OpType, ProblemInstance, ProblemSpec};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn instance(hidden_size: usize, op_type: OpType) -> ProblemInstance {
    let spec = ProblemSpec {
        batch_count: 8,
        hidden_size,
        group_count: 8,
        rank: 16,
        seq_len: 1,
        dtype: DType::F32,
        op_type,
    };
    generate(&spec, &Device::Cpu, &mut StdRng::seed_from_u64(0)).expect("generate failed")
}

fn kernels(instance: &ProblemInstance) -> Vec<Box<dyn LoraKernel>> {
    let layouts = KernelLayouts::build(instance).expect("layout build failed");
    vec![
        Box::new(SegmentedBgmv::new(layouts.segmented).expect("segmented kernel")),
        Box::new(PackedSgmv::new(layouts.packed).expect("packed kernel")),
        Box::new(IndexedBgmv::new(layouts.token_indexed)),
    ]
}

// ---------------------------------------------------------------------------
// Kernel launches
// ---------------------------------------------------------------------------

fn bench_op(c: &mut Criterion, op_type: OpType) {
    let mut group = c.benchmark_group(format!("bgmv_{op_type}"));

    for &hidden_size in &[128, 1024, 4096] {
        let instance = instance(hidden_size, op_type);
        for kernel in kernels(&instance) {
            let out = instance
                .fresh_output(instance.working_out.dtype())
                .expect("output buffer");
            group.bench_with_input(
                BenchmarkId::new(kernel.name().as_str(), hidden_size),
                &hidden_size,
                |b, _| {
                    b.iter(|| {
                        kernel
                            .launch(op_type, &out, black_box(&instance.inputs), 1.0)
                            .expect("launch failed")
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_shrink(c: &mut Criterion) {
    bench_op(c, OpType::Shrink);
}

fn bench_expand(c: &mut Criterion) {
    bench_op(c, OpType::Expand);
}

// ---------------------------------------------------------------------------
// Layout construction
// ---------------------------------------------------------------------------

fn bench_layout_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_build");

    for &hidden_size in &[128, 4096] {
        let instance = instance(hidden_size, OpType::Shrink);
        group.bench_with_input(
            BenchmarkId::new("hidden", hidden_size),
            &hidden_size,
            |b, _| {
                b.iter(|| KernelLayouts::build(black_box(&instance)).expect("layout build failed"));
            },
        );
    }
    group.finish();
}

criterion_group!(kernel_benches, bench_shrink, bench_expand);
criterion_group!(layout_benches, bench_layout_build);
criterion_main!(kernel_benches, layout_benches);
