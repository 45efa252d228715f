//! Integration tests for the sweep pipeline.
//!
//! Generation, layouts, all three kernels, the checker, the record document
//! and the plots, wired together the way the sweep driver runs them. All
//! tests are CPU-only and use small problem sizes.

use candle_core::{DType, Device, Tensor};
use lora_bench_core::{
    check::{assert_close, CheckError, Precision},
    kernels::{inplace_copy, IndexedBgmv, KernelName, LoraKernel, PackedSgmv, SegmentedBgmv},
    layout::KernelLayouts,
    problem::{generate, OpType, ProblemError, ProblemInstance, ProblemSpec},
    record::{RecordKey, RecordStore},
    report::{plot_file_name, Reporter},
    sweep::{SweepConfig, SweepDriver, SweepPoint},
    timing::TimingConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn spec(hidden_size: usize, dtype: DType, op_type: OpType) -> ProblemSpec {
    ProblemSpec {
        batch_count: 8,
        hidden_size,
        group_count: 8,
        rank: 16,
        seq_len: 1,
        dtype,
        op_type,
    }
}

/// Run every kernel once on a fresh buffer; outputs in `KernelName::ALL` order.
fn run_all(instance: &ProblemInstance, scale: f64) -> Vec<(KernelName, Tensor)> {
    let layouts = KernelLayouts::build(instance).unwrap();
    let kernels: Vec<Box<dyn LoraKernel>> = vec![
        Box::new(SegmentedBgmv::new(layouts.segmented).unwrap()),
        Box::new(PackedSgmv::new(layouts.packed).unwrap()),
        Box::new(IndexedBgmv::new(layouts.token_indexed)),
    ];
    kernels
        .iter()
        .map(|kernel| {
            let dtype = match kernel.name() {
                KernelName::Indexed => instance.reference_out.dtype(),
                _ => instance.working_out.dtype(),
            };
            let out = instance.fresh_output(dtype).unwrap();
            kernel
                .launch(instance.spec.op_type, &out, &instance.inputs, scale)
                .unwrap();
            (kernel.name(), out)
        })
        .collect()
}

fn cpu_config() -> SweepConfig {
    SweepConfig {
        hidden_sizes: vec![128, 3424, 256],
        batch_counts: vec![0, 8],
        devices: vec!["cpu".to_string()],
        timing: TimingConfig {
            capture_size: 2,
            replays: 2,
        },
        ..SweepConfig::default()
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn shrink_f16_scenario_shapes_and_agreement() {
    let instance = generate(
        &spec(128, DType::F16, OpType::Shrink),
        &Device::Cpu,
        &mut StdRng::seed_from_u64(0),
    )
    .unwrap();

    let outputs = run_all(&instance, 1.0);
    for (name, out) in &outputs {
        assert_eq!(out.dims(), &[8, 16], "{name}");
    }

    let segmented = &outputs[0].1;
    for (name, out) in &outputs[1..] {
        assert_close(segmented, out).unwrap_or_else(|e| panic!("{name}: {e}"));
    }
}

#[test]
fn all_variants_agree_across_dtypes_and_ops() {
    for dtype in [DType::F16, DType::BF16, DType::F32] {
        for op in OpType::ALL {
            let instance = generate(
                &spec(512, dtype, op),
                &Device::Cpu,
                &mut StdRng::seed_from_u64(11),
            )
            .unwrap();
            let outputs = run_all(&instance, 0.5);
            for (name, out) in &outputs[1..] {
                assert_close(&outputs[0].1, out)
                    .unwrap_or_else(|e| panic!("{dtype:?} {op} {name}: {e}"));
            }
        }
    }
}

#[test]
fn expand_accumulates_onto_shared_initial_output() {
    let instance = generate(
        &spec(64, DType::F32, OpType::Expand),
        &Device::Cpu,
        &mut StdRng::seed_from_u64(5),
    )
    .unwrap();
    let initial = instance.fresh_output(DType::F32).unwrap();

    let outputs = run_all(&instance, 1.0);
    let (_, segmented) = &outputs[0];

    // Inputs and weights are non-negative, so accumulation never decreases.
    let diff = (segmented - &initial)
        .unwrap()
        .flatten_all()
        .unwrap()
        .min(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff >= 0.0);
}

#[test]
fn checker_reports_perturbed_output() {
    let instance = generate(
        &spec(128, DType::F16, OpType::Shrink),
        &Device::Cpu,
        &mut StdRng::seed_from_u64(1),
    )
    .unwrap();
    let outputs = run_all(&instance, 1.0);
    let (_, indexed) = &outputs[2];

    let bumped = (indexed.to_dtype(DType::F32).unwrap() + 10.0)
        .unwrap()
        .to_dtype(DType::F16)
        .unwrap();
    let wrong = indexed.copy().unwrap();
    inplace_copy(&wrong, &bumped).unwrap();

    match assert_close(&wrong, indexed) {
        Err(CheckError::Mismatch(report)) => {
            assert_eq!(report.precision, Precision::Half);
            assert_eq!(report.mismatched, report.total);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn group_ids_span_several_groups() {
    let s = ProblemSpec {
        batch_count: 56,
        ..spec(128, DType::F16, OpType::Shrink)
    };
    let instance = generate(&s, &Device::Cpu, &mut StdRng::seed_from_u64(0)).unwrap();

    let mut groups = instance.group_per_batch.clone();
    groups.sort_unstable();
    groups.dedup();
    assert!(groups.len() >= 2, "groups: {groups:?}");
    assert!(groups.iter().all(|&g| g < 7));
    assert_eq!(instance.group_per_token.len(), 56);
}

#[test]
fn zero_batch_rejected_by_generator() {
    let s = ProblemSpec {
        batch_count: 0,
        ..spec(128, DType::F16, OpType::Shrink)
    };
    let err = generate(&s, &Device::Cpu, &mut StdRng::seed_from_u64(0)).unwrap_err();
    assert!(matches!(err, ProblemError::EmptyBatch));
}

#[test]
fn zero_batch_runs_as_one() {
    let mut store = RecordStore::new();
    let mut driver = SweepDriver::new(cpu_config(), &mut store).unwrap();
    let point = SweepPoint {
        hidden_size: 128,
        batch_count: 0,
        scale: 1.0,
        dtype: Precision::Half,
        op_type: OpType::Shrink,
        seed: 0,
        device: "cpu".to_string(),
    };
    assert!(driver.run_point(&point).unwrap().is_some());

    for kernel in KernelName::ALL {
        let records = store.records(RecordKey::new(kernel, OpType::Shrink));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].batch_count, 1);
    }
}

#[test]
fn hidden_3424_always_skipped() {
    let config = SweepConfig {
        hidden_sizes: vec![3424],
        dtypes: Precision::ALL.to_vec(),
        excluded_dtypes: vec![],
        ..cpu_config()
    };
    let mut store = RecordStore::new();
    let summary = SweepDriver::new(config, &mut store).unwrap().run().unwrap();

    assert_eq!(summary.measured, 0);
    assert_eq!(summary.skipped, summary.combinations);
    assert!(store.is_empty());
}

// ─── End to end ──────────────────────────────────────────────────────────────

#[test]
fn sweep_writes_records_and_plots() {
    let dir = TempDir::new().unwrap();
    let record_path = dir.path().join("records.json");

    let config = cpu_config();
    let mut store = RecordStore::new();
    let summary = SweepDriver::new(config.clone(), &mut store)
        .unwrap()
        .with_record_path(&record_path)
        .run()
        .unwrap();
    // 3 hidden sizes × 2 batches × 2 ops, one hidden size excluded.
    assert_eq!(summary.combinations, 12);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.measured, 8);

    let loaded = RecordStore::load(&record_path).unwrap();
    assert_eq!(loaded.len(), store.len());
    for key in RecordKey::all() {
        assert_eq!(loaded.records(key).len(), 4, "{key}");
    }
    let hidden: Vec<usize> = loaded
        .records(RecordKey::new(KernelName::Packed, OpType::Expand))
        .iter()
        .map(|r| r.hidden_size)
        .collect();
    // Sweep order: hidden size outermost, batch next.
    assert_eq!(hidden, vec![128, 128, 256, 256]);

    let plots = Reporter::new(dir.path().join("plots"), config.rank, config.seq_len)
        .plot_all(&loaded, &config.batch_counts, &config.op_types)
        .unwrap();
    assert_eq!(plots.len(), 4);
    for (batch, op) in [(1, OpType::Shrink), (8, OpType::Expand)] {
        assert!(dir.path().join("plots").join(plot_file_name(batch, op)).exists());
    }
}
