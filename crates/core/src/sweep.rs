//! Parameter sweep over kernel problem sizes.
//!
//! The driver enumerates `hidden_size × batch_count × scale × dtype × op_type
//! × seed × device`, skips excluded combinations, and for every remaining one
//! times the three kernel variants, persists their records, then checks their
//! outputs against each other.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::{assert_close, CheckError, Precision};
use crate::kernels::{IndexedBgmv, KernelName, LoraKernel, PackedSgmv, SegmentedBgmv};
use crate::layout::KernelLayouts;
use crate::problem::{self, OpType, ProblemError, ProblemInstance, ProblemSpec};
use crate::record::{RecordError, RecordKey, RecordStore, TimingRecord};
use crate::timing::{Measurement, TimingConfig, TimingError, TimingHarness};

/// Default hidden sizes, 128 through 128256.
pub const DEFAULT_HIDDEN_SIZES: [usize; 49] = [
    128, 256, 512, 1024, 1152, 1280, 1536, 2048, 2304, 2560, 2752, 3072, 3424, 3456, 3584, 4096,
    4608, 5120, 5504, 5632, 6144, 6848, 6912, 7168, 8192, 9216, 10240, 11008, 13824, 14336, 15360,
    22016, 24576, 27392, 27648, 32000, 32256, 32512, 32768, 33024, 36864, 43264, 49152, 64000,
    64256, 102400, 102656, 128000, 128256,
];

/// Default batch counts. 0 runs as 1.
pub const DEFAULT_BATCH_COUNTS: [usize; 8] = [0, 8, 16, 24, 32, 40, 48, 56];

/// Adapter counts the kernels are built for.
pub const GROUP_COUNT_CANDIDATES: [usize; 8] = [1, 4, 8, 16, 32, 64, 128, 256];

/// Adapter ranks the kernels are built for.
pub const RANK_CANDIDATES: [usize; 7] = [1, 4, 8, 16, 32, 64, 128];

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep config: {0}")]
    InvalidConfig(String),
    #[error("unknown device '{0}' (expected cpu, cuda or cuda:N)")]
    UnknownDevice(String),
    #[error(transparent)]
    Problem(#[from] ProblemError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error("{kernel} disagrees with {reference}: {source}")]
    Check {
        kernel: KernelName,
        reference: KernelName,
        #[source]
        source: CheckError,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub hidden_sizes: Vec<usize>,
    pub batch_counts: Vec<usize>,
    pub scales: Vec<f64>,
    pub dtypes: Vec<Precision>,
    pub op_types: Vec<OpType>,
    pub seeds: Vec<u64>,
    pub devices: Vec<String>,
    pub group_count: usize,
    pub rank: usize,
    pub seq_len: usize,
    pub excluded_hidden_sizes: Vec<usize>,
    pub excluded_dtypes: Vec<Precision>,
    pub timing: TimingConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: DEFAULT_HIDDEN_SIZES.to_vec(),
            batch_counts: DEFAULT_BATCH_COUNTS.to_vec(),
            scales: vec![1.0],
            dtypes: vec![Precision::Half],
            op_types: OpType::ALL.to_vec(),
            seeds: vec![0],
            devices: vec!["cuda:0".to_string()],
            group_count: 8,
            rank: 16,
            seq_len: 1,
            // No kernel build for this width, nor for F32.
            excluded_hidden_sizes: vec![3424],
            excluded_dtypes: vec![Precision::Single],
            timing: TimingConfig::default(),
        }
    }
}

/// One combination of the Cartesian product.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub hidden_size: usize,
    /// As listed in the config; may be 0.
    pub batch_count: usize,
    pub scale: f64,
    pub dtype: Precision,
    pub op_type: OpType,
    pub seed: u64,
    pub device: String,
}

impl SweepPoint {
    /// Batch count the problem is generated with.
    pub fn effective_batch_count(&self) -> usize {
        self.batch_count.max(1)
    }
}

/// Counts reported at the end of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub combinations: usize,
    pub skipped: usize,
    pub measured: usize,
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        let lists = [
            ("hidden_sizes", self.hidden_sizes.is_empty()),
            ("batch_counts", self.batch_counts.is_empty()),
            ("scales", self.scales.is_empty()),
            ("dtypes", self.dtypes.is_empty()),
            ("op_types", self.op_types.is_empty()),
            ("seeds", self.seeds.is_empty()),
            ("devices", self.devices.is_empty()),
        ];
        if let Some((name, _)) = lists.iter().find(|(_, empty)| *empty) {
            return Err(SweepError::InvalidConfig(format!("{name} must not be empty")));
        }
        for (name, value) in [
            ("group_count", self.group_count),
            ("rank", self.rank),
            ("seq_len", self.seq_len),
        ] {
            if value == 0 {
                return Err(SweepError::InvalidConfig(format!("{name} must be >= 1")));
            }
        }
        if let Some(&h) = self.hidden_sizes.iter().find(|&&h| h == 0) {
            return Err(SweepError::InvalidConfig(format!("hidden size {h} must be >= 1")));
        }
        self.timing.validate()?;

        if !GROUP_COUNT_CANDIDATES.contains(&self.group_count) {
            tracing::warn!(group_count = self.group_count, "group count outside the usual candidates");
        }
        if !RANK_CANDIDATES.contains(&self.rank) {
            tracing::warn!(rank = self.rank, "rank outside the usual candidates");
        }
        Ok(())
    }

    /// Total size of the Cartesian product, excluded points included.
    pub fn combination_count(&self) -> usize {
        self.hidden_sizes.len()
            * self.batch_counts.len()
            * self.scales.len()
            * self.dtypes.len()
            * self.op_types.len()
            * self.seeds.len()
            * self.devices.len()
    }

    /// Every combination in sweep order (hidden size outermost, device innermost).
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        self.hidden_sizes.iter().flat_map(move |&hidden_size| {
            self.batch_counts.iter().flat_map(move |&batch_count| {
                self.scales.iter().flat_map(move |&scale| {
                    self.dtypes.iter().flat_map(move |&dtype| {
                        self.op_types.iter().flat_map(move |&op_type| {
                            self.seeds.iter().flat_map(move |&seed| {
                                self.devices.iter().map(move |device| SweepPoint {
                                    hidden_size,
                                    batch_count,
                                    scale,
                                    dtype,
                                    op_type,
                                    seed,
                                    device: device.clone(),
                                })
                            })
                        })
                    })
                })
            })
        })
    }

    /// Why `point` is skipped, if it is.
    pub fn exclusion(&self, point: &SweepPoint) -> Option<&'static str> {
        if self.excluded_hidden_sizes.contains(&point.hidden_size) {
            Some("excluded hidden size")
        } else if self.excluded_dtypes.contains(&point.dtype) {
            Some("excluded dtype")
        } else {
            None
        }
    }

    fn problem_spec(&self, point: &SweepPoint) -> ProblemSpec {
        ProblemSpec {
            batch_count: point.effective_batch_count(),
            hidden_size: point.hidden_size,
            group_count: self.group_count,
            rank: self.rank,
            seq_len: self.seq_len,
            dtype: point.dtype.dtype(),
            op_type: point.op_type,
        }
    }
}

/// Parse a device name: `cpu`, `cuda` or `cuda:N`.
///
/// CUDA names fall back to the CPU when no CUDA device is available.
pub fn resolve_device(name: &str) -> Result<Device, SweepError> {
    let lower = name.trim().to_ascii_lowercase();
    let ordinal = match lower.as_str() {
        "cpu" => return Ok(Device::Cpu),
        "cuda" => 0,
        other => other
            .strip_prefix("cuda:")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| SweepError::UnknownDevice(name.to_string()))?,
    };
    let device = Device::cuda_if_available(ordinal)?;
    if !device.is_cuda() {
        tracing::warn!(device = name, "CUDA unavailable, falling back to CPU");
    }
    Ok(device)
}

/// Timings of one measured combination, in sweep kernel order.
#[derive(Debug, Clone)]
pub struct PointTimings {
    pub timings: Vec<(KernelName, Measurement)>,
}

struct Kernels {
    segmented: SegmentedBgmv,
    indexed: IndexedBgmv,
    packed: PackedSgmv,
}

impl Kernels {
    fn new(layouts: KernelLayouts) -> candle_core::Result<Self> {
        Ok(Self {
            segmented: SegmentedBgmv::new(layouts.segmented)?,
            indexed: IndexedBgmv::new(layouts.token_indexed),
            packed: PackedSgmv::new(layouts.packed)?,
        })
    }

    fn get(&self, name: KernelName) -> &dyn LoraKernel {
        match name {
            KernelName::Segmented => &self.segmented,
            KernelName::Indexed => &self.indexed,
            KernelName::Packed => &self.packed,
        }
    }
}

/// A new output buffer for `kernel`, holding the instance's initial content.
/// The indexed kernel writes in the input dtype; the others in the working
/// dtype.
fn output_buffer(instance: &ProblemInstance, kernel: KernelName) -> Result<Tensor, SweepError> {
    let dtype = match kernel {
        KernelName::Indexed => instance.reference_out.dtype(),
        KernelName::Segmented | KernelName::Packed => instance.working_out.dtype(),
    };
    Ok(instance.fresh_output(dtype)?)
}

/// One buffer per kernel, all allocated before any kernel runs.
fn output_buffers(instance: &ProblemInstance) -> Result<Vec<(KernelName, Tensor)>, SweepError> {
    KernelName::ALL
        .into_iter()
        .map(|name| Ok((name, output_buffer(instance, name)?)))
        .collect()
}

/// Runs a sweep, appending to a caller-owned [`RecordStore`].
pub struct SweepDriver<'a> {
    config: SweepConfig,
    store: &'a mut RecordStore,
    record_path: Option<PathBuf>,
    devices: HashMap<String, Device>,
}

impl<'a> SweepDriver<'a> {
    pub fn new(config: SweepConfig, store: &'a mut RecordStore) -> Result<Self, SweepError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            record_path: None,
            devices: HashMap::new(),
        })
    }

    /// Persist the record document to `path` after every measured combination.
    pub fn with_record_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run every combination, stopping at the first error.
    pub fn run(&mut self) -> Result<SweepSummary, SweepError> {
        let points: Vec<SweepPoint> = self.config.points().collect();
        let mut summary = SweepSummary {
            combinations: points.len(),
            ..SweepSummary::default()
        };
        tracing::info!(combinations = summary.combinations, "starting sweep");

        for point in &points {
            match self.run_point(point)? {
                Some(_) => summary.measured += 1,
                None => summary.skipped += 1,
            }
        }

        tracing::info!(
            combinations = summary.combinations,
            measured = summary.measured,
            skipped = summary.skipped,
            "sweep finished"
        );
        Ok(summary)
    }

    /// Time and check one combination. `None` if it is excluded.
    pub fn run_point(&mut self, point: &SweepPoint) -> Result<Option<PointTimings>, SweepError> {
        let span = tracing::info_span!(
            "combination",
            hidden_size = point.hidden_size,
            batch_count = point.batch_count,
            dtype = %point.dtype,
            op = %point.op_type,
            seed = point.seed,
            device = %point.device,
        );
        let _enter = span.enter();

        if let Some(reason) = self.config.exclusion(point) {
            tracing::debug!(reason, "skipping combination");
            return Ok(None);
        }

        let device = self.device(&point.device)?;
        let spec = self.config.problem_spec(point);
        let mut rng = StdRng::seed_from_u64(point.seed);
        let instance = problem::generate(&spec, &device, &mut rng)?;
        let kernels = Kernels::new(KernelLayouts::build(&instance)?)?;
        let harness = TimingHarness::new(device, self.config.timing)?;

        let mut timings = Vec::with_capacity(KernelName::ALL.len());
        for (name, out) in output_buffers(&instance)? {
            let kernel = kernels.get(name);
            let measurement = harness
                .measure(|| kernel.launch(point.op_type, &out, &instance.inputs, point.scale))?;
            tracing::debug!(kernel = %name, duration_ms = measurement.per_call_ms, "timed kernel");

            self.store.push(
                RecordKey::new(name, point.op_type),
                TimingRecord {
                    duration_ms: measurement.per_call_ms,
                    batch_count: spec.batch_count,
                    hidden_size: spec.hidden_size,
                    dtype: point.dtype,
                    seed: point.seed,
                },
            );
            timings.push((name, measurement));
        }
        if let Some(path) = &self.record_path {
            self.store.save(path)?;
        }

        Self::check(&instance, &kernels, point)?;
        Ok(Some(PointTimings { timings }))
    }

    /// Run each kernel once on fresh buffers and compare against the
    /// segmented output.
    fn check(
        instance: &ProblemInstance,
        kernels: &Kernels,
        point: &SweepPoint,
    ) -> Result<(), SweepError> {
        let outputs = output_buffers(instance)?;
        for (name, out) in &outputs {
            kernels
                .get(*name)
                .launch(point.op_type, out, &instance.inputs, point.scale)?;
        }

        let (actual_name, actual) = &outputs[0];
        for (name, expected) in [KernelName::Indexed, KernelName::Packed]
            .into_iter()
            .filter_map(|n| outputs.iter().find(|(k, _)| *k == n))
        {
            assert_close(actual, expected).map_err(|source| SweepError::Check {
                kernel: *actual_name,
                reference: *name,
                source,
            })?;
        }
        tracing::debug!("outputs agree");
        Ok(())
    }

    fn device(&mut self, name: &str) -> Result<Device, SweepError> {
        if let Some(device) = self.devices.get(name) {
            return Ok(device.clone());
        }
        let device = resolve_device(name)?;
        self.devices.insert(name.to_string(), device.clone());
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SweepConfig {
        SweepConfig {
            hidden_sizes: vec![128, 3424],
            batch_counts: vec![0, 8],
            op_types: OpType::ALL.to_vec(),
            devices: vec!["cpu".to_string()],
            timing: TimingConfig {
                capture_size: 2,
                replays: 1,
            },
            ..SweepConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = SweepConfig::default();
        assert_eq!(config.hidden_sizes.len(), 49);
        assert_eq!(config.hidden_sizes.first(), Some(&128));
        assert_eq!(config.hidden_sizes.last(), Some(&128256));
        assert_eq!(config.batch_counts, vec![0, 8, 16, 24, 32, 40, 48, 56]);
        assert_eq!((config.group_count, config.rank, config.seq_len), (8, 16, 1));
        assert_eq!(config.timing, TimingConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_points_nesting_order() {
        let config = small_config();
        let points: Vec<SweepPoint> = config.points().collect();
        assert_eq!(points.len(), config.combination_count());
        assert_eq!(points.len(), 2 * 2 * 2);

        let order: Vec<(usize, usize, OpType)> = points
            .iter()
            .map(|p| (p.hidden_size, p.batch_count, p.op_type))
            .collect();
        assert_eq!(
            order[..4],
            [
                (128, 0, OpType::Shrink),
                (128, 0, OpType::Expand),
                (128, 8, OpType::Shrink),
                (128, 8, OpType::Expand),
            ]
        );
    }

    #[test]
    fn test_exclusions() {
        let config = SweepConfig::default();
        let point = |hidden_size, dtype| SweepPoint {
            hidden_size,
            batch_count: 8,
            scale: 1.0,
            dtype,
            op_type: OpType::Shrink,
            seed: 0,
            device: "cpu".to_string(),
        };
        for dtype in Precision::ALL {
            assert!(config.exclusion(&point(3424, dtype)).is_some());
        }
        assert!(config.exclusion(&point(128, Precision::Single)).is_some());
        assert!(config.exclusion(&point(128, Precision::Half)).is_none());
        assert!(config.exclusion(&point(128, Precision::BFloat16)).is_none());
    }

    #[test]
    fn test_resolve_device() {
        assert!(matches!(resolve_device("cpu").unwrap(), Device::Cpu));
        assert!(matches!(resolve_device("tpu:0"), Err(SweepError::UnknownDevice(_))));
        assert!(matches!(resolve_device("cuda:x"), Err(SweepError::UnknownDevice(_))));
    }

    #[test]
    fn test_empty_list_rejected() {
        let config = SweepConfig {
            seeds: vec![],
            ..SweepConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("seeds"), "got: {err}");
    }

    #[test]
    fn test_run_skips_and_measures() {
        let mut store = RecordStore::new();
        let summary = SweepDriver::new(small_config(), &mut store)
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                combinations: 8,
                skipped: 4,
                measured: 4,
            }
        );
        for kernel in KernelName::ALL {
            for op in OpType::ALL {
                let records = store.records(RecordKey::new(kernel, op));
                let batches: Vec<usize> = records.iter().map(|r| r.batch_count).collect();
                // Batch 0 is recorded as the batch it ran with.
                assert_eq!(batches, vec![1, 8]);
                assert!(records.iter().all(|r| r.duration_ms > 0.0 && r.hidden_size == 128));
            }
        }
    }

    fn host_sum_abs(tensor: &Tensor) -> f32 {
        tensor
            .to_dtype(candle_core::DType::F32)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    fn host_values(tensor: &Tensor) -> Vec<f32> {
        tensor
            .to_dtype(candle_core::DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_every_kernel_times_from_initial_content() {
        for op_type in OpType::ALL {
            let spec = ProblemSpec {
                batch_count: 8,
                hidden_size: 128,
                group_count: 8,
                rank: 16,
                seq_len: 1,
                dtype: candle_core::DType::F16,
                op_type,
            };
            let instance =
                problem::generate(&spec, &Device::Cpu, &mut StdRng::seed_from_u64(0)).unwrap();
            let kernels = Kernels::new(KernelLayouts::build(&instance).unwrap()).unwrap();
            let harness = TimingHarness::new(
                Device::Cpu,
                TimingConfig {
                    capture_size: 10,
                    replays: 3,
                },
            )
            .unwrap();

            let buffers = output_buffers(&instance).unwrap();
            for (name, out) in &buffers {
                // Earlier kernels have accumulated into their own buffers by now.
                let initial = host_values(out);
                let fresh = instance.fresh_output(out.dtype()).unwrap();
                assert_eq!(initial, host_values(&fresh), "{name} {op_type}");
                if op_type == OpType::Shrink {
                    assert_eq!(host_sum_abs(out), 0.0, "{name} starts non-zero");
                }

                harness
                    .measure(|| kernels.get(*name).launch(op_type, out, &instance.inputs, 1.0))
                    .unwrap();
                assert!(host_sum_abs(out) > 0.0, "{name} wrote nothing");
            }
        }
    }

    #[test]
    fn test_bf16_point_passes_check() {
        let mut store = RecordStore::new();
        let mut driver = SweepDriver::new(small_config(), &mut store).unwrap();
        let point = SweepPoint {
            hidden_size: 256,
            batch_count: 4,
            scale: 0.5,
            dtype: Precision::BFloat16,
            op_type: OpType::Expand,
            seed: 7,
            device: "cpu".to_string(),
        };
        let timings = driver.run_point(&point).unwrap().unwrap();
        let order: Vec<KernelName> = timings.timings.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, KernelName::ALL.to_vec());
    }
}
