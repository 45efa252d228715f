//! Synthetic problem instances for the shrink/expand kernels.
//!
//! A [`ProblemInstance`] holds everything one benchmark combination needs:
//! token inputs, the per-group weight tensor in the shared row-major layout,
//! two output buffers and the group routing metadata. Every kernel variant is
//! fed from the same instance so their outputs stay comparable.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which half of the LoRA computation a kernel call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    /// `[tokens, hidden] -> [tokens, rank]`, output accumulated from zero.
    Shrink,
    /// `[tokens, rank] -> [tokens, hidden]`, accumulated into existing output.
    Expand,
}

impl OpType {
    pub const ALL: [OpType; 2] = [OpType::Shrink, OpType::Expand];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Shrink => "shrink",
            OpType::Expand => "expand",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shrink" => Ok(OpType::Shrink),
            "expand" => Ok(OpType::Expand),
            other => Err(format!("unknown op type '{other}' (expected shrink or expand)")),
        }
    }
}

/// Errors raised while generating a problem instance.
#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("batch_count must be >= 1 (remap 0 to 1 before generating)")]
    EmptyBatch,
    #[error("{0} must be >= 1")]
    ZeroDimension(&'static str),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Shape parameters of one batched problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemSpec {
    pub batch_count: usize,
    pub hidden_size: usize,
    pub group_count: usize,
    pub rank: usize,
    pub seq_len: usize,
    pub dtype: DType,
    pub op_type: OpType,
}

impl ProblemSpec {
    /// Number of tokens across all batch items.
    pub fn total_tokens(&self) -> usize {
        self.batch_count * self.seq_len
    }

    /// Width of the token input rows.
    pub fn input_width(&self) -> usize {
        match self.op_type {
            OpType::Shrink => self.hidden_size,
            OpType::Expand => self.rank,
        }
    }

    /// Width of the output rows.
    pub fn output_width(&self) -> usize {
        match self.op_type {
            OpType::Shrink => self.rank,
            OpType::Expand => self.hidden_size,
        }
    }

    fn validate(&self) -> Result<(), ProblemError> {
        if self.batch_count == 0 {
            return Err(ProblemError::EmptyBatch);
        }
        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("group_count", self.group_count),
            ("rank", self.rank),
            ("seq_len", self.seq_len),
        ] {
            if value == 0 {
                return Err(ProblemError::ZeroDimension(name));
            }
        }
        Ok(())
    }
}

/// A generated problem, shared read-only by every kernel variant.
#[derive(Debug)]
pub struct ProblemInstance {
    pub spec: ProblemSpec,
    /// Token inputs `[total_tokens, input_width]`.
    pub inputs: Tensor,
    /// Shrink: `[groups, rank, hidden]`. Expand: `[groups, hidden, rank]`.
    pub weights: Tensor,
    /// Working output buffer. F32 for shrink, input dtype for expand.
    pub working_out: Tensor,
    /// Reference output buffer in the input dtype.
    pub reference_out: Tensor,
    /// Start offset of each batch item's token span.
    pub seq_starts: Vec<usize>,
    /// Number of tokens in each batch item.
    pub seq_lens: Vec<usize>,
    /// Group id assigned to each batch item.
    pub group_per_batch: Vec<u32>,
    /// Group id of every token (the per-batch id broadcast over its span).
    pub group_per_token: Vec<u32>,
    /// Initial output content: zeros for shrink, shared random values for expand.
    initial_out: Tensor,
}

impl ProblemInstance {
    /// Fresh output buffer with the instance's initial content, in `dtype`.
    ///
    /// Always a deep copy, so in-place kernels never see another buffer's
    /// accumulated values.
    pub fn fresh_output(&self, dtype: DType) -> Result<Tensor, ProblemError> {
        match self.spec.op_type {
            OpType::Shrink => Ok(Tensor::zeros(
                self.initial_out.shape(),
                dtype,
                self.initial_out.device(),
            )?),
            OpType::Expand => Ok(self.initial_out.to_dtype(dtype)?.copy()?),
        }
    }

    pub fn device(&self) -> &Device {
        self.inputs.device()
    }
}

/// Uniform `[0, 1)` tensor built on the host from `rng`, then moved to `device`.
fn uniform_tensor(
    rng: &mut StdRng,
    dims: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<Tensor, ProblemError> {
    let numel: usize = dims.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.gen::<f32>()).collect();
    let tensor = Tensor::from_vec(values, dims, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?;
    Ok(tensor)
}

/// Draw one group id per batch item.
///
/// The top id is left out when more than one group exists, so with enough
/// batch items at least one group is shared by several of them.
pub fn draw_group_ids(rng: &mut StdRng, batch_count: usize, group_count: usize) -> Vec<u32> {
    let upper = if group_count > 1 { group_count - 1 } else { 1 };
    (0..batch_count)
        .map(|_| rng.gen_range(0..upper) as u32)
        .collect()
}

/// Broadcast per-batch group ids over each item's token span.
pub fn broadcast_to_tokens(group_per_batch: &[u32], seq_lens: &[usize]) -> Vec<u32> {
    group_per_batch
        .iter()
        .zip(seq_lens)
        .flat_map(|(&group, &len)| std::iter::repeat(group).take(len))
        .collect()
}

/// Exclusive prefix sum of sequence lengths.
pub fn seq_starts(seq_lens: &[usize]) -> Vec<usize> {
    seq_lens
        .iter()
        .scan(0usize, |offset, &len| {
            let start = *offset;
            *offset += len;
            Some(start)
        })
        .collect()
}

/// Generate a random problem instance on `device`.
///
/// Draw order is fixed (inputs, weights, expand output, group ids) so a given
/// seed always yields the same instance.
pub fn generate(
    spec: &ProblemSpec,
    device: &Device,
    rng: &mut StdRng,
) -> Result<ProblemInstance, ProblemError> {
    spec.validate()?;

    let seq_lens = vec![spec.seq_len; spec.batch_count];
    let seq_starts = seq_starts(&seq_lens);
    let total_tokens = spec.total_tokens();

    let (inputs, weights, working_out, reference_out, initial_out) = match spec.op_type {
        OpType::Shrink => {
            let inputs = uniform_tensor(rng, &[total_tokens, spec.hidden_size], spec.dtype, device)?;
            let weights = uniform_tensor(
                rng,
                &[spec.group_count, spec.rank, spec.hidden_size],
                spec.dtype,
                device,
            )?;
            let reference_out = Tensor::zeros((total_tokens, spec.rank), spec.dtype, device)?;
            // Shrink kernels accumulate into an F32 buffer.
            let working_out = Tensor::zeros((total_tokens, spec.rank), DType::F32, device)?;
            let initial_out = Tensor::zeros((total_tokens, spec.rank), spec.dtype, device)?;
            (inputs, weights, working_out, reference_out, initial_out)
        }
        OpType::Expand => {
            let inputs = uniform_tensor(rng, &[total_tokens, spec.rank], spec.dtype, device)?;
            let weights = uniform_tensor(
                rng,
                &[spec.group_count, spec.hidden_size, spec.rank],
                spec.dtype,
                device,
            )?;
            let initial_out =
                uniform_tensor(rng, &[total_tokens, spec.hidden_size], spec.dtype, device)?;
            let reference_out = initial_out.copy()?;
            let working_out = initial_out.copy()?;
            (inputs, weights, working_out, reference_out, initial_out)
        }
    };

    let group_per_batch = draw_group_ids(rng, spec.batch_count, spec.group_count);
    let group_per_token = broadcast_to_tokens(&group_per_batch, &seq_lens);

    tracing::debug!(
        op = %spec.op_type,
        batch_count = spec.batch_count,
        hidden_size = spec.hidden_size,
        total_tokens,
        dtype = spec.dtype.as_str(),
        "generated problem instance"
    );

    Ok(ProblemInstance {
        spec: *spec,
        inputs,
        weights,
        working_out,
        reference_out,
        seq_starts,
        seq_lens,
        group_per_batch,
        group_per_token,
        initial_out,
    })
}
