//! Kernel collaborators for the batched LoRA shrink/expand operations.
//!
//! Each variant computes the same math,
//!
//! ```text
//! shrink: out[t] += scale * x[t] @ W[g(t)]^T      W[g]: [rank, hidden]
//! expand: out[t] += x[t] @ W[g(t)]^T              W[g]: [hidden, rank]
//! ```
//!
//! but reads weights and routing through a different layout (see
//! [`crate::layout`]). Kernels mutate `out` in place, so callers own
//! initialization of the output buffer.

mod accumulate;
mod indexed;
mod packed;
mod segmented;

use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::problem::OpType;

pub use accumulate::{accumulate_into, inplace_copy};
pub use indexed::IndexedBgmv;
pub use packed::PackedSgmv;
pub use segmented::SegmentedBgmv;

/// Identity of a kernel variant, used to key timing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelName {
    /// Per-batch-item group ids over contiguous token segments.
    Segmented,
    /// Flat per-token group ids.
    Indexed,
    /// Packed weights with repeat boundaries.
    Packed,
}

impl KernelName {
    /// Sweep order: segmented, packed, indexed.
    pub const ALL: [KernelName; 3] = [KernelName::Segmented, KernelName::Packed, KernelName::Indexed];

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelName::Segmented => "segmented",
            KernelName::Indexed => "indexed",
            KernelName::Packed => "packed",
        }
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KernelName::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown kernel '{s}'"))
    }
}

/// A batched LoRA kernel with a fixed weight layout.
///
/// Implementations hold their layout-specific weights and routing metadata,
/// and treat them as read-only.
pub trait LoraKernel {
    fn name(&self) -> KernelName;

    /// `out += scale * x @ W^T` for every token's group.
    fn shrink(&self, out: &Tensor, inputs: &Tensor, scale: f64) -> Result<()>;

    /// `out = (add_inputs ? out : 0) + x @ W^T` for every token's group.
    fn expand(&self, out: &Tensor, inputs: &Tensor, add_inputs: bool) -> Result<()>;

    /// Dispatch on the operation type. Expand always accumulates.
    fn launch(&self, op: OpType, out: &Tensor, inputs: &Tensor, scale: f64) -> Result<()> {
        match op {
            OpType::Shrink => self.shrink(out, inputs, scale),
            OpType::Expand => self.expand(out, inputs, true),
        }
    }
}

/// `rows @ weight^T` in F32, for one group's block.
pub(crate) fn project_rows(rows: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let rows = rows.to_dtype(candle_core::DType::F32)?;
    let weight = weight.to_dtype(candle_core::DType::F32)?;
    rows.matmul(&weight.t()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_name_round_trip() {
        for name in KernelName::ALL {
            assert_eq!(name.as_str().parse::<KernelName>().unwrap(), name);
        }
        assert!("cublas".parse::<KernelName>().is_err());
    }

    #[test]
    fn test_kernel_name_serde() {
        let json = serde_json::to_string(&KernelName::Packed).unwrap();
        assert_eq!(json, "\"packed\"");
    }
}
