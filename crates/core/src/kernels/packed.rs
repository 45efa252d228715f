//! Packed-weight kernel with repeat boundaries.
//!
//! Block `u` of the packed weights serves tokens
//! `repeats[u]..repeats[u + 1]`. A block uses the first `ranks[t]` rows (shrink)
//! or columns (expand) of its stored weights, where `t` is any of its tokens;
//! shrink output columns past that rank receive nothing.

use candle_core::{IndexOp, Result, Tensor};

use super::{accumulate_into, project_rows, KernelName, LoraKernel};
use crate::layout::PackedLayout;
use crate::problem::OpType;

/// Dispatch entry for one packed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    index: usize,
    start: usize,
    end: usize,
    rank: usize,
}

/// SGMV over `[num_unique, 1, out, in]` packed weights.
#[derive(Debug, Clone)]
pub struct PackedSgmv {
    layout: PackedLayout,
    /// Routing metadata read back once so launches never sync the device.
    blocks: Vec<Block>,
}

impl PackedSgmv {
    pub fn new(layout: PackedLayout) -> Result<Self> {
        let unique = layout.unique_indices.to_vec1::<u32>()?;
        let repeats = layout.repeats.to_vec1::<u32>()?;
        let ranks = layout.ranks.to_vec1::<u32>()?;

        if repeats.len() != unique.len() + 1 {
            candle_core::bail!(
                "packed sgmv: {} repeat boundaries for {} blocks",
                repeats.len(),
                unique.len()
            );
        }
        if ranks.len() != layout.num_tokens {
            candle_core::bail!(
                "packed sgmv: {} ranks for {} tokens",
                ranks.len(),
                layout.num_tokens
            );
        }

        let mut blocks = Vec::with_capacity(unique.len());
        for (u, (&index, bounds)) in unique.iter().zip(repeats.windows(2)).enumerate() {
            let (start, end) = (bounds[0] as usize, bounds[1] as usize);
            if start > end || end > layout.num_tokens {
                candle_core::bail!("packed sgmv: block {u} spans invalid tokens {start}..{end}");
            }
            let block_ranks = &ranks[start..end];
            let rank = block_ranks.first().copied().unwrap_or(0) as usize;
            if block_ranks.iter().any(|&r| r as usize != rank) {
                candle_core::bail!("packed sgmv: block {u} mixes ranks {block_ranks:?}");
            }
            blocks.push(Block {
                index: index as usize,
                start,
                end,
                rank,
            });
        }
        Ok(Self { layout, blocks })
    }

    pub fn layout(&self) -> &PackedLayout {
        &self.layout
    }

    fn block_deltas(&self, inputs: &Tensor, op: OpType, scale: f64) -> Result<Tensor> {
        let (num_tokens, in_dim) = inputs.dims2()?;
        let (num_blocks, _, w_out, w_in) = self.layout.weights.dims4()?;
        if w_in != in_dim {
            candle_core::bail!("packed sgmv: input width {in_dim} != weight width {w_in}");
        }
        if self.layout.num_tokens < num_tokens {
            candle_core::bail!(
                "packed sgmv: layout covers {} of {num_tokens} tokens",
                self.layout.num_tokens
            );
        }
        let stored_rank = match op {
            OpType::Shrink => w_out,
            OpType::Expand => w_in,
        };

        let mut deltas = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            if block.index >= num_blocks {
                candle_core::bail!("packed sgmv: block {} out of range ({num_blocks})", block.index);
            }
            if block.rank == 0 || block.rank > stored_rank {
                candle_core::bail!(
                    "packed sgmv: rank {} outside 1..={stored_rank}",
                    block.rank
                );
            }
            let end = block.end.min(num_tokens);
            if block.start >= end {
                continue;
            }
            let rows = inputs.narrow(0, block.start, end - block.start)?;

            // [out, in], trimmed to the block rank on the low-rank axis.
            let weight = self.layout.weights.i((block.index, 0))?;
            let delta = match op {
                OpType::Shrink => project_rows(&rows, &weight.narrow(0, 0, block.rank)?)?
                    .pad_with_zeros(1, 0, stored_rank - block.rank)?,
                OpType::Expand => project_rows(
                    &rows.narrow(1, 0, block.rank)?,
                    &weight.narrow(1, 0, block.rank)?,
                )?,
            };
            deltas.push(delta);
        }
        let delta = Tensor::cat(&deltas, 0)?;

        if (scale - 1.0).abs() > f64::EPSILON {
            delta.affine(scale, 0.0)
        } else {
            Ok(delta)
        }
    }
}

impl LoraKernel for PackedSgmv {
    fn name(&self) -> KernelName {
        KernelName::Packed
    }

    fn shrink(&self, out: &Tensor, inputs: &Tensor, scale: f64) -> Result<()> {
        let delta = self.block_deltas(inputs, OpType::Shrink, scale)?;
        accumulate_into(out, &delta, true)
    }

    fn expand(&self, out: &Tensor, inputs: &Tensor, add_inputs: bool) -> Result<()> {
        let delta = self.block_deltas(inputs, OpType::Expand, 1.0)?;
        accumulate_into(out, &delta, add_inputs)
    }
}
