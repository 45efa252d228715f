//! Re-layout of the shared weight tensor into each kernel's contract.
//!
//! All three layouts are pure copies or views of the instance's weights and
//! routing metadata. Nothing here recomputes values, so outputs computed from
//! any layout must agree with the shared-layout math.
//!
//! # Layouts
//!
//! - Token-indexed: weights `[groups, 1, out, in]`, one i64 group id per token.
//! - Segmented: weights `[groups, out, in]`, one group id per batch item plus
//!   each item's token span.
//! - Packed: weights `[batch_items, 1, out, in]` holding the assigned group's
//!   block for every batch item in batch order (duplicates kept), plus unique
//!   indices, repeat boundaries and per-token ranks.

use candle_core::{IndexOp, Result, Tensor};

use crate::problem::ProblemInstance;

/// Flat per-token routing.
#[derive(Debug, Clone)]
pub struct TokenIndexedLayout {
    /// `[groups, 1, out, in]`
    pub weights: Tensor,
    /// `[total_tokens]` i64 group ids.
    pub token_indices: Tensor,
}

impl TokenIndexedLayout {
    pub fn from_instance(instance: &ProblemInstance) -> Result<Self> {
        let ids: Vec<i64> = instance.group_per_token.iter().map(|&g| g as i64).collect();
        Ok(Self {
            weights: instance.weights.unsqueeze(1)?,
            token_indices: Tensor::new(ids.as_slice(), instance.device())?,
        })
    }
}

/// One group per batch item, each item spanning a contiguous run of tokens.
#[derive(Debug, Clone)]
pub struct SegmentedLayout {
    /// `[groups, out, in]`, shared with the instance.
    pub weights: Tensor,
    /// `[batch_count]` u32 group ids.
    pub group_indices: Tensor,
    pub seq_starts: Vec<usize>,
    pub seq_lens: Vec<usize>,
}

impl SegmentedLayout {
    pub fn from_instance(instance: &ProblemInstance) -> Result<Self> {
        Ok(Self {
            weights: instance.weights.clone(),
            group_indices: Tensor::new(instance.group_per_batch.as_slice(), instance.device())?,
            seq_starts: instance.seq_starts.clone(),
            seq_lens: instance.seq_lens.clone(),
        })
    }
}

/// Only the referenced groups, in batch order, with repeat boundaries.
#[derive(Debug, Clone)]
pub struct PackedLayout {
    /// `[num_unique, 1, out, in]`
    pub weights: Tensor,
    /// `[num_tokens]` u32, the adapter rank of every token.
    pub ranks: Tensor,
    /// `[num_unique]` u32, position of each packed block.
    pub unique_indices: Tensor,
    /// `[num_unique + 1]` u32 token boundaries: `[0, r, 2r, ...]`.
    pub repeats: Tensor,
    /// Tokens handled by each packed block.
    pub repeats_per_group: usize,
    /// Token count rounded up to a multiple of `repeats_per_group`.
    pub num_tokens: usize,
}

impl PackedLayout {
    pub fn from_instance(instance: &ProblemInstance) -> Result<Self> {
        let spec = &instance.spec;
        let device = instance.device();
        let repeats_per_group = spec.seq_len;
        let num_tokens = (spec.batch_count * spec.seq_len).div_ceil(repeats_per_group)
            * repeats_per_group;
        let num_unique = num_tokens / repeats_per_group;

        let unique: Vec<u32> = (0..num_unique as u32).collect();
        let repeats = repeat_boundaries(num_unique, repeats_per_group);
        let ranks = vec![spec.rank as u32; num_tokens];

        Ok(Self {
            weights: pack_weights(&instance.weights, &instance.group_per_batch)?,
            ranks: Tensor::new(ranks.as_slice(), device)?,
            unique_indices: Tensor::new(unique.as_slice(), device)?,
            repeats: Tensor::new(repeats.as_slice(), device)?,
            repeats_per_group,
            num_tokens,
        })
    }
}

/// All three layouts for one instance.
#[derive(Debug, Clone)]
pub struct KernelLayouts {
    pub token_indexed: TokenIndexedLayout,
    pub segmented: SegmentedLayout,
    pub packed: PackedLayout,
}

impl KernelLayouts {
    pub fn build(instance: &ProblemInstance) -> Result<Self> {
        Ok(Self {
            token_indexed: TokenIndexedLayout::from_instance(instance)?,
            segmented: SegmentedLayout::from_instance(instance)?,
            packed: PackedLayout::from_instance(instance)?,
        })
    }
}

/// Token boundaries `[0, r, 2r, ..., n*r]` for `n` blocks of `r` tokens.
pub fn repeat_boundaries(num_unique: usize, repeats_per_group: usize) -> Vec<u32> {
    (0..=num_unique)
        .map(|i| (i * repeats_per_group) as u32)
        .collect()
}

/// Gather each batch item's weight block in batch order: `[batch, 1, out, in]`.
///
/// Blocks are not deduplicated; two items routed to the same group each get
/// their own copy.
pub fn pack_weights(weights: &Tensor, group_per_batch: &[u32]) -> Result<Tensor> {
    let blocks = group_per_batch
        .iter()
        .map(|&group| weights.i(group as usize)?.unsqueeze(0))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&blocks, 0)
}

/// Inverse of [`pack_weights`] at token granularity: `[tokens, out, in]`.
///
/// Token `t` of batch item `b` receives packed block `b`.
pub fn unpack_per_token(packed: &Tensor, seq_lens: &[usize]) -> Result<Tensor> {
    let token_to_block: Vec<u32> = seq_lens
        .iter()
        .enumerate()
        .flat_map(|(block, &len)| std::iter::repeat(block as u32).take(len))
        .collect();
    let index = Tensor::new(token_to_block.as_slice(), packed.device())?;
    packed.squeeze(1)?.index_select(&index, 0)
}

/// Per-token weight selection in the shared layout: `[tokens, out, in]`.
pub fn select_per_token(weights: &Tensor, group_per_token: &[u32]) -> Result<Tensor> {
    let index = Tensor::new(group_per_token, weights.device())?;
    weights.index_select(&index, 0)
}
