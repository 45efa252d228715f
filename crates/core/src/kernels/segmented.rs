//! Per-batch-item kernel over contiguous token segments.

use candle_core::{IndexOp, Result, Tensor};

use super::{accumulate_into, project_rows, KernelName, LoraKernel};
use crate::layout::SegmentedLayout;

/// Segmented BGMV: batch item `b` covers tokens
/// `seq_starts[b]..seq_starts[b] + seq_lens[b]` and uses group
/// `group_indices[b]`.
#[derive(Debug, Clone)]
pub struct SegmentedBgmv {
    layout: SegmentedLayout,
    /// `group_indices`, read back once so launches never sync the device.
    groups: Vec<u32>,
}

impl SegmentedBgmv {
    pub fn new(layout: SegmentedLayout) -> Result<Self> {
        let groups = layout.group_indices.to_vec1::<u32>()?;
        if groups.len() != layout.seq_starts.len() || groups.len() != layout.seq_lens.len() {
            candle_core::bail!(
                "segmented bgmv: {} group ids for {} segments",
                groups.len(),
                layout.seq_lens.len()
            );
        }
        Ok(Self { layout, groups })
    }

    pub fn layout(&self) -> &SegmentedLayout {
        &self.layout
    }

    fn segment_deltas(&self, inputs: &Tensor, scale: f64) -> Result<Tensor> {
        let (num_tokens, in_dim) = inputs.dims2()?;
        let (num_groups, _, w_in) = self.layout.weights.dims3()?;
        if w_in != in_dim {
            candle_core::bail!("segmented bgmv: input width {in_dim} != weight width {w_in}");
        }
        let covered: usize = self.layout.seq_lens.iter().sum();
        if covered != num_tokens {
            candle_core::bail!("segmented bgmv: segments cover {covered} of {num_tokens} tokens");
        }

        let mut deltas = Vec::with_capacity(self.groups.len());
        for ((&group, &start), &len) in self
            .groups
            .iter()
            .zip(&self.layout.seq_starts)
            .zip(&self.layout.seq_lens)
        {
            let group = group as usize;
            if group >= num_groups {
                candle_core::bail!("segmented bgmv: group {group} out of range ({num_groups})");
            }
            let rows = inputs.narrow(0, start, len)?;
            deltas.push(project_rows(&rows, &self.layout.weights.i(group)?)?);
        }
        let delta = Tensor::cat(&deltas, 0)?;

        if (scale - 1.0).abs() > f64::EPSILON {
            delta.affine(scale, 0.0)
        } else {
            Ok(delta)
        }
    }
}

impl LoraKernel for SegmentedBgmv {
    fn name(&self) -> KernelName {
        KernelName::Segmented
    }

    fn shrink(&self, out: &Tensor, inputs: &Tensor, scale: f64) -> Result<()> {
        let delta = self.segment_deltas(inputs, scale)?;
        accumulate_into(out, &delta, true)
    }

    fn expand(&self, out: &Tensor, inputs: &Tensor, add_inputs: bool) -> Result<()> {
        let delta = self.segment_deltas(inputs, 1.0)?;
        accumulate_into(out, &delta, add_inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn layout(device: &Device) -> SegmentedLayout {
        // Group 0 sums the inputs, group 1 takes the first one.
        let weights =
            Tensor::from_vec(vec![1.0f32, 1.0, 1.0, 0.0], (2, 1, 2), device).unwrap();
        SegmentedLayout {
            group_indices: Tensor::new(&[1u32, 0], device).unwrap(),
            weights,
            seq_starts: vec![0, 2],
            seq_lens: vec![2, 1],
        }
    }

    #[test]
    fn test_segments_use_their_group() {
        let device = Device::Cpu;
        let kernel = SegmentedBgmv::new(layout(&device)).unwrap();
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), &device).unwrap();
        let out = Tensor::zeros((3, 1), DType::F32, &device).unwrap();

        kernel.shrink(&out, &x, 2.0).unwrap();

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 6.0, 22.0]);
    }

    #[test]
    fn test_expand_accumulates() {
        let device = Device::Cpu;
        let kernel = SegmentedBgmv::new(layout(&device)).unwrap();
        let x = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let out = Tensor::full(1.0f32, (3, 1), &device).unwrap();

        kernel.expand(&out, &x, true).unwrap();

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 2.0, 3.0]);
    }

    #[test]
    fn test_group_count_must_match_segments() {
        let device = Device::Cpu;
        let mut layout = layout(&device);
        layout.group_indices = Tensor::new(&[1u32], &device).unwrap();

        let err = SegmentedBgmv::new(layout).unwrap_err();
        assert!(err.to_string().contains("group ids"), "got: {err}");
    }

    #[test]
    fn test_uncovered_tokens_rejected() {
        let device = Device::Cpu;
        let kernel = SegmentedBgmv::new(layout(&device)).unwrap();
        let x = Tensor::ones((4, 2), DType::F32, &device).unwrap();
        let out = Tensor::zeros((4, 1), DType::F32, &device).unwrap();

        let err = kernel.shrink(&out, &x, 1.0).unwrap_err();
        assert!(err.to_string().contains("cover"), "got: {err}");
    }
}
