//! Flat per-token index kernel.
//!
//! One routine serves both directions: the weight block of each token's group
//! is gathered, and the token row is multiplied against it. Expand runs it
//! with a unit scale.

use candle_core::{DType, Result, Tensor};

use super::{accumulate_into, KernelName, LoraKernel};
use crate::layout::TokenIndexedLayout;

/// Token-indexed BGMV over `[groups, 1, out, in]` weights.
#[derive(Debug, Clone)]
pub struct IndexedBgmv {
    layout: TokenIndexedLayout,
}

impl IndexedBgmv {
    pub fn new(layout: TokenIndexedLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &TokenIndexedLayout {
        &self.layout
    }

    fn bgmv(&self, out: &Tensor, inputs: &Tensor, scale: f64, add_inputs: bool) -> Result<()> {
        let (num_tokens, in_dim) = inputs.dims2()?;
        let (_, layers, out_dim, w_in) = self.layout.weights.dims4()?;
        if layers != 1 {
            candle_core::bail!("indexed bgmv: expected a single layer, got {layers}");
        }
        if w_in != in_dim {
            candle_core::bail!("indexed bgmv: input width {in_dim} != weight width {w_in}");
        }
        if self.layout.token_indices.dim(0)? != num_tokens {
            candle_core::bail!(
                "indexed bgmv: {} token indices for {num_tokens} tokens",
                self.layout.token_indices.dim(0)?
            );
        }

        // [tokens, out, in]
        let selected = self
            .layout
            .weights
            .squeeze(1)?
            .index_select(&self.layout.token_indices, 0)?
            .to_dtype(DType::F32)?;
        // [tokens, 1, in] @ [tokens, in, out] -> [tokens, 1, out]
        let rows = inputs.to_dtype(DType::F32)?.unsqueeze(1)?;
        let mut delta = rows.matmul(&selected.transpose(1, 2)?)?.squeeze(1)?;
        if (scale - 1.0).abs() > f64::EPSILON {
            delta = delta.affine(scale, 0.0)?;
        }
        debug_assert_eq!(delta.dims(), &[num_tokens, out_dim]);

        accumulate_into(out, &delta, add_inputs)
    }
}

impl LoraKernel for IndexedBgmv {
    fn name(&self) -> KernelName {
        KernelName::Indexed
    }

    fn shrink(&self, out: &Tensor, inputs: &Tensor, scale: f64) -> Result<()> {
        self.bgmv(out, inputs, scale, true)
    }

    fn expand(&self, out: &Tensor, inputs: &Tensor, add_inputs: bool) -> Result<()> {
        self.bgmv(out, inputs, 1.0, add_inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn layout(device: &Device) -> TokenIndexedLayout {
        // Group 0 is the identity, group 1 doubles.
        let weights = Tensor::from_vec(
            vec![1.0f32, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0],
            (2, 1, 2, 2),
            device,
        )
        .unwrap();
        let token_indices = Tensor::new(&[1i64, 0, 1], device).unwrap();
        TokenIndexedLayout {
            weights,
            token_indices,
        }
    }

    #[test]
    fn test_bgmv_routes_tokens_to_groups() {
        let device = Device::Cpu;
        let kernel = IndexedBgmv::new(layout(&device));
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), &device).unwrap();
        let out = Tensor::zeros((3, 2), DType::F32, &device).unwrap();

        kernel.shrink(&out, &x, 1.0).unwrap();

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 4.0, 3.0, 4.0, 10.0, 12.0]);
    }

    #[test]
    fn test_shrink_applies_scale_and_accumulates() {
        let device = Device::Cpu;
        let kernel = IndexedBgmv::new(layout(&device));
        let x = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let out = Tensor::zeros((3, 2), DType::F32, &device).unwrap();

        kernel.shrink(&out, &x, 0.5).unwrap();
        kernel.shrink(&out, &x, 0.5).unwrap();

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_expand_without_add_inputs_overwrites() {
        let device = Device::Cpu;
        let kernel = IndexedBgmv::new(layout(&device));
        let x = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let out = Tensor::full(9.0f32, (3, 2), &device).unwrap();

        kernel.expand(&out, &x, false).unwrap();

        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_token_count_mismatch_rejected() {
        let device = Device::Cpu;
        let kernel = IndexedBgmv::new(layout(&device));
        let x = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let out = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        assert!(kernel.shrink(&out, &x, 1.0).is_err());
    }
}
