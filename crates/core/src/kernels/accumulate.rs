//! In-place writes into kernel output buffers.
//!
//! Candle tensors are immutable from the public API, but the kernels under
//! test accumulate into a caller-owned buffer. These helpers write through the
//! buffer's storage with an `InplaceOp2`, so the same tensor keeps receiving
//! results across warm-up, capture and replay.

use candle_core::{DType, Result, Tensor};

/// Copy `src` into `dst` in place.
///
/// Both tensors must be contiguous, share dtype and device, and hold the same
/// number of elements. On CUDA this records a device-to-device memcpy on the
/// device stream, so it is valid inside a graph capture.
pub fn inplace_copy(dst: &Tensor, src: &Tensor) -> Result<()> {
    if dst.dtype() != src.dtype() {
        candle_core::bail!(
            "inplace_copy: dtype mismatch: dst={:?}, src={:?}",
            dst.dtype(),
            src.dtype()
        );
    }
    if dst.elem_count() != src.elem_count() {
        candle_core::bail!(
            "inplace_copy: element count mismatch: dst={}, src={}",
            dst.elem_count(),
            src.elem_count()
        );
    }
    if !dst.device().same_device(src.device()) {
        candle_core::bail!(
            "inplace_copy: device mismatch: dst={:?}, src={:?}",
            dst.device().location(),
            src.device().location()
        );
    }
    if !dst.is_contiguous() {
        candle_core::bail!("inplace_copy: destination must be contiguous");
    }
    let src = src.contiguous()?;
    dst.inplace_op2(&src, &InplaceCopyOp)
}

/// `out += delta`, computed in F32 and written back in `out`'s dtype.
///
/// With `accumulate == false` the previous content is discarded: `out = delta`.
pub fn accumulate_into(out: &Tensor, delta: &Tensor, accumulate: bool) -> Result<()> {
    if out.dims() != delta.dims() {
        candle_core::bail!(
            "accumulate_into: shape mismatch: out={:?}, delta={:?}",
            out.dims(),
            delta.dims()
        );
    }
    let delta = delta.to_dtype(DType::F32)?;
    let updated = if accumulate {
        (out.to_dtype(DType::F32)? + delta)?
    } else {
        delta
    };
    inplace_copy(out, &updated.to_dtype(out.dtype())?)
}

struct InplaceCopyOp;

impl candle_core::InplaceOp2 for InplaceCopyOp {
    fn name(&self) -> &'static str {
        "lora_inplace_copy"
    }

    fn cpu_fwd(
        &self,
        dst_storage: &mut candle_core::CpuStorage,
        dst_layout: &candle_core::Layout,
        src_storage: &candle_core::CpuStorage,
        src_layout: &candle_core::Layout,
    ) -> Result<()> {
        use candle_core::CpuStorage;

        let dst_offset = dst_layout.start_offset();
        let src_offset = src_layout.start_offset();
        let n = dst_layout.shape().elem_count();

        macro_rules! copy_host {
            ($($variant:ident),+) => {
                match (dst_storage, src_storage) {
                    $((CpuStorage::$variant(d), CpuStorage::$variant(s)) => d
                        [dst_offset..dst_offset + n]
                        .copy_from_slice(&s[src_offset..src_offset + n]),)+
                    _ => candle_core::bail!("lora_inplace_copy: unsupported or mismatched dtypes"),
                }
            };
        }
        copy_host!(F16, BF16, F32, F64);
        Ok(())
    }

    #[cfg(feature = "cuda-kernels")]
    fn cuda_fwd(
        &self,
        dst_storage: &mut candle_core::CudaStorage,
        dst_layout: &candle_core::Layout,
        src_storage: &candle_core::CudaStorage,
        src_layout: &candle_core::Layout,
    ) -> Result<()> {
        use candle_core::cuda::CudaStorageSlice;

        let n = dst_layout.shape().elem_count();
        let dst_offset = dst_layout.start_offset();
        let src_offset = src_layout.start_offset();

        let device = dst_storage.device.clone();
        macro_rules! copy_device {
            ($($variant:ident),+) => {
                match (&mut dst_storage.slice, &src_storage.slice) {
                    $((CudaStorageSlice::$variant(d), CudaStorageSlice::$variant(s)) => {
                        let src = s.slice(src_offset..src_offset + n);
                        let mut dst = d.slice_mut(dst_offset..dst_offset + n);
                        device.memcpy_dtod(&src, &mut dst)?;
                    })+
                    _ => candle_core::bail!(
                        "lora_inplace_copy: unsupported or mismatched CUDA dtypes"
                    ),
                }
            };
        }
        copy_device!(F16, BF16, F32);
        Ok(())
    }
}
