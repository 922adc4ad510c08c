//! Blockwise attention over contiguous caches
//!
//! Same result as the dense path within float tolerance; only the key axis is
//! processed `block_size` keys at a time, so no `[T, S]` score matrix is
//! ever materialized per head.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::kernel::{HeadGeometry, blockwise_attention};
use crate::error::Result;
use crate::mask::AdditiveMask;

/// `q`: `[B, H, T, D]`, `k`/`v`: `[B, H_kv, S, D]`, one `[T, S]` mask per batch row.
pub(crate) fn flash_attention<R>(
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    masks: &[AdditiveMask],
    block_size: usize,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
{
    let q_shape = q.shape().to_vec();
    let (batch, num_heads, t_len, head_dim) = (q_shape[0], q_shape[1], q_shape[2], q_shape[3]);
    let num_kv_heads = k.shape()[1];
    let s_len = k.shape()[2];
    let geo = HeadGeometry {
        num_heads,
        num_kv_heads,
        head_dim,
    };

    let q_data = q.contiguous().to_vec::<f32>();
    let k_data = k.contiguous().to_vec::<f32>();
    let v_data = v.contiguous().to_vec::<f32>();

    let q_stride = num_heads * t_len * head_dim;
    let kv_stride = num_kv_heads * s_len * head_dim;
    let mut output = Vec::with_capacity(batch * q_stride);
    for (b, mask) in masks.iter().enumerate().take(batch) {
        output.extend(blockwise_attention(
            &q_data[b * q_stride..(b + 1) * q_stride],
            &k_data[b * kv_stride..(b + 1) * kv_stride],
            &v_data[b * kv_stride..(b + 1) * kv_stride],
            mask,
            geo,
            block_size,
        ));
    }

    Ok(Tensor::<R>::from_slice(&output, &q_shape, q.device()))
}
