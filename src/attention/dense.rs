//! Dense scaled dot-product attention through numr ops
//!
//! output = softmax(Q @ K^T / sqrt(d) + mask) @ V, with the whole key axis
//! materialized at once.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::client::CacheClient;
use crate::error::Result;
use crate::mask::AdditiveMask;

/// `q`: `[B, H, T, D]`, `k`/`v`: `[B, H_kv, S, D]`, one `[T, S]` mask per batch row.
pub(crate) fn dense_attention<R, C>(
    client: &C,
    q: &Tensor<R>,
    k: &Tensor<R>,
    v: &Tensor<R>,
    masks: &[AdditiveMask],
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: CacheClient<R>,
{
    let num_heads = q.shape()[1];
    let num_kv_heads = k.shape()[1];
    let head_dim = q.shape()[3];
    let scale = (head_dim as f64).sqrt().recip();

    // GQA: expand KV heads to match query heads
    let (k, v) = if num_kv_heads < num_heads {
        let repeats = num_heads / num_kv_heads;
        (
            client.repeat_interleave(k, repeats, Some(1))?,
            client.repeat_interleave(v, repeats, Some(1))?,
        )
    } else {
        (k.contiguous(), v.contiguous())
    };

    // Q @ K^T → [B, H, T, S]
    let k_t = k.transpose(-2, -1)?.contiguous();
    let scores = client.matmul(&q.contiguous(), &k_t)?;
    let scores = client.mul_scalar(&scores, scale)?;

    // a fully blocked row has no softmax support; it attends to nothing and yields zeros
    let keep: Vec<f32> = masks
        .iter()
        .flat_map(|m| (0..m.rows()).map(move |r| if m.is_row_blocked(r) { 0.0 } else { 1.0 }))
        .collect();
    let any_blocked = keep.contains(&0.0);
    let opened;
    let masks = if any_blocked {
        opened = masks.iter().map(AdditiveMask::open_blocked_rows).collect::<Vec<_>>();
        opened.as_slice()
    } else {
        masks
    };

    // [B, 1, T, S] broadcasts over heads
    let mask = AdditiveMask::stack::<R>(masks, q.device())?;
    let scores = client.add(&scores, &mask)?;

    let weights = client.softmax(&scores, -1)?;
    let out = client.matmul(&weights, &v)?;
    if !any_blocked {
        return Ok(out);
    }
    let rows = masks[0].rows();
    let keep = Tensor::<R>::from_slice(&keep, &[masks.len(), 1, rows, 1], q.device());
    let keep = client.cast(&keep, out.dtype())?;
    Ok(client.mul(&out, &keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::kernel::{HeadGeometry, blockwise_attention};
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_dense_matches_blockwise_with_gqa() {
        let (client, dev) = cpu_setup();
        let (h, hkv, t, s, d) = (4, 2, 2, 6, 4);
        let pattern = |n: usize, phase: f32| -> Vec<f32> {
            (0..n).map(|i| (i as f32 * 0.1 + phase).sin() * 0.5).collect()
        };
        let q_data = pattern(h * t * d, 0.0);
        let k_data = pattern(hkv * s * d, 0.4);
        let v_data = pattern(hkv * s * d, 0.9);
        let q = Tensor::<CpuRuntime>::from_slice(&q_data, &[1, h, t, d], &dev);
        let k = Tensor::<CpuRuntime>::from_slice(&k_data, &[1, hkv, s, d], &dev);
        let v = Tensor::<CpuRuntime>::from_slice(&v_data, &[1, hkv, s, d], &dev);
        let mask = AdditiveMask::from_fn(t, s, |i, j| j <= 4 + i);

        let dense = dense_attention(&client, &q, &k, &v, std::slice::from_ref(&mask))
            .unwrap()
            .to_vec::<f32>();
        let geo = HeadGeometry {
            num_heads: h,
            num_kv_heads: hkv,
            head_dim: d,
        };
        let flash = blockwise_attention(&q_data, &k_data, &v_data, &mask, geo, 4);
        for (a, b) in dense.iter().zip(&flash) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_fully_blocked_row_yields_zeros() {
        let (client, dev) = cpu_setup();
        let (h, t, s, d) = (2, 2, 3, 4);
        let q = Tensor::<CpuRuntime>::from_slice(&vec![0.3f32; h * t * d], &[1, h, t, d], &dev);
        let k = Tensor::<CpuRuntime>::from_slice(&vec![0.2f32; h * s * d], &[1, h, s, d], &dev);
        let v_data: Vec<f32> = (0..h * s * d).map(|i| i as f32 * 0.1).collect();
        let v = Tensor::<CpuRuntime>::from_slice(&v_data, &[1, h, s, d], &dev);
        // row 0 sees nothing, row 1 sees every key
        let mask = AdditiveMask::from_fn(t, s, |i, _| i == 1);

        let out = dense_attention(&client, &q, &k, &v, std::slice::from_ref(&mask))
            .unwrap()
            .to_vec::<f32>();
        assert!(out.iter().all(|x| x.is_finite()));
        for head in 0..h {
            let row0 = &out[(head * t) * d..(head * t + 1) * d];
            assert!(row0.iter().all(|&x| x == 0.0), "head {head}: {row0:?}");
            let row1 = &out[(head * t + 1) * d..(head * t + 2) * d];
            assert!(row1.iter().any(|&x| x != 0.0));
        }
    }
}
