//! Host-side blockwise attention with online softmax
//!
//! Keys are visited in tiles of `block_size`. Each query keeps a running max,
//! a running normalizer and an unnormalized output row, rescaled whenever a
//! tile raises the max:
//!
//!   m' = max(m, max_j s_j)
//!   l' = l * exp(m - m') + sum_j exp(s_j - m')
//!   o' = o * exp(m - m') + sum_j exp(s_j - m') * v_j
//!
//! Tiles with no visible key for a query are skipped entirely. Query heads map
//! onto KV heads directly (`kv_head = head / group`), so GQA needs no expansion.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use crate::mask::AdditiveMask;

/// Head layout shared by queries and keys.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeadGeometry {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadGeometry {
    fn group(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

/// Attention for one sequence.
///
/// `q`: `[H, T, D]`, `k`/`v`: `[H_kv, S, D]`, `mask`: `[T, S]`. Returns `[H, T, D]`.
pub(crate) fn blockwise_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    mask: &AdditiveMask,
    geo: HeadGeometry,
    block_size: usize,
) -> Vec<f32> {
    let d = geo.head_dim;
    let t_len = mask.rows();
    let s_len = mask.cols();
    let scale = (d as f32).sqrt().recip();
    let block_size = block_size.max(1);

    let mut out = vec![0.0f32; geo.num_heads * t_len * d];
    let mut scores = vec![0.0f32; block_size];

    for h in 0..geo.num_heads {
        let kv_h = h / geo.group();
        let k_head = &k[kv_h * s_len * d..(kv_h + 1) * s_len * d];
        let v_head = &v[kv_h * s_len * d..(kv_h + 1) * s_len * d];

        for i in 0..t_len {
            let q_row = &q[(h * t_len + i) * d..(h * t_len + i + 1) * d];
            let mask_row = mask.row(i);
            let acc = &mut out[(h * t_len + i) * d..(h * t_len + i + 1) * d];

            let mut running_max = f32::NEG_INFINITY;
            let mut running_sum = 0.0f32;

            for tile_start in (0..s_len).step_by(block_size) {
                let tile_end = (tile_start + block_size).min(s_len);
                let tile_mask = &mask_row[tile_start..tile_end];
                if tile_mask.iter().all(|m| *m == f32::NEG_INFINITY) {
                    continue;
                }

                let mut tile_max = f32::NEG_INFINITY;
                for (jj, &bias) in tile_mask.iter().enumerate() {
                    let j = tile_start + jj;
                    let s = if bias == f32::NEG_INFINITY {
                        f32::NEG_INFINITY
                    } else {
                        dot_f32(q_row, &k_head[j * d..(j + 1) * d]) * scale + bias
                    };
                    scores[jj] = s;
                    tile_max = tile_max.max(s);
                }

                let new_max = running_max.max(tile_max);
                let correction = (running_max - new_max).exp();
                if correction != 1.0 {
                    running_sum *= correction;
                    acc.iter_mut().for_each(|x| *x *= correction);
                }

                for (jj, &s) in scores[..tile_end - tile_start].iter().enumerate() {
                    if s == f32::NEG_INFINITY {
                        continue;
                    }
                    let j = tile_start + jj;
                    let p = (s - new_max).exp();
                    running_sum += p;
                    accumulate_weighted(acc, &v_head[j * d..(j + 1) * d], p);
                }
                running_max = new_max;
            }

            if running_sum > 0.0 {
                let inv = running_sum.recip();
                acc.iter_mut().for_each(|x| *x *= inv);
            }
        }
    }
    out
}

/// Dot product of two f32 slices.
#[inline]
pub(crate) fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_f32_avx2_fma(a.as_ptr(), b.as_ptr(), a.len()) };
        }
    }

    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// `out += weight * v`
#[inline]
pub(crate) fn accumulate_weighted(out: &mut [f32], v: &[f32], weight: f32) {
    debug_assert_eq!(out.len(), v.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            unsafe { accumulate_weighted_avx2(out.as_mut_ptr(), v.as_ptr(), weight, out.len()) };
            return;
        }
    }

    for (o, &x) in out.iter_mut().zip(v) {
        *o += weight * x;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_f32_avx2_fma(a: *const f32, b: *const f32, len: usize) -> f32 {
    unsafe {
        const LANES: usize = 8;
        let chunks = len / LANES;

        let mut acc = _mm256_setzero_ps();
        for i in 0..chunks {
            let va = _mm256_loadu_ps(a.add(i * LANES));
            let vb = _mm256_loadu_ps(b.add(i * LANES));
            acc = _mm256_fmadd_ps(va, vb, acc);
        }

        // horizontal sum of the 8 lanes
        let hi = _mm256_extractf128_ps(acc, 1);
        let lo = _mm256_castps256_ps128(acc);
        let sum4 = _mm_add_ps(lo, hi);
        let sum2 = _mm_add_ps(sum4, _mm_movehl_ps(sum4, sum4));
        let sum1 = _mm_add_ss(sum2, _mm_shuffle_ps(sum2, sum2, 1));
        let mut result = _mm_cvtss_f32(sum1);

        for i in chunks * LANES..len {
            result += *a.add(i) * *b.add(i);
        }
        result
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn accumulate_weighted_avx2(out: *mut f32, v: *const f32, weight: f32, len: usize) {
    unsafe {
        const LANES: usize = 8;
        let chunks = len / LANES;
        let w = _mm256_set1_ps(weight);

        for i in 0..chunks {
            let o = _mm256_loadu_ps(out.add(i * LANES));
            let x = _mm256_loadu_ps(v.add(i * LANES));
            _mm256_storeu_ps(out.add(i * LANES), _mm256_fmadd_ps(w, x, o));
        }
        for i in chunks * LANES..len {
            *out.add(i) += weight * *v.add(i);
        }
    }
}
