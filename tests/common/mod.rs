//! Shared helpers for cachet integration tests.

#![allow(dead_code)]

use std::ops::Range;
use std::sync::Arc;

use cachet::{
    AttentionInput, AttentionStrategy, CacheConfig, GenerateCache, PrefillCache, Tensor,
};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

pub fn setup_cpu() -> (CpuClient, CpuDevice) {
    init_tracing();
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

/// Route cache logs to the test harness; set `RUST_LOG=cachet=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.1 + phase).sin() * 0.5).collect()
}

pub fn det_tensor(shape: &[usize], phase: f32, device: &CpuDevice) -> Tensor<CpuRuntime> {
    let n: usize = shape.iter().product();
    Tensor::<CpuRuntime>::from_slice(&det_data(n, phase), shape, device)
}

pub fn assert_close(a: &[f32], b: &[f32], atol: f32, op: &str) {
    assert_eq!(a.len(), b.len(), "{op}: length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let diff = (x - y).abs();
        if diff > atol {
            panic!("{op} at index {i}: {x} vs {y} (diff={diff}, atol={atol})");
        }
    }
}

/// Host-side Q/K/V projections for one sequence, laid out `[heads, len, head_dim]`.
pub struct Sequence {
    pub len: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl Sequence {
    pub fn new(len: usize, heads: usize, kv_heads: usize, head_dim: usize, seed: f32) -> Self {
        Self {
            len,
            heads,
            kv_heads,
            head_dim,
            q: det_data(heads * len * head_dim, seed),
            k: det_data(kv_heads * len * head_dim, seed + 0.7),
            v: det_data(kv_heads * len * head_dim, seed + 1.9),
        }
    }

    pub fn for_config(config: &CacheConfig, len: usize, seed: f32) -> Self {
        Self::new(len, config.num_heads, config.kv_heads(), config.head_dim, seed)
    }

    fn rows(&self, data: &[f32], heads: usize, range: &Range<usize>) -> Vec<f32> {
        let d = self.head_dim;
        let mut out = Vec::with_capacity(heads * range.len() * d);
        for h in 0..heads {
            let base = h * self.len * d;
            out.extend_from_slice(&data[base + range.start * d..base + range.end * d]);
        }
        out
    }

    pub fn q_rows(&self, range: Range<usize>) -> Vec<f32> {
        self.rows(&self.q, self.heads, &range)
    }

    pub fn k_rows(&self, range: Range<usize>) -> Vec<f32> {
        self.rows(&self.k, self.kv_heads, &range)
    }

    pub fn v_rows(&self, range: Range<usize>) -> Vec<f32> {
        self.rows(&self.v, self.kv_heads, &range)
    }

    /// `(q, k, v)` tensors `[1, heads, n, head_dim]` for tokens in `range`.
    pub fn block(
        &self,
        range: Range<usize>,
        device: &CpuDevice,
    ) -> (Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>) {
        let n = range.len();
        let d = self.head_dim;
        (
            Tensor::from_slice(&self.q_rows(range.clone()), &[1, self.heads, n, d], device),
            Tensor::from_slice(&self.k_rows(range.clone()), &[1, self.kv_heads, n, d], device),
            Tensor::from_slice(&self.v_rows(range), &[1, self.kv_heads, n, d], device),
        )
    }

    /// Naive attention output `[heads, head_dim]` for the query at `pos`.
    ///
    /// Key `l` is visible when `pos - window <= l <= pos` and `pos - l < capacity`.
    pub fn reference(&self, pos: usize, window: usize, capacity: usize) -> Vec<f32> {
        let d = self.head_dim;
        let group = self.heads / self.kv_heads;
        let scale = (d as f32).sqrt().recip();
        let visible: Vec<usize> = (0..=pos)
            .filter(|&l| pos - l <= window && pos - l < capacity)
            .collect();

        let mut out = vec![0.0f32; self.heads * d];
        for h in 0..self.heads {
            let kv = h / group;
            let q = &self.q[(h * self.len + pos) * d..(h * self.len + pos + 1) * d];
            let scores: Vec<f32> = visible
                .iter()
                .map(|&l| {
                    let k = &self.k[(kv * self.len + l) * d..(kv * self.len + l + 1) * d];
                    q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * scale
                })
                .collect();
            let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            for (&l, e) in visible.iter().zip(&exps) {
                let v = &self.v[(kv * self.len + l) * d..(kv * self.len + l + 1) * d];
                for x in 0..d {
                    out[h * d + x] += e / sum * v[x];
                }
            }
        }
        out
    }
}

/// Concatenate per-row `[heads, n, d]` host blocks into a `[B, heads, n, d]` tensor.
pub fn batch_tensor(
    rows: &[Vec<f32>],
    heads: usize,
    n: usize,
    d: usize,
    device: &CpuDevice,
) -> Tensor<CpuRuntime> {
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&data, &[rows.len(), heads, n, d], device)
}

/// Token `t` of every head from a `[1, heads, n, d]` output.
pub fn token_of(out: &[f32], heads: usize, n: usize, d: usize, t: usize) -> Vec<f32> {
    (0..heads)
        .flat_map(|h| out[(h * n + t) * d..(h * n + t + 1) * d].iter().copied())
        .collect()
}

/// Prefill `range` of `seq` into a fresh batch-1 prefill cache.
pub fn prefill(
    client: &CpuClient,
    device: &CpuDevice,
    strategy: &AttentionStrategy,
    config: &Arc<CacheConfig>,
    seq: &Sequence,
    range: Range<usize>,
) -> (Vec<f32>, PrefillCache<CpuRuntime>) {
    let cache = PrefillCache::new(config.clone(), 1);
    let (q, k, v) = seq.block(range.clone(), device);
    let positions = vec![range.collect::<Vec<_>>()];
    let input = AttentionInput::new(&q, &k, &v, &positions);
    let (out, cache) = strategy.prefill(client, &input, cache).unwrap();
    (out.to_vec::<f32>(), cache)
}

/// Prefill `prompt` tokens into slot 0, then decode the rest one at a time.
///
/// Returns the output of every decode step, each `[heads * head_dim]`.
pub fn prefill_then_decode(
    client: &CpuClient,
    device: &CpuDevice,
    config: &Arc<CacheConfig>,
    seq: &Sequence,
    prompt: usize,
) -> (Vec<Vec<f32>>, GenerateCache<CpuRuntime>) {
    let strategy = AttentionStrategy::from_config(config).unwrap();
    let (_, prefilled) = prefill(client, device, &strategy, config, seq, 0..prompt);
    let mut cache = GenerateCache::new(config.clone(), device)
        .unwrap()
        .insert_prefill(0, prefilled)
        .unwrap();

    let mut outputs = Vec::new();
    for p in prompt..seq.len {
        let (q, k, v) = seq.block(p..p + 1, device);
        let positions = vec![vec![p]];
        let input = AttentionInput::new(&q, &k, &v, &positions);
        let (out, next) = strategy.decode(client, &input, cache).unwrap();
        outputs.push(out.to_vec::<f32>());
        cache = next;
    }
    (outputs, cache)
}
