//! Rotary position table shared by every layer of a session
//!
//! Built once, wrapped in an `Arc`, never mutated. Rotation uses explicit
//! per-row positions because decode rows of one batch sit at different
//! offsets.

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result, shape_mismatch};

/// How dimensions are paired for rotation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RotaryLayout {
    /// `(x[d], x[d + D/2])`, Llama style.
    #[default]
    SplitHalf,
    /// `(x[2d], x[2d + 1])`, GPT-NeoX style.
    Interleaved,
}

/// Precomputed `cos(pos * freq_i)` / `sin(pos * freq_i)` for
/// `max_positions × head_dim/2`, with `freq_i = base^(-2i / head_dim)`.
#[derive(Debug)]
pub struct RotaryTable {
    max_positions: usize,
    half_dim: usize,
    layout: RotaryLayout,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryTable {
    pub fn new(max_positions: usize, head_dim: usize, base: f32) -> Result<Arc<Self>> {
        Self::with_layout(max_positions, head_dim, base, RotaryLayout::default())
    }

    pub fn with_layout(
        max_positions: usize,
        head_dim: usize,
        base: f32,
        layout: RotaryLayout,
    ) -> Result<Arc<Self>> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(Error::InvalidArgument {
                arg: "head_dim",
                reason: format!("head dim D={head_dim} must be even and non-zero for RoPE"),
            });
        }
        if !(base.is_finite() && base > 1.0) {
            return Err(Error::InvalidArgument {
                arg: "base",
                reason: format!("rotary base must be finite and > 1, got {base}"),
            });
        }

        let half_dim = head_dim / 2;
        let freqs: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / head_dim as f32))
            .collect();

        let mut cos = vec![0.0f32; max_positions * half_dim];
        let mut sin = vec![0.0f32; max_positions * half_dim];
        for pos in 0..max_positions {
            for (i, &freq) in freqs.iter().enumerate() {
                let angle = pos as f32 * freq;
                cos[pos * half_dim + i] = angle.cos();
                sin[pos * half_dim + i] = angle.sin();
            }
        }
        tracing::debug!(max_positions, head_dim, base, ?layout, "rotary table built");

        Ok(Arc::new(Self {
            max_positions,
            half_dim,
            layout,
            cos,
            sin,
        }))
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn head_dim(&self) -> usize {
        self.half_dim * 2
    }

    pub fn layout(&self) -> RotaryLayout {
        self.layout
    }

    /// `(cos, sin)` rows for one position, each `head_dim/2` long.
    pub fn row(&self, pos: usize) -> Option<(&[f32], &[f32])> {
        (pos < self.max_positions).then(|| {
            let range = pos * self.half_dim..(pos + 1) * self.half_dim;
            (&self.cos[range.clone()], &self.sin[range])
        })
    }

    /// Rotate `x: [B, H, T, D]`; token `t` of row `b` sits at `positions[b][t]`.
    pub fn apply<R>(&self, x: &Tensor<R>, positions: &[Vec<usize>]) -> Result<Tensor<R>>
    where
        R: Runtime<DType = DType>,
    {
        let shape = x.shape().to_vec();
        if shape.len() != 4 || shape[3] != self.head_dim() {
            return Err(shape_mismatch(
                "x",
                format!("[B, H, T, {}]", self.head_dim()),
                &shape,
            ));
        }
        let (batch, heads, tokens, d) = (shape[0], shape[1], shape[2], shape[3]);
        if positions.len() != batch {
            return Err(shape_mismatch("positions", batch, positions.len()));
        }

        let mut data = x.contiguous().to_vec::<f32>();
        for (b, row_positions) in positions.iter().enumerate() {
            if row_positions.len() != tokens {
                return Err(shape_mismatch("positions", tokens, row_positions.len()));
            }
            for (t, &pos) in row_positions.iter().enumerate() {
                let Some((cos, sin)) = self.row(pos) else {
                    return Err(Error::InvalidArgument {
                        arg: "positions",
                        reason: format!(
                            "position {pos} beyond rotary table of {}",
                            self.max_positions
                        ),
                    });
                };
                for h in 0..heads {
                    let start = ((b * heads + h) * tokens + t) * d;
                    self.rotate(&mut data[start..start + d], cos, sin);
                }
            }
        }
        Ok(Tensor::<R>::from_slice(&data, &shape, x.device()))
    }

    fn rotate(&self, v: &mut [f32], cos: &[f32], sin: &[f32]) {
        for i in 0..self.half_dim {
            let (a, b) = match self.layout {
                RotaryLayout::SplitHalf => (i, i + self.half_dim),
                RotaryLayout::Interleaved => (2 * i, 2 * i + 1),
            };
            let (x1, x2) = (v[a], v[b]);
            v[a] = x1 * cos[i] - x2 * sin[i];
            v[b] = x1 * sin[i] + x2 * cos[i];
        }
    }
}
