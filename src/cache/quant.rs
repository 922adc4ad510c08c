//! Storage encodings for cached keys/values
//!
//! Callers always see F32. Reduced floats are stored through `cast`; Int8 is
//! symmetric per token and head, with one F32 scale per `(batch, head, position)`:
//!
//! ```text
//! scale = max_abs(x[b, h, t, :]) / 127
//! q     = round(x / scale) clamped to [-127, 127]
//! x'    = q * scale
//! ```

use crate::client::CacheClient;
use crate::config::StorageDType;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Quantize rows of `head_dim` values. Returns (values, one scale per row).
#[allow(clippy::needless_range_loop)]
pub fn quantize_int8(data: &[f32], head_dim: usize) -> (Vec<i8>, Vec<f32>) {
    let num_rows = data.len() / head_dim;
    let mut quantized = vec![0i8; num_rows * head_dim];
    let mut scales = vec![0.0f32; num_rows];

    for t in 0..num_rows {
        let offset = t * head_dim;
        let row = &data[offset..offset + head_dim];
        let max_abs = row.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        let scale = max_abs / 127.0;
        scales[t] = scale;

        if scale > 0.0 {
            for d in 0..head_dim {
                quantized[offset + d] = (row[d] / scale).round().clamp(-127.0, 127.0) as i8;
            }
        }
    }
    (quantized, scales)
}

pub fn dequantize_int8(quantized: &[i8], scales: &[f32], head_dim: usize) -> Vec<f32> {
    quantized
        .chunks_exact(head_dim)
        .zip(scales)
        .flat_map(|(row, &scale)| row.iter().map(move |&q| q as f32 * scale))
        .collect()
}

/// Int8 values `[B, H, S, D]` with per-token scales `[B, H, S]`.
#[derive(Clone)]
pub struct QuantizedPayload<R: Runtime> {
    pub values: Tensor<R>,
    pub scales: Tensor<R>,
}

impl<R: Runtime<DType = DType>> QuantizedPayload<R> {
    /// Quantize an F32 `[B, H, T, D]` block.
    pub fn quantize(block: &Tensor<R>) -> Result<Self> {
        let shape = block.shape().to_vec();
        if shape.len() != 4 {
            return Err(Error::ShapeMismatch {
                arg: "block",
                expected: "[B, H, T, D]".into(),
                got: format!("{shape:?}"),
            });
        }
        let head_dim = shape[3];
        if head_dim == 0 {
            return Err(Error::QuantError {
                reason: "cannot quantize zero-width rows".into(),
            });
        }
        let data = block.contiguous().to_vec::<f32>();
        if let Some(bad) = data.iter().find(|x| !x.is_finite()) {
            return Err(Error::QuantError {
                reason: format!("non-finite value {bad} in int8 cache write"),
            });
        }
        let (quantized, scales) = quantize_int8(&data, head_dim);
        let device = block.device();
        Ok(Self {
            values: Tensor::<R>::from_slice(&quantized, &shape, device),
            scales: Tensor::<R>::from_slice(&scales, &shape[..3], device),
        })
    }

    pub fn dequantize(&self) -> Tensor<R> {
        let shape = self.values.shape().to_vec();
        let values = self.values.contiguous().to_vec::<i8>();
        let scales = self.scales.contiguous().to_vec::<f32>();
        let data = dequantize_int8(&values, &scales, shape[3]);
        Tensor::<R>::from_slice(&data, &shape, self.values.device())
    }
}

/// Encoded cache contents along the `[B, H, S, D]` layout.
#[derive(Clone)]
pub enum Payload<R: Runtime> {
    Float(Tensor<R>),
    Quantized(QuantizedPayload<R>),
}

impl<R: Runtime<DType = DType>> Payload<R> {
    pub fn zeros(shape: &[usize; 4], storage: StorageDType, device: &R::Device) -> Self {
        match storage {
            StorageDType::Int8 => Self::Quantized(QuantizedPayload {
                values: Tensor::<R>::zeros(shape, DType::I8, device),
                scales: Tensor::<R>::zeros(&shape[..3], DType::F32, device),
            }),
            other => Self::Float(Tensor::<R>::zeros(shape, other.dtype(), device)),
        }
    }

    /// Encode an F32 block into `storage`.
    pub fn encode<C>(client: &C, block: &Tensor<R>, storage: StorageDType) -> Result<Self>
    where
        C: CacheClient<R>,
    {
        match storage {
            StorageDType::Int8 => Ok(Self::Quantized(QuantizedPayload::quantize(block)?)),
            StorageDType::F32 => Ok(Self::Float(block.clone())),
            other => Ok(Self::Float(client.cast(block, other.dtype())?)),
        }
    }

    /// Decode to the F32 working precision.
    pub fn decode<C>(&self, client: &C) -> Result<Tensor<R>>
    where
        C: CacheClient<R>,
    {
        match self {
            Self::Float(t) if t.dtype() == DType::F32 => Ok(t.clone()),
            Self::Float(t) => Ok(client.cast(t, DType::F32)?),
            Self::Quantized(q) => Ok(q.dequantize()),
        }
    }

    /// `[B, H, S, D]` of the encoded values.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float(t) => t.shape(),
            Self::Quantized(q) => q.values.shape(),
        }
    }

    pub fn time_len(&self) -> usize {
        self.shape()[2]
    }

    pub fn narrow_batch(&self, start: usize, len: usize) -> Result<Self> {
        Ok(match self {
            Self::Float(t) => Self::Float(t.narrow(0, start, len)?),
            Self::Quantized(q) => Self::Quantized(QuantizedPayload {
                values: q.values.narrow(0, start, len)?,
                scales: q.scales.narrow(0, start, len)?,
            }),
        })
    }

    pub fn narrow_time(&self, start: usize, len: usize) -> Result<Self> {
        Ok(match self {
            Self::Float(t) => Self::Float(t.narrow(2, start, len)?),
            Self::Quantized(q) => Self::Quantized(QuantizedPayload {
                values: q.values.narrow(2, start, len)?,
                scales: q.scales.narrow(2, start, len)?,
            }),
        })
    }

    /// Append `other` along the time axis.
    pub fn concat_time<C>(&self, client: &C, other: &Self) -> Result<Self>
    where
        C: CacheClient<R>,
    {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(client.cat(&[a, b], 2)?)),
            (Self::Quantized(a), Self::Quantized(b)) => Ok(Self::Quantized(QuantizedPayload {
                values: client.cat(&[&a.values, &b.values], 2)?,
                scales: client.cat(&[&a.scales, &b.scales], 2)?,
            })),
            _ => Err(Error::InvalidArgument {
                arg: "other",
                reason: "cannot mix quantized and float cache payloads".into(),
            }),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

impl<R: Runtime<DType = DType>> Payload<R>
where
    R::Client: IndexingOps<R>,
{
    pub fn assign_batch(&self, src: &Self, start: usize) -> Result<Self> {
        self.assign(src, start, 0)
    }

    pub fn assign_time(&self, src: &Self, start: usize) -> Result<Self> {
        self.assign(src, start, 2)
    }

    fn assign(&self, src: &Self, start: usize, dim: usize) -> Result<Self> {
        match (self, src) {
            (Self::Float(dst), Self::Float(src)) => Ok(Self::Float(dst.slice_assign(src, dim, start)?)),
            (Self::Quantized(dst), Self::Quantized(src)) => Ok(Self::Quantized(QuantizedPayload {
                values: dst.values.slice_assign(&src.values, dim, start)?,
                scales: dst.scales.slice_assign(&src.scales, dim, start)?,
            })),
            _ => Err(Error::InvalidArgument {
                arg: "src",
                reason: "cannot mix quantized and float cache payloads".into(),
            }),
        }
    }
}
