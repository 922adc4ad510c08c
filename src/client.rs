//! Runtime client capabilities required by the cache core

use numr::dtype::DType;
use numr::ops::{ActivationOps, BinaryOps, MatmulOps, ScalarOps, ShapeOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Every numr op the cache and attention paths dispatch through.
///
/// Blanket-implemented, so any numr client with these ops (CPU, CUDA, WebGPU)
/// drives the cache unchanged.
pub trait CacheClient<R: Runtime<DType = DType>>:
    RuntimeClient<R>
    + MatmulOps<R>
    + ScalarOps<R>
    + BinaryOps<R>
    + ActivationOps<R>
    + ShapeOps<R>
    + TypeConversionOps<R>
{
}

impl<R, C> CacheClient<R> for C
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R>
        + MatmulOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + ActivationOps<R>
        + ShapeOps<R>
        + TypeConversionOps<R>,
{
}
