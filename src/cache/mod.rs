//! KV cache storage: slot cursors, contiguous and paged stores, cache handles

pub mod blocks;
pub mod generate;
pub mod position;
pub mod prefill;
pub mod quant;
pub mod ragged;
pub mod store;

pub use blocks::{BlockId, BlockPool, BlockPoolStats, BlockTable};
pub use generate::GenerateCache;
pub use position::{AddressRun, PositionTracker, WindowBounds, physical_address};
pub use prefill::PrefillCache;
pub use quant::{Payload, QuantizedPayload};
pub use ragged::{RaggedCache, RaggedIndex};
pub use store::CacheStore;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::config::CacheConfig;
use crate::error::{Error, Result, shape_mismatch};

/// A prefill can seed a cache only if it was encoded for the same layout.
pub(crate) fn check_prefill<R: Runtime<DType = DType>>(
    config: &CacheConfig,
    prefill: &PrefillCache<R>,
) -> Result<()> {
    if prefill.batch() != 1 {
        return Err(shape_mismatch("prefill.batch", 1, prefill.batch()));
    }
    let theirs = prefill.config();
    let layout = |c: &CacheConfig| (c.storage, c.kv_heads(), c.head_dim);
    if layout(theirs) != layout(config) {
        return Err(Error::InvalidArgument {
            arg: "prefill",
            reason: format!(
                "prefill holds {:?} x {} heads x {} but the cache holds {:?} x {} heads x {}",
                theirs.storage,
                theirs.kv_heads(),
                theirs.head_dim,
                config.storage,
                config.kv_heads(),
                config.head_dim
            ),
        });
    }
    Ok(())
}

/// Incoming keys/values must be F32 `[rows, kv_heads, tokens, head_dim]`.
pub(crate) fn check_block<R: Runtime<DType = DType>>(
    arg: &'static str,
    t: &Tensor<R>,
    expected: [usize; 4],
) -> Result<()> {
    if t.shape() != expected {
        return Err(shape_mismatch(arg, expected, t.shape()));
    }
    if t.dtype() != DType::F32 {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("expected F32 working precision, got {:?}", t.dtype()),
        });
    }
    Ok(())
}
