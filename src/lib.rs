//! # cachet
//!
//! **KV cache and attention masking for autoregressive decoding on numr.**
//!
//! cachet keeps per-sequence key/value projections between forward passes and
//! hands them, windowed and masked, to attention at every step. It uses numr's
//! runtime, tensors and ops directly; nothing here reimplements tensor math.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  model layer: Q/K/V projections, RoPE (RotaryTable)      │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ AttentionInput + cache handle (moved in)
//! ┌──────────────────────────▼───────────────────────────────┐
//! │  AttentionStrategy   dense | flash | ragged              │
//! │     ├── MaskBuilder       ring / left-aligned / prefill  │
//! │     └── cache             PrefillCache, GenerateCache    │
//! │            ├── CacheStore      contiguous slots          │
//! │            ├── RaggedCache     paged blocks + tables     │
//! │            └── PositionTracker cursors, wraparound       │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ output + cache handle (moved out)
//! ```
//!
//! ## Design
//!
//! - **One config**: [`CacheConfig`] is validated once; conflicting choices
//!   (ragged attention over a ring buffer) never reach a request.
//! - **Move-in, move-out handles**: a step consumes its cache and returns it,
//!   or returns it untouched inside [`Rejected`] on failure.
//! - **Eager vs lazy**: the update mode decides whether a step reads the cache
//!   after or before its own write; both leave identical cache contents.
//! - **Storage dtype**: F32, F16, BF16 or Int8 with per-token scales; reads
//!   always come back as F32.

pub mod attention;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod layered;
pub mod mask;
pub mod rope;

pub use attention::{AttentionInput, AttentionStrategy, LayerCache};
pub use cache::{
    BlockPool, BlockTable, CacheStore, GenerateCache, Payload, PositionTracker, PrefillCache,
    QuantizedPayload, RaggedCache, RaggedIndex, WindowBounds,
};
pub use client::CacheClient;
pub use config::{AttentionKind, BufferPolicy, CacheConfig, StorageDType, UpdateMode};
pub use error::{Error, Rejected, Result};
pub use layered::LayeredCache;
pub use mask::{AdditiveMask, MaskBuilder};
pub use rope::{RotaryLayout, RotaryTable};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
