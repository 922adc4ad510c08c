//! Cache configuration
//!
//! One immutable [`CacheConfig`] is built per session and shared by every
//! store, mask builder and attention strategy. Cross-field consistency is
//! checked once, in [`CacheConfig::validate`].

use crate::error::{Error, Result};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// How logical positions map onto the fixed time axis of a slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// `address = position % capacity`; the oldest entries are overwritten.
    #[default]
    Ring,
    /// `address = position`; writing past capacity is an error.
    LeftAligned,
}

/// Which attention computation reads the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Dense mask + scaled dot-product attention over the whole cache.
    #[default]
    Dense,
    /// Blockwise online-softmax attention with bounded working memory.
    Flash,
    /// Paged storage shared by all sequences, resolved through block tables.
    Ragged,
}

/// When the current step's keys/values land in the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Write, then attend: the cache read already contains the new token.
    #[default]
    Eager,
    /// Attend over the prior cache state, then write.
    Lazy,
}

/// Storage precision of the cache tensors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDType {
    #[default]
    F32,
    F16,
    BF16,
    /// Symmetric int8 with one F32 scale per (batch, head, position).
    Int8,
}

impl StorageDType {
    /// numr dtype of the stored payload.
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::Int8 => DType::I8,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::Int8)
    }

    /// Bytes per stored element (scales not included).
    pub fn element_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::Int8 => 1,
        }
    }
}

/// Session-wide KV cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of sequence slots (batch rows).
    pub batch_size: usize,
    /// Query heads.
    pub num_heads: usize,

    /// KV heads (GQA when smaller than `num_heads`).
    #[serde(default)]
    pub num_kv_heads: Option<usize>,

    pub head_dim: usize,

    /// Time-axis length of each slot (max tokens per sequence for ragged).
    pub capacity: usize,

    /// Attention window; a query at `pos` sees `[pos - window, pos]`.
    #[serde(default)]
    pub window: Option<usize>,

    #[serde(default)]
    pub policy: BufferPolicy,

    #[serde(default)]
    pub attention: AttentionKind,

    #[serde(default)]
    pub update: UpdateMode,

    #[serde(default)]
    pub storage: StorageDType,

    /// Key block length processed per tile by the flash strategy.
    #[serde(default = "default_flash_block_size")]
    pub flash_block_size: usize,

    /// Tokens per physical block in the ragged pool.
    #[serde(default = "default_ragged_block_size")]
    pub ragged_block_size: usize,

    /// Physical blocks in the ragged pool; defaults to every slot at full capacity.
    #[serde(default)]
    pub ragged_num_blocks: Option<usize>,

    /// Round-trip tolerance of the storage encoding, relative to each token's max |x|.
    #[serde(default)]
    pub quant_epsilon: Option<f32>,
}

fn default_flash_block_size() -> usize {
    128
}

fn default_ragged_block_size() -> usize {
    16
}

impl CacheConfig {
    pub fn new(batch_size: usize, num_heads: usize, head_dim: usize, capacity: usize) -> Self {
        Self {
            batch_size,
            num_heads,
            num_kv_heads: None,
            head_dim,
            capacity,
            window: None,
            policy: BufferPolicy::default(),
            attention: AttentionKind::default(),
            update: UpdateMode::default(),
            storage: StorageDType::default(),
            flash_block_size: default_flash_block_size(),
            ragged_block_size: default_ragged_block_size(),
            ragged_num_blocks: None,
            quant_epsilon: None,
        }
    }

    pub fn with_num_kv_heads(mut self, num_kv_heads: usize) -> Self {
        self.num_kv_heads = Some(num_kv_heads);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_policy(mut self, policy: BufferPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attention(mut self, attention: AttentionKind) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_update(mut self, update: UpdateMode) -> Self {
        self.update = update;
        self
    }

    pub fn with_storage(mut self, storage: StorageDType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_flash_block_size(mut self, block_size: usize) -> Self {
        self.flash_block_size = block_size;
        self
    }

    pub fn with_ragged_blocks(mut self, block_size: usize, num_blocks: Option<usize>) -> Self {
        self.ragged_block_size = block_size;
        self.ragged_num_blocks = num_blocks;
        self
    }

    /// Validate and freeze the config for sharing across components.
    pub fn build(self) -> Result<Arc<Self>> {
        self.validate()?;
        tracing::debug!(
            batch_size = self.batch_size,
            capacity = self.capacity,
            policy = ?self.policy,
            attention = ?self.attention,
            update = ?self.update,
            storage = ?self.storage,
            "cache config validated"
        );
        Ok(Arc::new(self))
    }

    pub fn validate(&self) -> Result<()> {
        for (arg, value) in [
            ("batch_size", self.batch_size),
            ("num_heads", self.num_heads),
            ("head_dim", self.head_dim),
            ("capacity", self.capacity),
            ("flash_block_size", self.flash_block_size),
            ("ragged_block_size", self.ragged_block_size),
        ] {
            if value == 0 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: "must be > 0".into(),
                });
            }
        }

        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.num_heads % kv_heads != 0 {
            return Err(Error::InvalidArgument {
                arg: "num_kv_heads",
                reason: format!(
                    "num_heads ({}) must be a positive multiple of num_kv_heads ({kv_heads})",
                    self.num_heads
                ),
            });
        }

        if let Some(eps) = self.quant_epsilon.filter(|e| !(e.is_finite() && *e >= 0.0)) {
            return Err(Error::InvalidArgument {
                arg: "quant_epsilon",
                reason: format!("must be a finite non-negative number, got {eps}"),
            });
        }

        if self.attention == AttentionKind::Ragged && self.policy == BufferPolicy::Ring {
            return Err(Error::ConfigConflict {
                reason: "ragged attention resolves positions through block tables and cannot \
                         be combined with ring-buffer addressing"
                    .into(),
            });
        }

        if self.attention == AttentionKind::Ragged {
            let pool = self.ragged_pool_blocks();
            let per_seq = self.blocks_per_sequence();
            if pool < per_seq {
                return Err(Error::InvalidArgument {
                    arg: "ragged_num_blocks",
                    reason: format!(
                        "pool of {pool} blocks cannot hold one sequence of capacity {} ({per_seq} blocks)",
                        self.capacity
                    ),
                });
            }
        }

        Ok(())
    }

    /// Relative error bound of `dequantize(quantize(x))` for the configured storage.
    ///
    /// Int8 rounds to the nearest of 127 steps of the per-token max, so the bound is
    /// half a step. Float storages are bounded by their mantissa precision.
    pub fn quant_epsilon(&self) -> f32 {
        self.quant_epsilon.unwrap_or(match self.storage {
            StorageDType::F32 => 0.0,
            StorageDType::F16 => half::f16::EPSILON.to_f32() * 0.5,
            StorageDType::BF16 => half::bf16::EPSILON.to_f32() * 0.5,
            StorageDType::Int8 => 0.5 / 127.0,
        })
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    /// Query heads served by each KV head.
    pub fn kv_group_size(&self) -> usize {
        self.num_heads / self.kv_heads()
    }

    pub fn window(&self) -> usize {
        self.window.unwrap_or(self.capacity)
    }

    pub fn is_gqa(&self) -> bool {
        self.kv_heads() != self.num_heads
    }

    /// Blocks needed to hold one sequence at full capacity.
    pub fn blocks_per_sequence(&self) -> usize {
        self.capacity.div_ceil(self.ragged_block_size)
    }

    pub fn ragged_pool_blocks(&self) -> usize {
        self.ragged_num_blocks
            .unwrap_or(self.batch_size * self.blocks_per_sequence())
    }

    /// Bytes of K+V payload per cached token per layer (scales excluded).
    pub fn bytes_per_token(&self) -> usize {
        2 * self.kv_heads() * self.head_dim * self.storage.element_size()
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}
