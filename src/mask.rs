//! Additive attention masks derived from cache geometry
//!
//! A key at logical position `l` is visible to a query at logical position `p` iff
//!
//! ```text
//! 0 <= l <= p,   p - l <= window,   p - l < capacity
//! ```
//!
//! The last condition drops entries a ring buffer has already overwritten, so
//! every strategy and update mode agrees on what a query may see. The masks
//! below differ only in how cache addresses are mapped back to logical
//! positions and in whether the current block is already resident:
//!
//! - after an eager single-token write, the newest resident position is the
//!   query itself (`x <= pos`)
//! - under lazy update (or any multi-token block) the cache holds positions up
//!   to `start - 1` (`x < pos`) and the block is appended as extra columns with
//!   a causal window mask

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::cache::position::physical_address;
use crate::config::{BufferPolicy, CacheConfig, UpdateMode};
use crate::error::{Error, Result};

/// Whether logical key position `key` is visible from query position `query`.
#[inline]
pub fn is_visible(key: i64, query: i64, window: usize, capacity: usize) -> bool {
    let dist = query - key;
    let window = i64::try_from(window).unwrap_or(i64::MAX);
    let capacity = i64::try_from(capacity).unwrap_or(i64::MAX);
    key >= 0 && dist >= 0 && dist <= window && dist < capacity
}

/// Row-major `[rows, cols]` mask: `0.0` where attention is allowed, `-inf` elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct AdditiveMask {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl AdditiveMask {
    /// Mask with every entry blocked.
    pub fn blocked(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![f32::NEG_INFINITY; rows * cols],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut visible: impl FnMut(usize, usize) -> bool) -> Self {
        let mut mask = Self::blocked(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                if visible(r, c) {
                    mask.data[r * cols + c] = 0.0;
                }
            }
        }
        mask
    }

    /// Wrap caller-supplied additive values.
    pub fn from_data(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::ShapeMismatch {
                arg: "mask",
                expected: format!("{} values", rows * cols),
                got: format!("{} values", data.len()),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn value(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn is_visible(&self, r: usize, c: usize) -> bool {
        self.value(r, c) == 0.0
    }

    /// True when no column of row `r` can be attended.
    pub fn is_row_blocked(&self, r: usize) -> bool {
        self.row(r).iter().all(|&m| m == f32::NEG_INFINITY)
    }

    /// Copy with every fully blocked row replaced by zeros.
    pub(crate) fn open_blocked_rows(&self) -> Self {
        let mut opened = self.clone();
        for r in (0..self.rows).filter(|&r| self.is_row_blocked(r)) {
            opened.data[r * self.cols..(r + 1) * self.cols].fill(0.0);
        }
        opened
    }

    /// Column indices attendable from row `r`.
    pub fn visible_columns(&self, r: usize) -> Vec<usize> {
        (0..self.cols).filter(|&c| self.is_visible(r, c)).collect()
    }

    /// Concatenate along columns: `[self | other]`.
    pub fn hstack(&self, other: &Self) -> Result<Self> {
        if self.rows != other.rows {
            return Err(Error::ShapeMismatch {
                arg: "mask",
                expected: format!("{} rows", self.rows),
                got: format!("{} rows", other.rows),
            });
        }
        let cols = self.cols + other.cols;
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(self.row(r));
            data.extend_from_slice(other.row(r));
        }
        Ok(Self {
            rows: self.rows,
            cols,
            data,
        })
    }

    /// `[1, 1, rows, cols]` tensor, broadcastable over batch and heads.
    pub fn to_tensor<R: Runtime<DType = DType>>(&self, device: &R::Device) -> Tensor<R> {
        Tensor::<R>::from_slice(&self.data, &[1, 1, self.rows, self.cols], device)
    }

    /// Stack per-row masks of equal shape into a `[B, 1, rows, cols]` tensor.
    pub fn stack<R: Runtime<DType = DType>>(masks: &[Self], device: &R::Device) -> Result<Tensor<R>> {
        let Some(first) = masks.first() else {
            return Err(Error::InvalidArgument {
                arg: "masks",
                reason: "cannot stack an empty batch of masks".into(),
            });
        };
        let mut data = Vec::with_capacity(masks.len() * first.data.len());
        for mask in masks {
            if (mask.rows, mask.cols) != (first.rows, first.cols) {
                return Err(Error::ShapeMismatch {
                    arg: "mask",
                    expected: format!("[{}, {}]", first.rows, first.cols),
                    got: format!("[{}, {}]", mask.rows, mask.cols),
                });
            }
            data.extend_from_slice(&mask.data);
        }
        Ok(Tensor::<R>::from_slice(
            &data,
            &[masks.len(), 1, first.rows, first.cols],
            device,
        ))
    }
}

/// Builds masks for one cache geometry.
#[derive(Debug, Clone, Copy)]
pub struct MaskBuilder {
    policy: BufferPolicy,
    capacity: usize,
    window: usize,
    update: UpdateMode,
}

impl MaskBuilder {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            policy: config.policy,
            capacity: config.capacity,
            window: config.window(),
            update: config.update,
        }
    }

    /// Decode mask over the `capacity` cache addresses for a query at `cursor`.
    ///
    /// Under eager update the token at `cursor` has already been written and
    /// its own address is visible. Under lazy update it has not, so only
    /// positions strictly before `cursor` are.
    pub fn build(
        capacity: usize,
        cursor: usize,
        window_len: usize,
        policy: BufferPolicy,
        update: UpdateMode,
    ) -> Result<AdditiveMask> {
        if capacity == 0 {
            return Err(Error::InvalidArgument {
                arg: "capacity",
                reason: "must be > 0".into(),
            });
        }
        if policy == BufferPolicy::LeftAligned && cursor >= capacity {
            return Err(Error::CapacityExceeded {
                slot: 0,
                requested: cursor,
                capacity,
            });
        }
        let builder = Self {
            policy,
            capacity,
            window: window_len,
            update,
        };
        let last = match update {
            UpdateMode::Eager => Some(cursor),
            UpdateMode::Lazy => cursor.checked_sub(1),
        };
        Ok(builder.cache_mask(&[cursor], last))
    }

    /// Mask over cache addresses when logical positions `..=last` have been written.
    ///
    /// `last = None` means the slot is empty.
    pub fn cache_mask(&self, queries: &[usize], last: Option<usize>) -> AdditiveMask {
        let Some(last) = last else {
            return AdditiveMask::blocked(queries.len(), self.capacity);
        };
        let logical: Vec<i64> = (0..self.capacity)
            .map(|x| self.logical_at(x, last))
            .collect();
        tracing::trace!(
            queries = queries.len(),
            last,
            capacity = self.capacity,
            "building cache mask"
        );
        AdditiveMask::from_fn(queries.len(), self.capacity, |r, c| {
            is_visible(logical[c], queries[r] as i64, self.window, self.capacity)
        })
    }

    /// Causal window mask among the tokens of one block.
    pub fn block_mask(&self, queries: &[usize]) -> AdditiveMask {
        AdditiveMask::from_fn(queries.len(), queries.len(), |r, c| {
            is_visible(queries[c] as i64, queries[r] as i64, self.window, self.capacity)
        })
    }

    /// Mask for one step of `queries` against a slot's cache.
    ///
    /// `resident` says whether the block is already written to the cache. It
    /// is true only for an eager single-token decode; every other step attends
    /// over `[cache | block]`.
    pub fn step_mask(&self, queries: &[usize], resident: bool) -> Result<AdditiveMask> {
        let Some(&first) = queries.first() else {
            return Err(Error::InvalidArgument {
                arg: "queries",
                reason: "a step needs at least one query position".into(),
            });
        };
        if resident {
            let last = queries.iter().copied().max().unwrap_or(first);
            return Ok(self.cache_mask(queries, Some(last)));
        }
        self.cache_mask(queries, first.checked_sub(1))
            .hstack(&self.block_mask(queries))
    }

    /// Whether an eager write lands before this step's attention read.
    pub fn is_resident(&self, num_tokens: usize) -> bool {
        self.update == UpdateMode::Eager && num_tokens == 1
    }

    /// Prefill mask: every cached position left of the block (from `start`)
    /// plus causal attention within the block.
    ///
    /// Columns cover logical positions `start..=queries.last()`.
    pub fn prefill_mask(&self, start: usize, queries: &[usize]) -> AdditiveMask {
        let end = queries.last().map_or(start, |&p| p + 1);
        AdditiveMask::from_fn(queries.len(), end.saturating_sub(start), |r, c| {
            is_visible((start + c) as i64, queries[r] as i64, self.window, self.capacity)
        })
    }

    /// Mask over a left-aligned sequence of `len` keys (ragged gathers).
    pub fn sequence_mask(&self, queries: &[usize], len: usize) -> AdditiveMask {
        AdditiveMask::from_fn(queries.len(), len, |r, c| {
            is_visible(c as i64, queries[r] as i64, self.window, self.capacity)
        })
    }

    // Logical position stored at address `x` when `last` is the newest resident one.
    fn logical_at(&self, x: usize, last: usize) -> i64 {
        match self.policy {
            BufferPolicy::Ring => {
                let back = (physical_address(self.policy, self.capacity, last) as i64 - x as i64)
                    .rem_euclid(self.capacity as i64);
                last as i64 - back
            }
            BufferPolicy::LeftAligned => {
                if x <= last {
                    x as i64
                } else {
                    -1
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible(mask: &AdditiveMask) -> Vec<usize> {
        mask.visible_columns(0)
    }

    #[test]
    fn test_ring_eager_includes_self() {
        let mask = MaskBuilder::build(8, 3, 4, BufferPolicy::Ring, UpdateMode::Eager).unwrap();
        assert_eq!(visible(&mask), vec![0, 1, 2, 3]);
        for x in 4..8 {
            assert_eq!(mask.value(0, x), f32::NEG_INFINITY);
        }
    }

    #[test]
    fn test_lazy_excludes_self() {
        let mask = MaskBuilder::build(8, 3, 4, BufferPolicy::Ring, UpdateMode::Lazy).unwrap();
        assert_eq!(visible(&mask), vec![0, 1, 2]);

        let mask =
            MaskBuilder::build(8, 3, 4, BufferPolicy::LeftAligned, UpdateMode::Lazy).unwrap();
        assert_eq!(visible(&mask), vec![0, 1, 2]);
    }

    #[test]
    fn test_window_lower_bound() {
        // pos 6, w 2: logical 4..=6
        let mask = MaskBuilder::build(8, 6, 2, BufferPolicy::Ring, UpdateMode::Eager).unwrap();
        assert_eq!(visible(&mask), vec![4, 5, 6]);
    }

    #[test]
    fn test_ring_wraparound_addresses() {
        // pos 10 in capacity 8 lives at address 2; window 3 covers 7..=10
        let mask = MaskBuilder::build(8, 10, 3, BufferPolicy::Ring, UpdateMode::Eager).unwrap();
        assert_eq!(visible(&mask), vec![0, 1, 2, 7]);
    }

    #[test]
    fn test_ring_full_window_drops_overwritten() {
        // window >= capacity: the entry for pos - capacity is already gone
        let mask = MaskBuilder::build(4, 9, 4, BufferPolicy::Ring, UpdateMode::Eager).unwrap();
        assert_eq!(visible(&mask).len(), 4);
        let mask = MaskBuilder::build(4, 9, 4, BufferPolicy::Ring, UpdateMode::Lazy).unwrap();
        // lazy: 6, 7, 8 resident and visible; address of 5 is stale for pos 9
        assert_eq!(visible(&mask), vec![0, 2, 3]);
    }

    #[test]
    fn test_left_aligned_overflow() {
        let err =
            MaskBuilder::build(4, 4, 4, BufferPolicy::LeftAligned, UpdateMode::Eager).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested: 4, .. }));
    }

    #[test]
    fn test_empty_cache_lazy_first_token() {
        let mask = MaskBuilder::build(4, 0, 4, BufferPolicy::Ring, UpdateMode::Lazy).unwrap();
        assert!(visible(&mask).is_empty());
    }

    #[test]
    fn test_step_mask_appends_block() {
        let config = crate::config::CacheConfig::new(1, 1, 4, 8).with_window(8);
        let builder = MaskBuilder::new(&config);
        let mask = builder.step_mask(&[3, 4], false).unwrap();
        assert_eq!(mask.cols(), 10);
        // cache part: 0..=2; block part: causal
        assert_eq!(mask.visible_columns(0), vec![0, 1, 2, 8]);
        assert_eq!(mask.visible_columns(1), vec![0, 1, 2, 8, 9]);
    }

    #[test]
    fn test_prefill_mask_is_causal_with_prefix() {
        let config = crate::config::CacheConfig::new(1, 1, 4, 16);
        let builder = MaskBuilder::new(&config);
        let mask = builder.prefill_mask(0, &[2, 3, 4]);
        assert_eq!(mask.cols(), 5);
        assert_eq!(mask.visible_columns(0), vec![0, 1, 2]);
        assert_eq!(mask.visible_columns(2), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_hstack_row_mismatch() {
        let a = AdditiveMask::blocked(2, 3);
        let b = AdditiveMask::blocked(1, 3);
        assert!(a.hstack(&b).is_err());
    }

    #[test]
    fn test_huge_window_is_unbounded() {
        let window = usize::MAX;
        assert!(is_visible(0, 5, window, 8));
        assert!(is_visible(5, 5, window, 8));
        assert!(!is_visible(0, 8, window, 8));

        let config = CacheConfig::new(1, 1, 4, 8).with_window(usize::MAX);
        let mask = MaskBuilder::new(&config).cache_mask(&[3], Some(3));
        assert_eq!(mask.visible_columns(0), vec![0, 1, 2, 3]);
    }
}
