//! cachet error types

use std::fmt;

/// cachet result type
pub type Result<T> = std::result::Result<T, Error>;

/// cachet errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// A non-ring write would run past the end of the slot
    #[error("capacity exceeded on slot {slot}: position {requested} does not fit in capacity {capacity}")]
    CapacityExceeded {
        /// Slot (batch row) being written
        slot: usize,
        /// Logical position that does not fit
        requested: usize,
        /// Slot capacity
        capacity: usize,
    },

    /// Tensor shape or position list does not line up with the cache geometry
    #[error("shape mismatch for '{arg}': expected {expected}, got {got}")]
    ShapeMismatch {
        /// Argument name
        arg: &'static str,
        /// Expected shape or length
        expected: String,
        /// Actual shape or length
        got: String,
    },

    /// Incompatible buffer policy / attention strategy combination
    #[error("configuration conflict: {reason}")]
    ConfigConflict {
        /// Description of the conflict
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Quantization error
    #[error("quantization error: {reason}")]
    QuantError {
        /// Description of what went wrong
        reason: String,
    },

    /// Ragged block pool has no room for the requested blocks
    #[error("ragged block pool exhausted: need {requested} blocks, {free} free")]
    OutOfBlocks {
        /// Blocks needed by the write
        requested: usize,
        /// Blocks currently free
        free: usize,
    },

    /// Config file could not be read or parsed
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },
}

/// A consuming cache operation failed; the untouched cache is handed back.
///
/// Writes are all-or-nothing, so `cache` is exactly the handle that was passed
/// in. Converting into [`Error`] (e.g. with `?`) drops the cache.
pub struct Rejected<H> {
    pub error: Error,
    pub cache: H,
}

impl<H> Rejected<H> {
    pub fn new(error: Error, cache: H) -> Self {
        Self { error, cache }
    }

    /// Split into the error and the recovered cache handle.
    pub fn into_parts(self) -> (Error, H) {
        (self.error, self.cache)
    }
}

impl<H> fmt::Debug for Rejected<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<H> fmt::Display for Rejected<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache operation rejected: {}", self.error)
    }
}

impl<H> From<Rejected<H>> for Error {
    fn from(rejected: Rejected<H>) -> Self {
        rejected.error
    }
}

pub(crate) fn shape_mismatch(
    arg: &'static str,
    expected: impl fmt::Debug,
    got: impl fmt::Debug,
) -> Error {
    Error::ShapeMismatch {
        arg,
        expected: format!("{expected:?}"),
        got: format!("{got:?}"),
    }
}
