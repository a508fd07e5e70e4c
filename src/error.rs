//! # Status Codes
//!
//! Every dictionary operation resolves to one of a fixed set of status codes
//! with stable semantics. Success is `Ok(..)`; everything else is a
//! [`DictError`] variant. Two variants are request outcomes rather than
//! faults and callers are expected to match on them:
//!
//! - [`DictError::InDict`]: a non-overwriting insert hit an existing entry,
//!   or a parent-storing lookup reached its match.
//! - [`DictError::TryAgain`]: a reader observed a concurrent writer
//!   publication and the walk must be restarted. The engine retries
//!   internally before surfacing this.
//!
//! Storage-layer internals report failures as `eyre::Report` with path and
//! offset context; they are folded into the coarse codes here at the
//! dictionary boundary so that the wire semantics stay fixed while logs keep
//! the detail.

use thiserror::Error;

/// Result alias used across the dictionary layer.
pub type Result<T> = std::result::Result<T, DictError>;

/// Stable status codes for dictionary operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DictError {
    /// The store handle never reached a usable state.
    #[error("store not initialized")]
    NotInitialized,

    /// The operation requires a different access mode (e.g. writer-only).
    #[error("operation not allowed in this access mode")]
    NotAllowed,

    /// Malformed argument, such as an empty key or missing option flag.
    #[error("invalid argument")]
    InvalidArg,

    /// A configured size is outside the supported range.
    #[error("invalid size")]
    InvalidSize,

    /// Key or value exceeds its hard maximum.
    #[error("key or value length out of bound")]
    OutOfBound,

    /// A read from a mapped arena returned fewer bytes than required.
    #[error("short read from arena")]
    ReadError,

    /// The caller-side output buffer could not grow.
    #[error("output buffer allocation failed")]
    NoMemory,

    /// The arena could not reserve space for a buffer.
    #[error("arena allocation failed: {0}")]
    AllocationError(String),

    /// Mapping or remapping a store file failed.
    #[error("memory mapping failed: {0}")]
    MmapFailed(String),

    /// Another live writer already holds the store.
    #[error("another writer holds the store")]
    WriterExist,

    /// The process-shared rwlock could not be initialized or acquired.
    #[error("shared mutex operation failed")]
    MutexError,

    /// Outcome: the key is already present (insert without overwrite), or a
    /// parent-storing lookup reached its match.
    #[error("key already in store")]
    InDict,

    /// Outcome: the key is not present.
    #[error("key not found")]
    NotExist,

    /// Outcome: a concurrent writer publication invalidated the walk.
    #[error("concurrent modification, retry")]
    TryAgain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes_compare_by_kind() {
        assert_eq!(DictError::InDict, DictError::InDict);
        assert_ne!(DictError::InDict, DictError::NotExist);
    }

    #[test]
    fn payload_variants_carry_detail_in_display() {
        let err = DictError::MmapFailed("radix.idx: permission denied".into());

        assert_eq!(
            err.to_string(),
            "memory mapping failed: radix.idx: permission denied"
        );
    }

    #[test]
    fn codes_are_cloneable_for_retry_loops() {
        let err = DictError::TryAgain;
        let copy = err.clone();

        assert_eq!(err, copy);
    }
}
