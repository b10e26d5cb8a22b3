//! Error types for the transaction tracker.

use thiserror::Error;

/// Failures decoding a persisted transaction database blob.
///
/// A `load` that returns any of these leaves the store contents untouched.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown magic bytes: {0:#010x}")]
    BadMagic(u32),

    #[error("unexpected row tag: {0:#04x}")]
    BadRowTag(u8),

    #[error("unknown transaction state: {0}")]
    BadState(u8),

    #[error("malformed transaction: {0}")]
    BadTransaction(#[from] dashcore::consensus::encode::Error),

    #[error("truncated input")]
    Truncated,
}

/// Opaque failure reported by the remote indexer or its transport.
///
/// The updater does not interpret these beyond "this request failed"; a
/// failed confirmed-transaction fetch falls back to the mempool, and a failed
/// index lookup means the transaction is not in a block.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("not found")]
    NotFound,

    #[error("server failure: {0}")]
    Server(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Type alias for store persistence results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for codec operation results.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
