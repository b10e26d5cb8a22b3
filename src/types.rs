//! Common type definitions for the transaction tracker.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashcore::OutPoint;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    /// Authored locally, not yet acknowledged by any server.
    Unsent,

    /// Seen by the network (mempool) but not yet in a block.
    Unconfirmed,

    /// Included in a block at a known height.
    Confirmed,
}

/// A Unix timestamp in seconds since epoch (UTC).
///
/// Expiry arithmetic takes `now` explicitly so callers (and tests) control
/// the reference point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(secs: u64) -> Self {
        Self(secs)
    }

    /// Get the current system time as a `Timestamp`.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_secs();
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Whether this timestamp is older than `timeout` relative to `now`.
    pub fn is_stale(&self, timeout: Duration, now: Timestamp) -> bool {
        now.0 > self.0.saturating_add(timeout.as_secs())
    }
}

/// Position of a transaction within the chain, as reported by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPosition {
    /// Height of the containing block.
    pub height: u64,

    /// Index of the transaction within that block.
    pub index: u64,
}

/// One row of an address history query.
///
/// Each entry describes an output paying the queried address, and the input
/// spending that output if the indexer knows of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The output paying the address.
    pub output: OutPoint,

    /// Height of the block containing the output, or 0 if unconfirmed.
    pub output_height: u64,

    /// Value of the output in satoshis.
    pub value: u64,

    /// The outpoint of the spending input, if the output has been spent.
    pub spend: Option<OutPoint>,

    /// Height of the block containing the spend, if confirmed.
    pub spend_height: Option<u64>,
}

/// An unspent transaction output derived from the tracked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// The outpoint (transaction hash + output index).
    pub outpoint: OutPoint,

    /// Value of the output in satoshis.
    pub value: u64,
}

/// Runtime configuration for the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum delay between chain-height polls.
    pub height_poll_interval: Duration,

    /// Age beyond which an unseen unconfirmed transaction is dropped from
    /// serialized snapshots.
    pub unconfirmed_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            height_poll_interval: Duration::from_secs(30),
            unconfirmed_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl TrackerConfig {
    /// Set the delay between chain-height polls.
    pub fn with_height_poll_interval(mut self, interval: Duration) -> Self {
        self.height_poll_interval = interval;
        self
    }

    /// Set the unconfirmed-transaction retention window.
    pub fn with_unconfirmed_timeout(mut self, timeout: Duration) -> Self {
        self.unconfirmed_timeout = timeout;
        self
    }
}
