//! The asynchronous query surface expected from the indexer transport.

use async_trait::async_trait;
use dashcore::{Address, Transaction, Txid};

use crate::error::CodecResult;
use crate::types::{HistoryEntry, TxPosition};

/// Request/reply facade over a remote blockchain indexer.
///
/// Implementations wrap whatever wire protocol the host speaks. Every
/// operation either produces a typed success value or a [`CodecError`]
/// the updater treats as opaque.
///
/// [`CodecError`]: crate::error::CodecError
#[async_trait]
pub trait IndexerCodec: Send + Sync {
    /// Height of the best block the indexer knows about.
    async fn fetch_last_height(&self) -> CodecResult<u64>;

    /// Fetch a transaction expected to be in a block.
    async fn fetch_transaction(&self, txid: Txid) -> CodecResult<Transaction>;

    /// Fetch a transaction from the indexer's memory pool.
    async fn fetch_unconfirmed_transaction(&self, txid: Txid) -> CodecResult<Transaction>;

    /// Locate a transaction within the chain.
    ///
    /// An error means the indexer cannot place the transaction in a block.
    async fn fetch_transaction_index(&self, txid: Txid) -> CodecResult<TxPosition>;

    /// Submit a transaction to the network.
    async fn broadcast_transaction(&self, tx: Transaction) -> CodecResult<()>;

    /// Fetch the known history rows for an address.
    async fn fetch_history(&self, address: Address) -> CodecResult<Vec<HistoryEntry>>;
}
