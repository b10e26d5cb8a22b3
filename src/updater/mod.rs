//! The polling engine that drives the database toward the indexer's view.
//!
//! [`TxUpdater`] is a cooperative scheduler: it only does work when the host
//! invokes [`TxUpdater::wakeup`], or when a previously issued codec request
//! completes inside [`TxUpdater::process_next`]. It never spawns tasks and
//! never blocks; the host owns the loop and multiplexes the updater with its
//! other event sources.

mod codec;
mod events;
#[cfg(test)]
mod updater_test;

pub use codec::IndexerCodec;
pub use events::WatchEvents;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashcore::{Address, Transaction, Txid};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::CodecResult;
use crate::store::TxStore;
use crate::types::{HistoryEntry, TrackerConfig, TxPosition, TxState};

/// Polling bookkeeping for one watched address.
struct AddressEntry {
    poll_interval: Duration,
    last_check: Instant,
}

/// Outcome of one in-flight codec request, tagged with its request context.
enum Completion {
    Height(CodecResult<u64>),
    Tx {
        txid: Txid,
        want_inputs: bool,
        mempool: bool,
        result: CodecResult<Transaction>,
    },
    Index {
        txid: Txid,
        result: CodecResult<TxPosition>,
    },
    Broadcast {
        tx: Transaction,
        result: CodecResult<()>,
    },
    History {
        address: Address,
        result: CodecResult<Vec<HistoryEntry>>,
    },
}

/// Synchronizes a [`TxStore`] with a remote blockchain indexer.
pub struct TxUpdater<E: WatchEvents> {
    store: Arc<TxStore>,
    codec: Arc<dyn IndexerCodec>,
    events: E,
    config: TrackerConfig,

    /// Watched addresses and their polling cadence.
    addresses: HashMap<Address, AddressEntry>,

    /// Sticky server-failure flag, surfaced once per wakeup.
    failed: bool,

    /// Outstanding address-history and transaction-fetch queries. The
    /// descent to zero fires the quiet event.
    queued_queries: usize,

    /// Outstanding index-resolution queries; batches are serialized on this.
    queued_get_indices: usize,

    last_wakeup: Instant,

    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl<E: WatchEvents> TxUpdater<E> {
    pub fn new(
        store: Arc<TxStore>,
        codec: Arc<dyn IndexerCodec>,
        events: E,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store,
            codec,
            events,
            config,
            addresses: HashMap::new(),
            failed: false,
            queued_queries: 0,
            queued_get_indices: 0,
            last_wakeup: Instant::now(),
            inflight: FuturesUnordered::new(),
        }
    }

    /// Kick off the initial synchronization pass. Call once after
    /// construction (and after any [`TxStore::load`]).
    ///
    /// Checks the chain height, re-resolves the block index of every
    /// transaction not yet confirmed, sweeps fork-flagged rows, and transmits
    /// every unsent transaction.
    pub fn start(&mut self) {
        self.get_height();

        for txid in self.store.unconfirmed_txids() {
            self.get_index(txid);
        }
        self.queue_get_indices();

        for tx in self.store.unsent_txs() {
            self.send_tx(tx);
        }
    }

    /// Watch an address, polling its history at least every `poll_interval`.
    ///
    /// Re-watching an address replaces its polling cadence. A history query
    /// is dispatched immediately.
    pub fn watch(&mut self, address: Address, poll_interval: Duration) {
        tracing::debug!(%address, ?poll_interval, "watching address");
        self.addresses.insert(
            address.clone(),
            AddressEntry {
                poll_interval,
                last_check: Instant::now(),
            },
        );
        self.query_address(address);
    }

    /// Broadcast a locally authored transaction.
    ///
    /// The transaction is recorded as unsent until the server acknowledges
    /// it; a rejected broadcast forgets it again.
    pub fn send(&mut self, tx: Transaction) {
        if self.store.insert(&tx, TxState::Unsent) {
            self.events.on_add(&tx);
        }
        self.send_tx(tx);
    }

    /// Snapshot of the currently watched addresses.
    pub fn watching(&self) -> HashSet<Address> {
        self.addresses.keys().cloned().collect()
    }

    /// Number of codec requests currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Recompute timers, dispatching whatever queries are due.
    ///
    /// Returns the longest the host may sleep before calling again. The host
    /// is free to wake earlier, e.g. on socket activity.
    pub fn wakeup(&mut self) -> Duration {
        let now = Instant::now();
        let period = self.config.height_poll_interval;

        let mut elapsed = now.duration_since(self.last_wakeup);
        if elapsed >= period {
            self.get_height();
            self.last_wakeup = now;
            elapsed = Duration::ZERO;
        }
        let mut next_wakeup = period - elapsed;

        let mut due = Vec::new();
        for (address, entry) in &mut self.addresses {
            let elapsed = now.duration_since(entry.last_check);
            if elapsed >= entry.poll_interval {
                entry.last_check = now;
                next_wakeup = next_wakeup.min(entry.poll_interval);
                due.push(address.clone());
            } else {
                next_wakeup = next_wakeup.min(entry.poll_interval - elapsed);
            }
        }
        for address in due {
            self.query_address(address);
        }

        // Report the last server failure:
        if self.failed {
            self.events.on_fail();
            self.failed = false;
        }

        next_wakeup
    }

    /// Await the next codec completion and apply it to the database.
    ///
    /// Returns false immediately when no request is in flight; the host
    /// should then sleep until the next wakeup.
    pub async fn process_next(&mut self) -> bool {
        match self.inflight.next().await {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    /// Re-check a transaction the server has mentioned.
    fn watch_tx(&mut self, txid: Txid, want_inputs: bool) {
        self.store.reset_timestamp(&txid);
        if !self.store.has_tx(&txid) {
            self.get_tx(txid, want_inputs);
        } else if want_inputs {
            if let Some(tx) = self.store.get_tx(&txid) {
                self.get_inputs(&tx);
            }
        }
    }

    /// Watch the producer of each input, without recursing further.
    fn get_inputs(&mut self, tx: &Transaction) {
        for input in &tx.input {
            self.watch_tx(input.previous_output.txid, false);
        }
    }

    fn query_done(&mut self) {
        self.queued_queries -= 1;
        if self.queued_queries == 0 {
            tracing::debug!("query queue drained");
            self.events.on_quiet();
        }
    }

    /// Sweep fork-flagged rows, unless a sweep is already outstanding.
    ///
    /// Running the sweep while index queries are in flight would re-dispatch
    /// rows the current sweep is about to resolve, so batches are serialized:
    /// every index completion re-invokes this to pick up newly flagged rows.
    fn queue_get_indices(&mut self) {
        if self.queued_get_indices > 0 {
            return;
        }
        for txid in self.store.forked_txids() {
            self.get_index(txid);
        }
    }

    // - server queries --------------------

    fn get_height(&mut self) {
        tracing::debug!("requesting chain height");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            Completion::Height(codec.fetch_last_height().await)
        }));
    }

    fn get_tx(&mut self, txid: Txid, want_inputs: bool) {
        self.queued_queries += 1;
        tracing::debug!(%txid, "requesting transaction");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            let result = codec.fetch_transaction(txid).await;
            Completion::Tx {
                txid,
                want_inputs,
                mempool: false,
                result,
            }
        }));
    }

    fn get_tx_mem(&mut self, txid: Txid, want_inputs: bool) {
        self.queued_queries += 1;
        tracing::debug!(%txid, "requesting mempool transaction");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            let result = codec.fetch_unconfirmed_transaction(txid).await;
            Completion::Tx {
                txid,
                want_inputs,
                mempool: true,
                result,
            }
        }));
    }

    fn get_index(&mut self, txid: Txid) {
        self.queued_get_indices += 1;
        tracing::debug!(%txid, "requesting transaction index");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            let result = codec.fetch_transaction_index(txid).await;
            Completion::Index { txid, result }
        }));
    }

    fn send_tx(&mut self, tx: Transaction) {
        tracing::debug!(txid = %tx.txid(), "broadcasting transaction");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            let result = codec.broadcast_transaction(tx.clone()).await;
            Completion::Broadcast { tx, result }
        }));
    }

    fn query_address(&mut self, address: Address) {
        self.queued_queries += 1;
        tracing::debug!(%address, "requesting address history");
        let codec = Arc::clone(&self.codec);
        self.inflight.push(Box::pin(async move {
            let result = codec.fetch_history(address.clone()).await;
            Completion::History { address, result }
        }));
    }

    // - completion handlers ----------------

    fn apply(&mut self, completion: Completion) {
        match completion {
            Completion::Height(Ok(height)) => {
                if height != self.store.last_height() {
                    tracing::debug!(height, "chain height advanced");
                    self.store.at_height(height);
                    self.events.on_height(height);

                    // Anything not yet confirmed may be in the new block:
                    for txid in self.store.unconfirmed_txids() {
                        self.get_index(txid);
                    }
                    self.queue_get_indices();
                }
            }
            Completion::Height(Err(error)) => {
                tracing::warn!(%error, "height query failed");
                self.failed = true;
            }
            Completion::Tx {
                txid,
                want_inputs,
                mempool,
                result,
            } => match result {
                Ok(tx) => {
                    assert_eq!(
                        txid,
                        tx.txid(),
                        "indexer returned a transaction with a mismatched hash"
                    );
                    if self.store.insert(&tx, TxState::Unconfirmed) {
                        self.events.on_add(&tx);
                    }
                    if want_inputs {
                        self.get_inputs(&tx);
                    }
                    self.get_index(txid);
                    self.query_done();
                }
                Err(error) if !mempool => {
                    // Not in a block; it may still be in the mempool. The
                    // fallback is dispatched before this query is retired so
                    // the quiet edge cannot fire in between.
                    tracing::debug!(%txid, %error, "transaction not found; trying the mempool");
                    self.get_tx_mem(txid, want_inputs);
                    self.query_done();
                }
                Err(error) => {
                    tracing::warn!(%txid, %error, "mempool transaction query failed");
                    self.failed = true;
                    self.query_done();
                }
            },
            Completion::Index { txid, result } => {
                match result {
                    Ok(position) => self.store.confirmed(&txid, position.height),
                    // The indexer cannot place it in a block:
                    Err(_) => self.store.unconfirmed(&txid),
                }
                self.queued_get_indices -= 1;
                self.queue_get_indices();
            }
            Completion::Broadcast { tx, result } => match result {
                Ok(()) => {
                    self.store.unconfirmed(&tx.txid());
                    self.events.on_send(Ok(()), &tx);
                }
                Err(error) => {
                    tracing::warn!(txid = %tx.txid(), %error, "broadcast rejected");
                    self.store.forget(&tx.txid());
                    self.events.on_send(Err(error), &tx);
                }
            },
            Completion::History { address, result } => {
                match result {
                    Ok(entries) => {
                        tracing::debug!(%address, entries = entries.len(), "received address history");
                        for entry in entries {
                            self.watch_tx(entry.output.txid, true);
                            if let Some(spend) = entry.spend {
                                self.watch_tx(spend.txid, true);
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%address, %error, "address history query failed");
                        self.failed = true;
                    }
                }
                self.query_done();
            }
        }
    }
}
