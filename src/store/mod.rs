//! The transaction database.
//!
//! [`TxStore`] is the single source of truth for tracked transactions and
//! their lifecycle state. It maps transaction ids to rows carrying the full
//! transaction plus lifecycle metadata, derives the unspent-output set from
//! the row map, and detects likely chain reorganizations by flagging rows
//! whose confirmation height has become suspect.
//!
//! All operations take a single store-wide lock for their full duration.
//! Bulk accessors snapshot matching rows and return owned collections, so no
//! caller ever runs with the lock held.

mod persist;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use dashcore::{Address, Network, OutPoint, Transaction, Txid};
use parking_lot::Mutex;

use crate::script;
use crate::types::{Timestamp, TxState, Utxo};

/// A single row in the transaction database.
#[derive(Debug, Clone)]
struct TxRow {
    /// The transaction itself.
    tx: Transaction,

    /// Lifecycle state.
    state: TxState,

    /// Containing block height; meaningful only when confirmed.
    block_height: u64,

    /// Last time the transaction was inserted or re-reported by the server.
    /// Drives garbage collection of stale unconfirmed rows.
    timestamp: Timestamp,

    /// The transaction is certainly in a block, but there is some question
    /// whether that block is still on the main chain.
    need_check: bool,
}

#[derive(Default)]
struct StoreInner {
    rows: HashMap<Txid, TxRow>,
    last_height: u64,
}

/// Thread-safe database of tracked transactions.
pub struct TxStore {
    network: Network,
    unconfirmed_timeout: Duration,
    inner: Mutex<StoreInner>,
}

impl TxStore {
    /// Create an empty store.
    ///
    /// `unconfirmed_timeout` is how long an unconfirmed transaction may go
    /// unseen before serialized snapshots stop carrying it.
    pub fn new(network: Network, unconfirmed_timeout: Duration) -> Self {
        Self {
            network,
            unconfirmed_timeout,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Network used for address extraction.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Highest block height observed from the server.
    pub fn last_height(&self) -> u64 {
        self.inner.lock().last_height
    }

    /// Whether the store contains a transaction.
    pub fn has_tx(&self, txid: &Txid) -> bool {
        self.inner.lock().rows.contains_key(txid)
    }

    /// Fetch a transaction from the store.
    pub fn get_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.inner.lock().rows.get(txid).map(|row| row.tx.clone())
    }

    /// A transaction's confirmation height, or 0 if it is absent or not in a
    /// block.
    pub fn get_tx_height(&self, txid: &Txid) -> u64 {
        let inner = self.inner.lock();
        match inner.rows.get(txid) {
            Some(row) if row.state == TxState::Confirmed => row.block_height,
            _ => 0,
        }
    }

    /// Whether every input of the transaction spends from `addresses`.
    ///
    /// Returns false if the transaction is absent, or if any input script
    /// does not resolve to an address.
    pub fn is_spend(&self, txid: &Txid, addresses: &HashSet<Address>) -> bool {
        let inner = self.inner.lock();
        let Some(row) = inner.rows.get(txid) else {
            return false;
        };
        row.tx.input.iter().all(|input| {
            script::input_address(&input.script_sig, self.network)
                .is_some_and(|address| addresses.contains(&address))
        })
    }

    /// Whether any tracked transaction pays this address.
    pub fn has_history(&self, address: &Address) -> bool {
        let inner = self.inner.lock();
        inner.rows.values().any(|row| {
            row.tx.output.iter().any(|output| {
                script::output_address(&output.script_pubkey, self.network).as_ref()
                    == Some(address)
            })
        })
    }

    /// All unspent outputs in the store.
    ///
    /// An output is unspent iff no tracked transaction's input references it.
    pub fn get_utxos(&self) -> Vec<Utxo> {
        self.inner.lock().utxos()
    }

    /// Unspent outputs paying one of the given addresses.
    pub fn get_utxos_for(&self, addresses: &HashSet<Address>) -> Vec<Utxo> {
        let inner = self.inner.lock();
        let mut utxos = inner.utxos();
        utxos.retain(|utxo| {
            inner
                .rows
                .get(&utxo.outpoint.txid)
                .and_then(|row| row.tx.output.get(utxo.outpoint.vout as usize))
                .and_then(|output| script::output_address(&output.script_pubkey, self.network))
                .is_some_and(|address| addresses.contains(&address))
        });
        utxos
    }

    /// Number of transactions currently in the unconfirmed state.
    pub fn count_unconfirmed(&self) -> usize {
        let inner = self.inner.lock();
        inner.rows.values().filter(|row| row.state == TxState::Unconfirmed).count()
    }

    /// Record a new chain height and check for forks at that height.
    pub fn at_height(&self, height: u64) {
        let mut inner = self.inner.lock();
        inner.last_height = height;
        inner.check_fork(height);
    }

    /// Insert a transaction, unless its hash is already present.
    ///
    /// Returns true if the row was inserted. Existing rows are never
    /// overwritten.
    pub fn insert(&self, tx: &Transaction, state: TxState) -> bool {
        let txid = tx.txid();
        let mut inner = self.inner.lock();
        match inner.rows.entry(txid) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                tracing::trace!(%txid, ?state, "inserting transaction");
                slot.insert(TxRow {
                    tx: tx.clone(),
                    state,
                    block_height: 0,
                    timestamp: Timestamp::now(),
                    need_check: false,
                });
                true
            }
        }
    }

    /// Mark a transaction as confirmed at `block_height`.
    ///
    /// The row must exist. A row already confirmed in a *different* block
    /// means the chain has forked, so rows below the old height are flagged
    /// for re-verification first. Re-confirmation at the stored height counts
    /// as re-verification and clears the row's fork flag.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is not in the store.
    pub fn confirmed(&self, txid: &Txid, block_height: u64) {
        let mut inner = self.inner.lock();
        let (prior_state, prior_height) = inner
            .rows
            .get(txid)
            .map(|row| (row.state, row.block_height))
            .expect("confirmed: transaction not present");

        if prior_state == TxState::Confirmed && prior_height != block_height {
            tracing::debug!(
                %txid,
                prior_height,
                block_height,
                "confirmed transaction moved blocks; checking for fork"
            );
            inner.check_fork(prior_height);
        }

        let row = inner.rows.get_mut(txid).expect("row present above");
        if prior_state == TxState::Confirmed && prior_height == block_height {
            row.need_check = false;
        }
        row.state = TxState::Confirmed;
        row.block_height = block_height;
    }

    /// Mark a transaction as unconfirmed.
    ///
    /// A no-op when the transaction is absent. Leaving the confirmed state is
    /// fork evidence, so rows below the old height are flagged for
    /// re-verification. The stored block height is left in place.
    pub fn unconfirmed(&self, txid: &Txid) {
        let mut inner = self.inner.lock();
        let Some((prior_state, prior_height)) =
            inner.rows.get(txid).map(|row| (row.state, row.block_height))
        else {
            return;
        };

        if prior_state == TxState::Confirmed {
            tracing::debug!(%txid, prior_height, "confirmed transaction left a block; checking for fork");
            inner.check_fork(prior_height);
        }

        let row = inner.rows.get_mut(txid).expect("row present above");
        row.state = TxState::Unconfirmed;
        row.need_check = false;
    }

    /// Delete a transaction.
    ///
    /// This happens when the network rejects a broadcast.
    pub fn forget(&self, txid: &Txid) {
        self.inner.lock().rows.remove(txid);
    }

    /// Refresh a transaction's last-seen timestamp.
    ///
    /// Call this each time the server reports that it still sees the
    /// transaction. A no-op when the transaction is absent.
    pub fn reset_timestamp(&self, txid: &Txid) {
        if let Some(row) = self.inner.lock().rows.get_mut(txid) {
            row.timestamp = Timestamp::now();
        }
    }

    /// Ids of every transaction not yet in a block (unsent or unconfirmed).
    pub fn unconfirmed_txids(&self) -> Vec<Txid> {
        let inner = self.inner.lock();
        inner
            .rows
            .iter()
            .filter(|(_, row)| row.state != TxState::Confirmed)
            .map(|(txid, _)| *txid)
            .collect()
    }

    /// Ids of every confirmed transaction flagged for re-verification.
    pub fn forked_txids(&self) -> Vec<Txid> {
        let inner = self.inner.lock();
        inner
            .rows
            .iter()
            .filter(|(_, row)| row.state == TxState::Confirmed && row.need_check)
            .map(|(txid, _)| *txid)
            .collect()
    }

    /// Every transaction still awaiting its first broadcast.
    pub fn unsent_txs(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .rows
            .values()
            .filter(|row| row.state == TxState::Unsent)
            .map(|row| row.tx.clone())
            .collect()
    }
}

impl StoreInner {
    /// Mark transactions just below `height` as needing re-verification.
    ///
    /// The server exposes no block hashes, so on fork evidence at `height`
    /// the best candidates for re-checking are the confirmed rows at the
    /// highest tracked height below it.
    fn check_fork(&mut self, height: u64) {
        let suspect_height = self
            .rows
            .values()
            .filter(|row| row.state == TxState::Confirmed && row.block_height < height)
            .map(|row| row.block_height)
            .max()
            .unwrap_or(0);

        let mut flagged = 0usize;
        for row in self.rows.values_mut() {
            if row.state == TxState::Confirmed && row.block_height == suspect_height {
                row.need_check = true;
                flagged += 1;
            }
        }
        if flagged > 0 {
            tracing::debug!(height, suspect_height, flagged, "flagged transactions for re-verification");
        }
    }

    fn utxos(&self) -> Vec<Utxo> {
        let spent: HashSet<OutPoint> = self
            .rows
            .values()
            .flat_map(|row| row.tx.input.iter().map(|input| input.previous_output))
            .collect();

        let mut out = Vec::new();
        for (txid, row) in &self.rows {
            for (vout, output) in row.tx.output.iter().enumerate() {
                let outpoint = OutPoint {
                    txid: *txid,
                    vout: vout as u32,
                };
                if !spent.contains(&outpoint) {
                    out.push(Utxo {
                        outpoint,
                        value: output.value,
                    });
                }
            }
        }
        out
    }
}
