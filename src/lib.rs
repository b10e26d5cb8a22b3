//! Wallet-side transaction tracking against a remote blockchain indexer.
//!
//! This library maintains a compact, persistent database of the transactions
//! relevant to a set of watched addresses:
//!
//! - [`TxStore`] holds one row per transaction with its lifecycle state
//!   (unsent / unconfirmed / confirmed), answers balance-style queries
//!   (UTXO set, history, spend checks), and serializes to a stable binary
//!   format.
//! - [`TxUpdater`] polls a remote indexer through an [`IndexerCodec`],
//!   applies the results to the store, flags transactions whose confirmation
//!   became suspect after a chain reorganization, and reports observable
//!   events through [`WatchEvents`].
//!
//! The updater is a cooperative scheduler. The host owns the event loop: it
//! calls [`TxUpdater::wakeup`] on a timer and drives
//! [`TxUpdater::process_next`] to apply completed server queries. No tasks
//! are spawned and no callback ever blocks.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dash_watch::{IndexerCodec, TrackerConfig, TxStore, TxUpdater, WatchEvents};
//! # use dash_watch::{CodecError, CodecResult, HistoryEntry, TxPosition};
//! # use dash_watch::{Address, Network, Transaction, Txid};
//! # struct MyCodec;
//! # #[async_trait::async_trait]
//! # impl IndexerCodec for MyCodec {
//! #     async fn fetch_last_height(&self) -> CodecResult<u64> { unimplemented!() }
//! #     async fn fetch_transaction(&self, _: Txid) -> CodecResult<Transaction> { unimplemented!() }
//! #     async fn fetch_unconfirmed_transaction(&self, _: Txid) -> CodecResult<Transaction> { unimplemented!() }
//! #     async fn fetch_transaction_index(&self, _: Txid) -> CodecResult<TxPosition> { unimplemented!() }
//! #     async fn broadcast_transaction(&self, _: Transaction) -> CodecResult<()> { unimplemented!() }
//! #     async fn fetch_history(&self, _: Address) -> CodecResult<Vec<HistoryEntry>> { unimplemented!() }
//! # }
//! # struct MySink;
//! # impl WatchEvents for MySink {
//! #     fn on_add(&mut self, _: &Transaction) {}
//! #     fn on_height(&mut self, _: u64) {}
//! #     fn on_send(&mut self, _: Result<(), CodecError>, _: &Transaction) {}
//! #     fn on_fail(&mut self) {}
//! # }
//! # async fn demo(address: Address) {
//! let config = TrackerConfig::default();
//! let store = Arc::new(TxStore::new(Network::Dash, config.unconfirmed_timeout));
//! let mut updater = TxUpdater::new(store.clone(), Arc::new(MyCodec), MySink, config);
//!
//! updater.start();
//! updater.watch(address, Duration::from_secs(10));
//!
//! loop {
//!     let hint = updater.wakeup();
//!     while updater.process_next().await {}
//!     // Sleep up to `hint`, or wake early on other activity...
//!     # let _ = hint; break;
//! }
//! # }
//! ```

pub mod error;
pub mod store;
pub mod types;
pub mod updater;

mod script;

pub use error::{CodecError, CodecResult, StoreError, StoreResult};
pub use store::TxStore;
pub use types::{HistoryEntry, Timestamp, TrackerConfig, TxPosition, TxState, Utxo};
pub use updater::{IndexerCodec, TxUpdater, WatchEvents};

// Re-export commonly used dashcore types
pub use dashcore::{Address, Network, OutPoint, Transaction, Txid};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
