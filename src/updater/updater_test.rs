use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashcore::hashes::Hash;
use dashcore::{
    Address, Network, OutPoint, PubkeyHash, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness,
};
use parking_lot::Mutex;

use super::{IndexerCodec, TxUpdater, WatchEvents};
use crate::error::{CodecError, CodecResult};
use crate::store::TxStore;
use crate::types::{HistoryEntry, TrackerConfig, TxPosition, TxState};

const NET: Network = Network::Regtest;

// - fixtures ---------------------------

fn test_address(tag: u8) -> Address {
    let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([tag; 20]));
    Address::from_script(&script, NET).unwrap()
}

fn build_tx(outputs: Vec<(Address, u64)>, inputs: Vec<OutPoint>) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: 0xffffffff,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .into_iter()
            .map(|(address, value)| TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            })
            .collect(),
        special_transaction_payload: None,
    }
}

fn unique_tx(tag: u32) -> Transaction {
    let mut tx = build_tx(vec![(test_address(1), 10_000)], vec![]);
    tx.lock_time = tag;
    tx
}

fn history_row(txid: Txid, spend: Option<Txid>) -> HistoryEntry {
    HistoryEntry {
        output: OutPoint {
            txid,
            vout: 0,
        },
        output_height: 0,
        value: 10_000,
        spend: spend.map(|txid| OutPoint {
            txid,
            vout: 0,
        }),
        spend_height: None,
    }
}

// - scripted codec ---------------------

/// Codec whose responses are queued up front by the test. Unscripted
/// requests answer `NotFound`. Requests are recorded for inspection.
#[derive(Default)]
struct MockCodec {
    heights: Mutex<VecDeque<CodecResult<u64>>>,
    txs: Mutex<HashMap<Txid, VecDeque<CodecResult<Transaction>>>>,
    mempool_txs: Mutex<HashMap<Txid, VecDeque<CodecResult<Transaction>>>>,
    indices: Mutex<HashMap<Txid, VecDeque<CodecResult<TxPosition>>>>,
    broadcasts: Mutex<VecDeque<CodecResult<()>>>,
    histories: Mutex<HashMap<Address, VecDeque<CodecResult<Vec<HistoryEntry>>>>>,

    tx_requests: Mutex<Vec<Txid>>,
    mempool_requests: Mutex<Vec<Txid>>,
    index_requests: Mutex<Vec<Txid>>,
}

impl MockCodec {
    fn expect_height(&self, result: CodecResult<u64>) {
        self.heights.lock().push_back(result);
    }

    fn expect_tx(&self, txid: Txid, result: CodecResult<Transaction>) {
        self.txs.lock().entry(txid).or_default().push_back(result);
    }

    fn expect_mempool_tx(&self, txid: Txid, result: CodecResult<Transaction>) {
        self.mempool_txs.lock().entry(txid).or_default().push_back(result);
    }

    fn expect_index(&self, txid: Txid, result: CodecResult<TxPosition>) {
        self.indices.lock().entry(txid).or_default().push_back(result);
    }

    fn expect_broadcast(&self, result: CodecResult<()>) {
        self.broadcasts.lock().push_back(result);
    }

    fn expect_history(&self, address: Address, result: CodecResult<Vec<HistoryEntry>>) {
        self.histories.lock().entry(address).or_default().push_back(result);
    }

    fn tx_requests(&self) -> Vec<Txid> {
        self.tx_requests.lock().clone()
    }

    fn index_requests(&self) -> Vec<Txid> {
        self.index_requests.lock().clone()
    }
}

#[async_trait]
impl IndexerCodec for MockCodec {
    async fn fetch_last_height(&self) -> CodecResult<u64> {
        self.heights.lock().pop_front().unwrap_or(Err(CodecError::NotFound))
    }

    async fn fetch_transaction(&self, txid: Txid) -> CodecResult<Transaction> {
        self.tx_requests.lock().push(txid);
        self.txs
            .lock()
            .get_mut(&txid)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(CodecError::NotFound))
    }

    async fn fetch_unconfirmed_transaction(&self, txid: Txid) -> CodecResult<Transaction> {
        self.mempool_requests.lock().push(txid);
        self.mempool_txs
            .lock()
            .get_mut(&txid)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(CodecError::NotFound))
    }

    async fn fetch_transaction_index(&self, txid: Txid) -> CodecResult<TxPosition> {
        self.index_requests.lock().push(txid);
        self.indices
            .lock()
            .get_mut(&txid)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(CodecError::NotFound))
    }

    async fn broadcast_transaction(&self, _tx: Transaction) -> CodecResult<()> {
        self.broadcasts.lock().pop_front().unwrap_or(Err(CodecError::NotFound))
    }

    async fn fetch_history(&self, address: Address) -> CodecResult<Vec<HistoryEntry>> {
        self.histories
            .lock()
            .get_mut(&address)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(CodecError::NotFound))
    }
}

// - recording sink ---------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Add(Txid),
    Height(u64),
    Send(bool, Txid),
    Quiet,
    Fail,
}

#[derive(Clone, Default)]
struct RecordingEvents(Arc<Mutex<Vec<Event>>>);

impl RecordingEvents {
    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    fn count(&self, event: &Event) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }
}

impl WatchEvents for RecordingEvents {
    fn on_add(&mut self, tx: &Transaction) {
        self.0.lock().push(Event::Add(tx.txid()));
    }

    fn on_height(&mut self, height: u64) {
        self.0.lock().push(Event::Height(height));
    }

    fn on_send(&mut self, result: Result<(), CodecError>, tx: &Transaction) {
        self.0.lock().push(Event::Send(result.is_ok(), tx.txid()));
    }

    fn on_quiet(&mut self) {
        self.0.lock().push(Event::Quiet);
    }

    fn on_fail(&mut self) {
        self.0.lock().push(Event::Fail);
    }
}

// - harness ----------------------------

fn setup(
    config: TrackerConfig,
) -> (Arc<TxStore>, Arc<MockCodec>, RecordingEvents, TxUpdater<RecordingEvents>) {
    let store = Arc::new(TxStore::new(NET, config.unconfirmed_timeout));
    let codec = Arc::new(MockCodec::default());
    let events = RecordingEvents::default();
    let updater = TxUpdater::new(store.clone(), codec.clone(), events.clone(), config);
    (store, codec, events, updater)
}

fn eager_config() -> TrackerConfig {
    // Poll the height on every wakeup.
    TrackerConfig::default().with_height_poll_interval(Duration::ZERO)
}

async fn drain(updater: &mut TxUpdater<RecordingEvents>) {
    while updater.process_next().await {}
}

// - tests ------------------------------

#[tokio::test]
async fn send_round_trip() {
    let (store, codec, events, mut updater) = setup(eager_config());
    let tx = unique_tx(1);
    let txid = tx.txid();

    codec.expect_broadcast(Ok(()));
    updater.send(tx.clone());
    assert_eq!(events.events(), vec![Event::Add(txid)]);

    assert!(updater.process_next().await);
    assert_eq!(events.count(&Event::Send(true, txid)), 1);
    assert_eq!(store.count_unconfirmed(), 1);
    assert_eq!(store.get_tx_height(&txid), 0);

    // The next height poll finds the transaction in block 100.
    codec.expect_height(Ok(100));
    codec.expect_index(
        txid,
        Ok(TxPosition {
            height: 100,
            index: 0,
        }),
    );
    updater.wakeup();
    drain(&mut updater).await;

    assert_eq!(events.count(&Event::Height(100)), 1);
    assert_eq!(store.get_tx_height(&txid), 100);
}

#[tokio::test]
async fn reorg_flag_drives_a_requery() {
    let (store, codec, events, mut updater) = setup(eager_config());
    let tx = unique_tx(2);
    let txid = tx.txid();
    store.insert(&tx, TxState::Unconfirmed);
    store.confirmed(&txid, 100);
    store.at_height(100);

    codec.expect_height(Ok(105));
    codec.expect_index(
        txid,
        Ok(TxPosition {
            height: 100,
            index: 0,
        }),
    );
    updater.wakeup();
    drain(&mut updater).await;

    assert_eq!(events.count(&Event::Height(105)), 1);
    assert_eq!(codec.index_requests(), vec![txid]);
    // Re-verified at the same height, so the flag is gone.
    assert!(store.forked_txids().is_empty());
    assert_eq!(store.get_tx_height(&txid), 100);
}

#[tokio::test]
async fn missing_transaction_falls_back_to_the_mempool() {
    let (store, codec, events, mut updater) = setup(eager_config());
    let tx = unique_tx(3);
    let txid = tx.txid();
    let address = test_address(9);

    codec.expect_history(address.clone(), Ok(vec![history_row(txid, None)]));
    // No confirmed-path script, so fetch_transaction misses; the mempool has it.
    codec.expect_mempool_tx(txid, Ok(tx.clone()));
    codec.expect_index(txid, Err(CodecError::NotFound));

    updater.watch(address, Duration::from_secs(60));
    drain(&mut updater).await;

    assert_eq!(codec.tx_requests(), vec![txid]);
    assert_eq!(events.count(&Event::Add(txid)), 1);
    assert_eq!(events.count(&Event::Quiet), 1);
    assert_eq!(store.count_unconfirmed(), 1);
}

#[tokio::test]
async fn quiet_fires_exactly_once_per_drain() {
    let (_store, codec, events, mut updater) = setup(eager_config());
    let addr_a = test_address(4);
    let addr_b = test_address(5);
    codec.expect_history(addr_a.clone(), Ok(vec![]));
    codec.expect_history(addr_b.clone(), Ok(vec![]));

    updater.watch(addr_a, Duration::from_secs(60));
    updater.watch(addr_b, Duration::from_secs(60));
    assert_eq!(updater.in_flight(), 2);

    assert!(updater.process_next().await);
    assert_eq!(events.count(&Event::Quiet), 0);

    assert!(updater.process_next().await);
    assert_eq!(events.count(&Event::Quiet), 1);

    assert!(!updater.process_next().await);
    assert_eq!(events.count(&Event::Quiet), 1);
}

#[tokio::test]
async fn rejected_broadcast_forgets_the_transaction() {
    let (store, codec, events, mut updater) = setup(eager_config());
    let tx = unique_tx(6);
    let txid = tx.txid();

    codec.expect_broadcast(Err(CodecError::Server("rejected".into())));
    updater.send(tx);
    drain(&mut updater).await;

    assert!(!store.has_tx(&txid));
    assert_eq!(events.count(&Event::Send(false, txid)), 1);
}

#[tokio::test]
async fn server_failures_coalesce_into_one_report() {
    let (_store, codec, events, mut updater) = setup(TrackerConfig::default());

    codec.expect_height(Err(CodecError::Transport("down".into())));
    updater.start();
    drain(&mut updater).await;
    assert_eq!(events.count(&Event::Fail), 0);

    updater.wakeup();
    assert_eq!(events.count(&Event::Fail), 1);

    // The flag was cleared; quiet wakeups report nothing further.
    updater.wakeup();
    assert_eq!(events.count(&Event::Fail), 1);
}

#[tokio::test]
async fn rewatching_an_address_replaces_its_cadence() {
    let (_store, codec, events, mut updater) = setup(eager_config());
    let address = test_address(7);
    codec.expect_history(address.clone(), Ok(vec![]));
    codec.expect_history(address.clone(), Ok(vec![]));

    updater.watch(address.clone(), Duration::from_secs(5));
    updater.watch(address.clone(), Duration::from_secs(7));

    assert_eq!(updater.watching(), [address].into_iter().collect::<HashSet<_>>());
    assert_eq!(updater.in_flight(), 2);

    drain(&mut updater).await;
    assert_eq!(events.count(&Event::Quiet), 1);
}

#[tokio::test]
async fn unchanged_height_is_ignored() {
    let (store, codec, events, mut updater) = setup(TrackerConfig::default());
    store.at_height(50);

    codec.expect_height(Ok(50));
    updater.start();
    drain(&mut updater).await;

    assert_eq!(events.count(&Event::Height(50)), 0);
    assert!(codec.index_requests().is_empty());
}

#[tokio::test]
async fn start_retransmits_unsent_and_reresolves_pending() {
    let (store, codec, events, mut updater) = setup(TrackerConfig::default());
    let tx = unique_tx(8);
    let txid = tx.txid();
    store.insert(&tx, TxState::Unsent);

    codec.expect_height(Ok(0));
    codec.expect_broadcast(Ok(()));
    codec.expect_index(txid, Err(CodecError::NotFound));

    updater.start();
    drain(&mut updater).await;

    assert_eq!(codec.index_requests(), vec![txid]);
    assert_eq!(events.count(&Event::Send(true, txid)), 1);
    assert_eq!(store.count_unconfirmed(), 1);
    assert!(store.unsent_txs().is_empty());
}

#[tokio::test]
async fn history_watches_both_sides_of_a_spend() {
    let (store, codec, events, mut updater) = setup(eager_config());
    let address = test_address(10);

    let funding = build_tx(vec![(address.clone(), 10_000)], vec![]);
    let funding_id = funding.txid();
    let spender = build_tx(
        vec![(test_address(11), 9_000)],
        vec![OutPoint {
            txid: funding_id,
            vout: 0,
        }],
    );
    let spender_id = spender.txid();

    codec.expect_history(address.clone(), Ok(vec![history_row(funding_id, Some(spender_id))]));
    // The funding transaction may be requested a second time while it is
    // still in flight as the spender's input.
    codec.expect_tx(funding_id, Ok(funding.clone()));
    codec.expect_tx(funding_id, Ok(funding.clone()));
    codec.expect_tx(spender_id, Ok(spender.clone()));

    updater.watch(address, Duration::from_secs(60));
    drain(&mut updater).await;

    assert!(store.has_tx(&funding_id));
    assert!(store.has_tx(&spender_id));
    assert_eq!(events.count(&Event::Add(funding_id)), 1);
    assert_eq!(events.count(&Event::Add(spender_id)), 1);
    assert_eq!(events.count(&Event::Quiet), 1);
}

#[tokio::test]
async fn input_resolution_does_not_recurse() {
    let (store, codec, _events, mut updater) = setup(eager_config());
    let address = test_address(12);

    let grandparent_id = unique_tx(20).txid();
    let parent = build_tx(
        vec![(test_address(13), 8_000)],
        vec![OutPoint {
            txid: grandparent_id,
            vout: 0,
        }],
    );
    let parent_id = parent.txid();
    let child = build_tx(
        vec![(address.clone(), 7_000)],
        vec![OutPoint {
            txid: parent_id,
            vout: 0,
        }],
    );
    let child_id = child.txid();

    codec.expect_history(address.clone(), Ok(vec![history_row(child_id, None)]));
    codec.expect_tx(child_id, Ok(child.clone()));
    codec.expect_tx(parent_id, Ok(parent.clone()));

    updater.watch(address, Duration::from_secs(60));
    drain(&mut updater).await;

    assert!(store.has_tx(&child_id));
    assert!(store.has_tx(&parent_id));
    // The parent was fetched without input resolution, so its own inputs
    // are never chased.
    assert!(!codec.tx_requests().contains(&grandparent_id));
}

#[tokio::test]
async fn wakeup_hint_is_bounded_by_the_tightest_timer() {
    let (_store, codec, _events, mut updater) = setup(TrackerConfig::default());

    let hint = updater.wakeup();
    assert!(hint <= Duration::from_secs(30));
    assert!(hint > Duration::from_secs(29));

    let address = test_address(14);
    codec.expect_history(address.clone(), Ok(vec![]));
    updater.watch(address, Duration::from_secs(5));

    let hint = updater.wakeup();
    assert!(hint <= Duration::from_secs(5));
    assert!(hint > Duration::from_secs(4));
}

#[tokio::test]
async fn index_failure_for_a_forgotten_row_is_harmless() {
    let (store, codec, _events, mut updater) = setup(TrackerConfig::default());
    let tx = unique_tx(21);
    let txid = tx.txid();
    store.insert(&tx, TxState::Unconfirmed);

    codec.expect_height(Ok(0));
    codec.expect_index(txid, Err(CodecError::NotFound));
    updater.start();

    // The row disappears while its index query is still in flight.
    store.forget(&txid);
    drain(&mut updater).await;

    assert!(!store.has_tx(&txid));
}

#[tokio::test]
#[should_panic(expected = "mismatched hash")]
async fn mismatched_transaction_hash_aborts() {
    let (_store, codec, _events, mut updater) = setup(eager_config());
    let address = test_address(15);
    let requested = unique_tx(22).txid();

    codec.expect_history(address.clone(), Ok(vec![history_row(requested, None)]));
    codec.expect_tx(requested, Ok(unique_tx(23)));

    updater.watch(address, Duration::from_secs(60));
    drain(&mut updater).await;
}
