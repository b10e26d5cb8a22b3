//! Callbacks through which the updater reports observable events.

use dashcore::Transaction;

use crate::error::CodecError;

/// Host-side sink for updater events.
///
/// All callbacks are invoked synchronously from within updater calls, on the
/// thread driving the updater. Implementations must not block and must not
/// re-enter the updater.
pub trait WatchEvents: Send {
    /// A transaction was inserted into the database.
    fn on_add(&mut self, tx: &Transaction);

    /// A new block height was observed on the server.
    fn on_height(&mut self, height: u64);

    /// A broadcast attempt finished. On failure the transaction has been
    /// forgotten; re-issue the send to retry.
    fn on_send(&mut self, result: Result<(), CodecError>, tx: &Transaction);

    /// All outstanding address and transaction queries have drained, so
    /// balances computed from the database are now as current as the server
    /// allows.
    fn on_quiet(&mut self) {}

    /// The server reported at least one failure since the last wakeup.
    fn on_fail(&mut self);
}
