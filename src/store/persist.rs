//! Binary persistence and the operator dump for the transaction database.
//!
//! The blob layout is a stable external format. All integers are
//! little-endian; embedded transactions use the canonical consensus
//! serialization.
//!
//! ```text
//! magic        u32      0xFECDB760
//! last_height  u64
//! row*:
//!   tag        u8       0x42
//!   txid       [u8;32]  raw hash bytes
//!   tx         var      consensus serialization
//!   state      u8       0 = unsent, 1 = unconfirmed, 2 = confirmed
//!   height_or_ts u64    confirmed: block height; unconfirmed: timestamp
//!   need_check u8
//! ```
//!
//! Blobs written by the pre-timestamp format (magic `0x3EAB61C3`) are
//! accepted and load as an empty store.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};

use dashcore::consensus::encode::{self, Decodable};
use dashcore::hashes::Hash;
use dashcore::{Transaction, Txid};

use crate::error::{StoreError, StoreResult};
use crate::script;
use crate::types::{Timestamp, TxState};

use super::{TxRow, TxStore};

const MAGIC: u32 = 0xFECD_B760;
const LEGACY_MAGIC: u32 = 0x3EAB_61C3;
const ROW_TAG: u8 = 0x42;

fn state_to_wire(state: TxState) -> u8 {
    match state {
        TxState::Unsent => 0,
        TxState::Unconfirmed => 1,
        TxState::Confirmed => 2,
    }
}

fn state_from_wire(byte: u8) -> StoreResult<TxState> {
    match byte {
        0 => Ok(TxState::Unsent),
        1 => Ok(TxState::Unconfirmed),
        2 => Ok(TxState::Confirmed),
        other => Err(StoreError::BadState(other)),
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> StoreResult<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|_| StoreError::Truncated)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> StoreResult<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|_| StoreError::Truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> StoreResult<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(|_| StoreError::Truncated)?;
    Ok(u64::from_le_bytes(buf))
}

impl TxStore {
    /// Write the database to an in-memory blob.
    ///
    /// Unconfirmed transactions unseen for longer than the store's timeout
    /// are omitted; everything else round-trips losslessly.
    pub fn serialize(&self) -> Vec<u8> {
        let now = Timestamp::now();
        let inner = self.inner.lock();

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&inner.last_height.to_le_bytes());

        for (txid, row) in &inner.rows {
            if row.state == TxState::Unconfirmed
                && row.timestamp.is_stale(self.unconfirmed_timeout, now)
            {
                tracing::debug!(%txid, "dropping stale unconfirmed transaction from snapshot");
                continue;
            }

            out.push(ROW_TAG);
            out.extend_from_slice(&txid.to_byte_array());
            out.extend_from_slice(&encode::serialize(&row.tx));
            out.push(state_to_wire(row.state));
            let height_or_ts = match row.state {
                TxState::Confirmed => row.block_height,
                TxState::Unconfirmed => row.timestamp.as_secs(),
                TxState::Unsent => 0,
            };
            out.extend_from_slice(&height_or_ts.to_le_bytes());
            out.push(row.need_check as u8);
        }
        out
    }

    /// Reconstitute the database from an in-memory blob.
    ///
    /// All-or-nothing: on any error the store is left unchanged. On success
    /// the previous contents are replaced. Loaded rows are stamped with the
    /// current time, except unconfirmed rows, which keep their persisted
    /// timestamp.
    pub fn load(&self, data: &[u8]) -> StoreResult<()> {
        let now = Timestamp::now();
        let mut cursor = Cursor::new(data);

        let magic = read_u32(&mut cursor)?;
        if magic == LEGACY_MAGIC {
            // The old format carried nothing worth migrating.
            let mut inner = self.inner.lock();
            inner.rows.clear();
            inner.last_height = 0;
            return Ok(());
        }
        if magic != MAGIC {
            return Err(StoreError::BadMagic(magic));
        }

        let last_height = read_u64(&mut cursor)?;

        let mut rows = HashMap::new();
        while (cursor.position() as usize) < data.len() {
            let tag = read_u8(&mut cursor)?;
            if tag != ROW_TAG {
                return Err(StoreError::BadRowTag(tag));
            }

            let mut hash = [0u8; 32];
            cursor.read_exact(&mut hash).map_err(|_| StoreError::Truncated)?;
            let txid = Txid::from_byte_array(hash);

            let tx = Transaction::consensus_decode(&mut cursor)?;
            let state = state_from_wire(read_u8(&mut cursor)?)?;
            let height_or_ts = read_u64(&mut cursor)?;
            let need_check = read_u8(&mut cursor)? != 0;

            rows.insert(
                txid,
                TxRow {
                    tx,
                    state,
                    block_height: if state == TxState::Confirmed {
                        height_or_ts
                    } else {
                        0
                    },
                    timestamp: if state == TxState::Unconfirmed {
                        Timestamp::new(height_or_ts)
                    } else {
                        now
                    },
                    need_check,
                },
            );
        }

        let mut inner = self.inner.lock();
        inner.rows = rows;
        inner.last_height = last_height;
        tracing::debug!(rows = inner.rows.len(), last_height, "loaded transaction database");
        Ok(())
    }

    /// Debug dump of the database contents.
    ///
    /// Human-readable and unstable; for operator inspection only.
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        let inner = self.inner.lock();
        writeln!(out, "height: {}", inner.last_height)?;
        for (txid, row) in &inner.rows {
            writeln!(out, "================")?;
            writeln!(out, "hash: {txid}")?;
            match row.state {
                TxState::Unsent => writeln!(out, "state: unsent")?,
                TxState::Unconfirmed => {
                    writeln!(out, "state: unconfirmed")?;
                    writeln!(out, "timestamp: {}", row.timestamp.as_secs())?;
                }
                TxState::Confirmed => {
                    writeln!(out, "state: confirmed")?;
                    writeln!(out, "height: {}", row.block_height)?;
                    if row.need_check {
                        writeln!(out, "needs check.")?;
                    }
                }
            }
            for input in &row.tx.input {
                match script::input_address(&input.script_sig, self.network) {
                    Some(address) => writeln!(out, "input: {address}")?,
                    None => writeln!(out, "input: ???")?,
                }
            }
            for output in &row.tx.output {
                match script::output_address(&output.script_pubkey, self.network) {
                    Some(address) => writeln!(out, "output: {address} {}", output.value)?,
                    None => writeln!(out, "output: ??? {}", output.value)?,
                }
            }
        }
        Ok(())
    }
}
