// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::LedgerError;
use meridian_crypto::{HalfSha512, Hash160, Hash256, HashPrefix};
use meridian_shamap::{flush_dirty, Item, LeafKind, MapType, SHAMap};
use meridian_store::{HashedObjectStore, ObjectType};
use meridian_types::Transaction;
use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Close-time granularities a ledger may use, in seconds. All peers must
/// agree on the resolution in force or their close-time votes can never
/// land in the same bucket.
pub const CLOSE_RESOLUTIONS: [u8; 5] = [10, 30, 60, 90, 120];

pub const DEFAULT_CLOSE_RESOLUTION: u8 = 30;

/// How often (in ledger sequences) the resolution is allowed to move one
/// step along the ladder.
const RESOLUTION_ADJUST_INTERVAL: u32 = 8;

/// Rounds a close time to the nearest multiple of `resolution`.
pub fn round_close_time(close_time: u32, resolution: u8) -> u32 {
    if resolution == 0 {
        return close_time;
    }
    let resolution = u32::from(resolution);
    ((close_time + resolution / 2) / resolution) * resolution
}

/// The resolution for the next ledger: every eighth sequence it moves one
/// step finer after an agreed close, one step coarser after a disagreement.
pub fn next_close_resolution(previous: u8, previous_agree: bool, next_seq: u32) -> u8 {
    let index = CLOSE_RESOLUTIONS
        .iter()
        .position(|r| *r == previous)
        .unwrap_or(1);
    if next_seq % RESOLUTION_ADJUST_INTERVAL != 0 {
        return CLOSE_RESOLUTIONS[index];
    }
    let index = if previous_agree {
        index.saturating_sub(1)
    } else {
        (index + 1).min(CLOSE_RESOLUTIONS.len() - 1)
    };
    CLOSE_RESOLUTIONS[index]
}

/// Widens an account identifier to the 256-bit tag space of the state map.
pub fn account_index(account: &Hash160) -> Hash256 {
    let mut out = [0u8; 32];
    out[..20].copy_from_slice(account.as_bytes());
    Hash256::new(out)
}

/// One ledger in the chain. Created mutable and open; `close` freezes
/// transaction admission; `accept` stamps it immutable. After accept the
/// two maps never change.
pub struct Ledger {
    seq: u32,
    parent_hash: Hash256,
    close_time: u32,
    close_resolution: u8,
    close_agree: bool,
    fee_held: u64,
    closed: bool,
    accepted: bool,
    immutable: bool,
    tx_map: SHAMap,
    state_map: SHAMap,
}

impl Ledger {
    /// The first ledger: empty maps, sequence 1, already accepted.
    pub fn genesis(store: Arc<HashedObjectStore>) -> Self {
        let mut ledger = Self {
            seq: 1,
            parent_hash: Hash256::zero(),
            close_time: 0,
            close_resolution: DEFAULT_CLOSE_RESOLUTION,
            close_agree: true,
            fee_held: 0,
            closed: true,
            accepted: true,
            immutable: true,
            tx_map: SHAMap::new(MapType::Transaction).with_store(store.clone()),
            state_map: SHAMap::new(MapType::State).with_store(store),
        };
        ledger.tx_map.set_immutable();
        ledger.state_map.set_immutable();
        ledger
    }

    /// A new open ledger continuing from `parent`. The state map is a
    /// mutable copy-on-write snapshot of the parent's; the transaction map
    /// starts empty.
    pub fn open_from(parent: &mut Ledger) -> Self {
        debug_assert!(parent.closed, "an open ledger must continue a closed one");
        let mut tx_map = SHAMap::new(MapType::Transaction);
        if let Some(store) = parent.tx_map.store() {
            tx_map = tx_map.with_store(store);
        }
        let state_map = parent.state_map.snapshot(true);
        Self {
            seq: parent.seq + 1,
            parent_hash: parent.hash(),
            close_time: 0,
            close_resolution: next_close_resolution(
                parent.close_resolution,
                parent.close_agree,
                parent.seq + 1,
            ),
            close_agree: true,
            fee_held: 0,
            closed: false,
            accepted: false,
            immutable: false,
            tx_map,
            state_map,
        }
    }

    /// A new open ledger continuing from an accepted (hence immutable)
    /// ledger shared through history.
    pub fn open_from_accepted(parent: &Ledger) -> Self {
        debug_assert!(parent.immutable);
        let mut tx_map = SHAMap::new(MapType::Transaction);
        if let Some(store) = parent.tx_map.store() {
            tx_map = tx_map.with_store(store);
        }
        Self {
            seq: parent.seq + 1,
            parent_hash: parent.hash(),
            close_time: 0,
            close_resolution: next_close_resolution(
                parent.close_resolution,
                parent.close_agree,
                parent.seq + 1,
            ),
            close_agree: true,
            fee_held: 0,
            closed: false,
            accepted: false,
            immutable: false,
            tx_map,
            state_map: parent.state_map.fork(),
        }
    }

    /// Reassembles a ledger from its serialized header; the maps start out
    /// synching toward the recorded roots.
    pub fn from_header_bytes(bytes: &[u8], store: Arc<HashedObjectStore>) -> Option<Self> {
        if bytes.len() != HEADER_LENGTH {
            return None;
        }
        let seq = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        let parent_hash = Hash256::from_slice(&bytes[4..36]).ok()?;
        let tx_root = Hash256::from_slice(&bytes[36..68]).ok()?;
        let state_root = Hash256::from_slice(&bytes[68..100]).ok()?;
        let fee_held = u64::from_be_bytes(bytes[100..108].try_into().ok()?);
        let close_time = u32::from_be_bytes(bytes[108..112].try_into().ok()?);
        let close_resolution = bytes[112];
        let close_agree = match bytes[113] {
            0 => false,
            1 => true,
            _ => return None,
        };
        Some(Self {
            seq,
            parent_hash,
            close_time,
            close_resolution,
            close_agree,
            fee_held,
            closed: true,
            accepted: false,
            immutable: false,
            tx_map: SHAMap::new_synching(MapType::Transaction, tx_root)
                .with_store(store.clone()),
            state_map: SHAMap::new_synching(MapType::State, state_root).with_store(store),
        })
    }

    /// The fixed-layout header covered by the ledger hash.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(self.parent_hash.as_bytes());
        out.extend_from_slice(self.tx_map.root_hash().as_bytes());
        out.extend_from_slice(self.state_map.root_hash().as_bytes());
        out.extend_from_slice(&self.fee_held.to_be_bytes());
        out.extend_from_slice(&self.close_time.to_be_bytes());
        out.push(self.close_resolution);
        out.push(self.close_agree as u8);
        out
    }

    /// `sha512_half(LEDGER ‖ seq ‖ parent ‖ tx_root ‖ state_root ‖ fee ‖
    /// close_time ‖ resolution ‖ agree)`.
    pub fn hash(&self) -> Hash256 {
        let mut h = HalfSha512::new(HashPrefix::Ledger);
        h.update(self.header_bytes());
        h.finish()
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn parent_hash(&self) -> &Hash256 {
        &self.parent_hash
    }

    pub fn close_time(&self) -> u32 {
        self.close_time
    }

    pub fn close_resolution(&self) -> u8 {
        self.close_resolution
    }

    pub fn close_agree(&self) -> bool {
        self.close_agree
    }

    pub fn fee_held(&self) -> u64 {
        self.fee_held
    }

    pub fn add_fee(&mut self, fee: u64) {
        self.fee_held = self.fee_held.saturating_add(fee);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn tx_map(&self) -> &SHAMap {
        &self.tx_map
    }

    pub fn tx_map_mut(&mut self) -> &mut SHAMap {
        &mut self.tx_map
    }

    pub fn state_map(&self) -> &SHAMap {
        &self.state_map
    }

    pub fn state_map_mut(&mut self) -> &mut SHAMap {
        &mut self.state_map
    }

    pub fn tx_root(&self) -> Hash256 {
        self.tx_map.root_hash()
    }

    pub fn state_root(&self) -> Hash256 {
        self.state_map.root_hash()
    }

    pub fn has_transaction(&self, txid: &Hash256) -> Result<bool, LedgerError> {
        Ok(self.tx_map.has(txid)?)
    }

    /// Records a transaction in this ledger's transaction tree. Fails with
    /// `false` on a duplicate. State changes are the engine's business.
    ///
    /// Allowed while the transaction map is still accepting writes — an
    /// open ledger, a just-closed ledger still taking late arrivals, or a
    /// ledger mid-application — never after a freeze.
    pub fn record_transaction(
        &mut self,
        tx: &Transaction,
        meta: Option<Vec<u8>>,
    ) -> Result<bool, LedgerError> {
        if self.immutable {
            return Err(LedgerError::WrongState("immutable"));
        }
        if self.tx_map.state() != meridian_shamap::MapState::Modifying {
            return Err(LedgerError::WrongState("frozen"));
        }
        let (kind, data) = match meta {
            Some(meta) => {
                let mut data = Vec::with_capacity(tx.raw().len() + meta.len() + 4);
                data.extend_from_slice(&(tx.raw().len() as u32).to_be_bytes());
                data.extend_from_slice(tx.raw());
                data.extend_from_slice(&meta);
                (LeafKind::TxnWithMeta, data)
            }
            None => (LeafKind::TxnNoMeta, tx.raw().to_vec()),
        };
        Ok(self.tx_map.add(Item::new(*tx.id(), data), kind)?)
    }

    /// Stamps the close time and marks the ledger closed. The transaction
    /// map keeps accepting late arrivals until [`Ledger::freeze_maps`].
    pub fn close(&mut self, close_time: u32) {
        debug_assert!(!self.closed);
        self.close_time = close_time;
        self.closed = true;
    }

    /// Ends the late-arrival window: both maps become immutable.
    pub fn freeze_maps(&mut self) {
        self.tx_map.set_immutable();
        self.state_map.set_immutable();
    }

    /// Stamps the final close fields and makes the ledger immutable. The
    /// maps must already be frozen; after this nothing may change.
    pub fn set_accepted(&mut self, close_time: u32, close_resolution: u8, close_agree: bool) {
        debug_assert!(self.closed);
        self.close_time = close_time;
        self.close_resolution = close_resolution;
        self.close_agree = close_agree;
        self.accepted = true;
        self.immutable = true;
        self.tx_map.set_immutable();
        self.state_map.set_immutable();
    }

    /// Begins dirty-node tracking on both maps ahead of transaction
    /// application, so `flush_to_store` knows what to write.
    pub fn arm_maps(&mut self) {
        self.tx_map.arm_dirty();
        self.state_map.arm_dirty();
    }

    /// Writes every dirty node of both maps plus the ledger header into the
    /// object store.
    pub fn flush_to_store(&mut self, store: &HashedObjectStore) -> Result<usize, LedgerError> {
        let mut total = 0;
        if let Some(mut dirty) = self.tx_map.disarm_dirty() {
            loop {
                let n = flush_dirty(&mut dirty, 256, ObjectType::TransactionNode, self.seq, store)?;
                if n == 0 {
                    break;
                }
                trace!(target: "ledger", flushed = n, "transaction nodes written");
                total += n;
            }
        }
        if let Some(mut dirty) = self.state_map.disarm_dirty() {
            loop {
                let n = flush_dirty(&mut dirty, 256, ObjectType::AccountNode, self.seq, store)?;
                if n == 0 {
                    break;
                }
                trace!(target: "ledger", flushed = n, "state nodes written");
                total += n;
            }
        }
        let header = self.header_bytes();
        let mut prefixed = HashPrefix::Ledger.to_be_bytes().to_vec();
        prefixed.extend_from_slice(&header);
        let hash = meridian_crypto::content_hash(&prefixed);
        store.put(ObjectType::Ledger, self.seq, prefixed, hash)?;
        Ok(total)
    }
}

const HEADER_LENGTH: usize = 4 + 32 + 32 + 32 + 8 + 4 + 1 + 1;

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ledger(seq={}, {}{}{}, txs={}, ct={})",
            self.seq,
            if self.closed { "closed" } else { "open" },
            if self.accepted { ",accepted" } else { "" },
            if self.immutable { ",immutable" } else { "" },
            self.tx_root(),
            self.close_time,
        )
    }
}
