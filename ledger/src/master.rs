// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Ledger, LedgerError};
use meridian_crypto::Hash256;
use meridian_infallible::Mutex;
use meridian_shamap::SHAMap;
use meridian_store::HashedObjectStore;
use meridian_types::{Transaction, TxStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a submitted transaction ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Entered the current open ledger.
    Open,
    /// Entered the closing ledger as a late arrival.
    Closing,
    /// Held for a future ledger sequence.
    Held,
    /// Already present in a ledger in range; dropped.
    Duplicate,
}

struct Inner {
    open: Ledger,
    closing: Option<Ledger>,
    closing_accepts_late: bool,
    last_closed: Arc<Ledger>,
    history_by_hash: HashMap<Hash256, Arc<Ledger>>,
    history_by_seq: BTreeMap<u32, Arc<Ledger>>,
    held: Vec<(u32, Arc<Transaction>)>,
    tx_status: HashMap<Hash256, TxStatus>,
    validated_min: u32,
    validated_max: u32,
    last_close_time: u32,
}

impl Inner {
    /// Is `txid` already in any ledger with sequence in `from..=open.seq`?
    fn tx_in_range(&self, txid: &Hash256, from: u32) -> Result<bool, LedgerError> {
        if self.open.has_transaction(txid)? {
            return Ok(true);
        }
        if let Some(closing) = &self.closing {
            if closing.seq() >= from && closing.has_transaction(txid)? {
                return Ok(true);
            }
        }
        for (_seq, ledger) in self.history_by_seq.range(from..) {
            if ledger.has_transaction(txid)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Holds the current open ledger, the at-most-one closing ledger, and the
/// accepted history; routes transactions by target sequence. `push_ledger`
/// is the single atomic step that retires a round: observers see either the
/// old open ledger or the new one, never a mixture.
pub struct LedgerMaster {
    store: Arc<HashedObjectStore>,
    /// Trusted validations required before a closed ledger counts as fully
    /// validated.
    min_validations: usize,
    inner: Mutex<Inner>,
}

impl LedgerMaster {
    pub fn new(store: Arc<HashedObjectStore>, min_validations: usize) -> Self {
        let mut genesis = Ledger::genesis(store.clone());
        let open = Ledger::open_from(&mut genesis);
        let genesis = Arc::new(genesis);
        let mut history_by_hash = HashMap::new();
        let mut history_by_seq = BTreeMap::new();
        history_by_hash.insert(genesis.hash(), genesis.clone());
        history_by_seq.insert(genesis.seq(), genesis.clone());
        Self {
            store,
            min_validations,
            inner: Mutex::new(Inner {
                open,
                closing: None,
                closing_accepts_late: false,
                last_closed: genesis,
                history_by_hash,
                history_by_seq,
                held: Vec::new(),
                tx_status: HashMap::new(),
                validated_min: 0,
                validated_max: 0,
                last_close_time: 0,
            }),
        }
    }

    pub fn store(&self) -> Arc<HashedObjectStore> {
        self.store.clone()
    }

    pub fn open_seq(&self) -> u32 {
        self.inner.lock().open.seq()
    }

    /// The most recently accepted ledger.
    pub fn last_closed(&self) -> Arc<Ledger> {
        self.inner.lock().last_closed.clone()
    }

    pub fn open_has_transactions(&self) -> bool {
        !self.inner.lock().open.tx_root().is_zero()
    }

    pub fn last_close_time(&self) -> u32 {
        self.inner.lock().last_close_time
    }

    pub fn set_last_close_time(&self, time: u32) {
        self.inner.lock().last_close_time = time;
    }

    pub fn ledger_by_hash(&self, hash: &Hash256) -> Option<Arc<Ledger>> {
        self.inner.lock().history_by_hash.get(hash).cloned()
    }

    pub fn ledger_by_seq(&self, seq: u32) -> Option<Arc<Ledger>> {
        self.inner.lock().history_by_seq.get(&seq).cloned()
    }

    pub fn tx_status(&self, txid: &Hash256) -> Option<TxStatus> {
        self.inner.lock().tx_status.get(txid).copied()
    }

    /// `(first, last)` fully validated sequence range; `(0, 0)` when no
    /// ledger has been validated yet.
    pub fn validated_range(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.validated_min, inner.validated_max)
    }

    /// Routes a transaction targeted at ledger `target_seq`, per the
    /// dispatch rules: the open ledger for the current sequence, the closing
    /// ledger while it still takes late arrivals, the held queue for future
    /// sequences, and a duplicate-checked replay into the open ledger for
    /// past sequences.
    pub fn submit(
        &self,
        tx: Arc<Transaction>,
        target_seq: u32,
    ) -> Result<SubmitOutcome, LedgerError> {
        let inner = &mut *self.inner.lock();
        let open_seq = inner.open.seq();

        if target_seq == open_seq {
            if inner.open.has_transaction(tx.id())? {
                return Ok(SubmitOutcome::Duplicate);
            }
            inner.open.record_transaction(&tx, None)?;
            inner.tx_status.insert(*tx.id(), TxStatus::Active);
            return Ok(SubmitOutcome::Open);
        }

        if target_seq > open_seq {
            if inner.held.iter().any(|(_, held)| held.id() == tx.id()) {
                return Ok(SubmitOutcome::Duplicate);
            }
            debug!(target: "ledger", txid = %tx.id(), target_seq, "holding future transaction");
            inner.tx_status.insert(*tx.id(), TxStatus::Held);
            inner.held.push((target_seq, tx));
            return Ok(SubmitOutcome::Held);
        }

        if let Some(closing) = &mut inner.closing {
            if target_seq == closing.seq() && inner.closing_accepts_late {
                if closing.has_transaction(tx.id())? {
                    return Ok(SubmitOutcome::Duplicate);
                }
                closing.record_transaction(&tx, None)?;
                inner.tx_status.insert(*tx.id(), TxStatus::Active);
                return Ok(SubmitOutcome::Closing);
            }
        }

        // Past sequence: replay into the open ledger unless some ledger in
        // `[target_seq ..= open_seq]` already has it.
        if inner.tx_in_range(tx.id(), target_seq)? {
            return Ok(SubmitOutcome::Duplicate);
        }
        inner.open.record_transaction(&tx, None)?;
        inner.tx_status.insert(*tx.id(), TxStatus::Active);
        Ok(SubmitOutcome::Open)
    }

    /// Moves the open ledger into the closing slot (still taking late
    /// arrivals) and opens its successor.
    pub fn close_ledger(&self, close_time: u32) -> Result<(), LedgerError> {
        let inner = &mut *self.inner.lock();
        debug_assert!(inner.closing.is_none(), "one closing ledger at a time");
        inner.open.close(close_time);
        let new_open = Ledger::open_from(&mut inner.open);
        let closing = std::mem::replace(&mut inner.open, new_open);
        info!(target: "ledger", seq = closing.seq(), "ledger closing");
        inner.closing = Some(closing);
        inner.closing_accepts_late = true;
        inner.last_close_time = close_time;
        Ok(())
    }

    /// Ends the closing ledger's late-arrival window and returns the frozen
    /// snapshot of its transaction tree: the node's initial consensus
    /// position.
    pub fn take_position(&self) -> Option<SHAMap> {
        let inner = &mut *self.inner.lock();
        let closing = inner.closing.as_mut()?;
        inner.closing_accepts_late = false;
        let snapshot = closing.tx_map_mut().snapshot(false);
        closing.freeze_maps();
        Some(snapshot)
    }

    /// A frozen snapshot of the current open ledger's transaction tree (the
    /// leftovers consensus replays into the next open ledger).
    pub fn open_tx_snapshot(&self) -> SHAMap {
        self.inner.lock().open.tx_map_mut().snapshot(false)
    }

    /// Atomically retires the round: `new_closed` (accepted) joins history
    /// and becomes the last closed ledger, `new_open` becomes current, and
    /// held transactions whose time has come are replayed.
    pub fn push_ledger(
        &self,
        new_closed: Ledger,
        new_open: Ledger,
        had_consensus: bool,
    ) -> Result<Arc<Ledger>, LedgerError> {
        debug_assert!(new_closed.is_accepted());
        let inner = &mut *self.inner.lock();
        let closed = Arc::new(new_closed);
        info!(
            target: "ledger",
            seq = closed.seq(),
            hash = %closed.hash(),
            had_consensus,
            "pushing new closed ledger"
        );
        inner.history_by_hash.insert(closed.hash(), closed.clone());
        inner.history_by_seq.insert(closed.seq(), closed.clone());
        inner.last_closed = closed.clone();
        inner.closing = None;
        inner.closing_accepts_late = false;
        inner.open = new_open;
        if had_consensus {
            inner.last_close_time = closed.close_time();
        }

        let open_seq = inner.open.seq();
        let held = std::mem::take(&mut inner.held);
        for (target_seq, tx) in held {
            if target_seq > open_seq {
                inner.held.push((target_seq, tx));
                continue;
            }
            match inner.tx_in_range(tx.id(), target_seq) {
                Ok(true) => {
                    inner.tx_status.insert(*tx.id(), TxStatus::Conflicted);
                }
                Ok(false) => {
                    if inner.open.record_transaction(&tx, None).is_ok() {
                        inner.tx_status.insert(*tx.id(), TxStatus::Active);
                    }
                }
                Err(err) => {
                    warn!(target: "ledger", %err, "held replay dup-check failed");
                    inner.held.push((target_seq, tx));
                }
            }
        }
        Ok(closed)
    }

    /// Installs a ledger acquired from the network (fork recovery, history
    /// backfill) into the history indexes.
    pub fn install_acquired(&self, ledger: Ledger) -> Arc<Ledger> {
        let inner = &mut *self.inner.lock();
        let ledger = Arc::new(ledger);
        inner.history_by_hash.insert(ledger.hash(), ledger.clone());
        inner.history_by_seq.insert(ledger.seq(), ledger.clone());
        if ledger.seq() > inner.last_closed.seq() {
            inner.last_closed = ledger.clone();
        }
        ledger
    }

    /// Called for every trusted validation: once a closed ledger reaches
    /// the validation minimum it becomes fully validated and its
    /// transactions commit.
    pub fn check_accept(&self, ledger_hash: &Hash256, trusted_count: usize) {
        if trusted_count < self.min_validations {
            return;
        }
        let inner = &mut *self.inner.lock();
        let ledger = match inner.history_by_hash.get(ledger_hash) {
            Some(ledger) => ledger.clone(),
            None => return,
        };
        let seq = ledger.seq();
        if seq <= inner.validated_max {
            return;
        }
        if inner.validated_min == 0 {
            inner.validated_min = seq;
        }
        inner.validated_max = seq;
        info!(target: "ledger", seq, hash = %ledger_hash, "ledger fully validated");

        // Commit every transaction the validated ledger carries.
        let mut cursor = ledger.tx_map().first().ok().flatten();
        while let Some(item) = cursor {
            inner.tx_status.insert(*item.tag(), TxStatus::Committed);
            cursor = ledger.tx_map().next(item.tag()).ok().flatten();
        }
    }
}
