// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::Hash160;
use meridian_ledger::{AdmitAllEngine, Ledger, LedgerMaster, SubmitOutcome, TransactionEngine};
use meridian_store::HashedObjectStore;
use meridian_types::{Transaction, TxStatus};
use std::sync::Arc;

fn master() -> LedgerMaster {
    LedgerMaster::new(Arc::new(HashedObjectStore::in_memory()), 3)
}

fn tx(account: u8, seq: u32) -> Arc<Transaction> {
    Arc::new(Transaction::new(
        Hash160::new([account; 20]),
        seq,
        vec![account, seq as u8],
    ))
}

/// Runs a no-consensus round: close, apply the position through the engine
/// onto a child of the last closed ledger, accept, push.
fn advance(master: &LedgerMaster, close_time: u32) -> Arc<Ledger> {
    master.close_ledger(close_time).unwrap();
    let position = master.take_position().unwrap();

    let prev = master.last_closed();
    let mut new_closed = Ledger::open_from_accepted(&prev);
    let engine = AdmitAllEngine;
    let mut cursor = position.first().unwrap();
    while let Some(item) = cursor {
        let t = Transaction::from_raw(item.data().to_vec());
        engine.apply(&t, &mut new_closed, false, true);
        cursor = position.next(item.tag()).unwrap();
    }
    new_closed.close(close_time);
    new_closed.freeze_maps();
    new_closed.set_accepted(close_time, new_closed.close_resolution(), true);
    let new_open = Ledger::open_from_accepted(&new_closed);
    master.push_ledger(new_closed, new_open, true).unwrap()
}

#[test]
fn submit_routes_by_sequence() {
    let m = master();
    let open_seq = m.open_seq();

    // Current sequence lands in the open ledger.
    assert_eq!(
        m.submit(tx(1, 1), open_seq).unwrap(),
        SubmitOutcome::Open
    );
    assert_eq!(m.tx_status(tx(1, 1).id()), Some(TxStatus::Active));
    // Same transaction again is a duplicate.
    assert_eq!(
        m.submit(tx(1, 1), open_seq).unwrap(),
        SubmitOutcome::Duplicate
    );

    // A future sequence is held.
    assert_eq!(
        m.submit(tx(2, 1), open_seq + 2).unwrap(),
        SubmitOutcome::Held
    );
    assert_eq!(m.tx_status(tx(2, 1).id()), Some(TxStatus::Held));
}

#[test]
fn closing_ledger_takes_late_arrivals_until_position() {
    let m = master();
    let closing_seq = m.open_seq();
    m.submit(tx(1, 1), closing_seq).unwrap();
    m.close_ledger(1000).unwrap();

    // The closed ledger still takes arrivals for its own sequence.
    assert_eq!(
        m.submit(tx(2, 1), closing_seq).unwrap(),
        SubmitOutcome::Closing
    );

    // Once the consensus position is taken, the window shuts; the same
    // target sequence now replays into the open ledger (after dup check).
    let position = m.take_position().unwrap();
    assert!(position.has(tx(1, 1).id()).unwrap());
    assert!(position.has(tx(2, 1).id()).unwrap());

    assert_eq!(
        m.submit(tx(3, 1), closing_seq).unwrap(),
        SubmitOutcome::Open
    );
    assert_eq!(
        m.submit(tx(2, 1), closing_seq).unwrap(),
        SubmitOutcome::Duplicate
    );
}

#[test]
fn push_ledger_replays_held_transactions() {
    let m = master();
    let open_seq = m.open_seq();
    m.submit(tx(1, 1), open_seq).unwrap();
    m.submit(tx(9, 1), open_seq + 1).unwrap(); // held for the next ledger

    let closed = advance(&m, 1000);
    assert_eq!(closed.seq(), open_seq);
    assert!(closed.has_transaction(tx(1, 1).id()).unwrap());

    // The held transaction moved into the new open ledger.
    assert_eq!(m.open_seq(), open_seq + 1);
    assert_eq!(m.tx_status(tx(9, 1).id()), Some(TxStatus::Active));
    assert!(m.open_has_transactions());
}

#[test]
fn history_is_indexed_by_seq_and_hash() {
    let m = master();
    let open_seq = m.open_seq();
    m.submit(tx(1, 1), open_seq).unwrap();
    let closed = advance(&m, 1000);

    assert_eq!(
        m.ledger_by_seq(closed.seq()).unwrap().hash(),
        closed.hash()
    );
    assert_eq!(
        m.ledger_by_hash(&closed.hash()).unwrap().seq(),
        closed.seq()
    );
    // Chain linkage: the new closed ledger's parent is the previous one.
    let parent = m.ledger_by_seq(closed.seq() - 1).unwrap();
    assert_eq!(*closed.parent_hash(), parent.hash());
}

#[test]
fn check_accept_requires_the_validation_minimum() {
    let m = master();
    let open_seq = m.open_seq();
    m.submit(tx(1, 1), open_seq).unwrap();
    let closed = advance(&m, 1000);

    m.check_accept(&closed.hash(), 2); // below the minimum of 3
    assert_eq!(m.validated_range(), (0, 0));

    m.check_accept(&closed.hash(), 3);
    assert_eq!(m.validated_range(), (closed.seq(), closed.seq()));
    assert_eq!(m.tx_status(tx(1, 1).id()), Some(TxStatus::Committed));
}
