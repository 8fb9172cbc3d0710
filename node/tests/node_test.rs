// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_consensus::{NetworkSink, PeerId};
use meridian_crypto::{Hash160, NodeKeypair};
use meridian_ledger::AdmitAllEngine;
use meridian_node::{Node, NodeConfig};
use meridian_types::{PeerMessage, TestClock, Transaction};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

/// A transport with nobody on the other end.
struct NullSink;

impl NetworkSink for NullSink {
    fn broadcast(&self, _msg: PeerMessage) {}
    fn send(&self, _peer: &PeerId, _msg: PeerMessage) {}
    fn peers(&self) -> Vec<PeerId> {
        Vec::new()
    }
}

/// A peerless validator still closes ledgers on its own: submit, tick, and
/// the transaction lands in an accepted ledger.
#[test]
fn standalone_node_closes_ledgers() {
    let keys = NodeKeypair::generate(&mut StdRng::seed_from_u64(11));
    let clock = Arc::new(TestClock::new(50_000));
    let config = NodeConfig {
        trusted_validators: vec![keys.public()],
        ..NodeConfig::default()
    };
    let node = Node::with_parts(
        config,
        Arc::new(NullSink),
        Some(keys),
        clock.clone(),
        Arc::new(AdmitAllEngine),
        None,
    );

    let tx = Transaction::new(Hash160::new([3; 20]), 1, vec![1, 2, 3]);
    node.submit_transaction(tx.clone());
    node.jobs().drain();
    for _ in 0..1_000 {
        if node.context().ledger_master.open_has_transactions() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(node.context().ledger_master.open_has_transactions());

    let mut now_ms = 0;
    for tick in 0..600 {
        now_ms += 100;
        if tick % 10 == 9 {
            clock.advance(1);
        }
        node.tick(now_ms).unwrap();
        if node.context().ledger_master.last_closed().seq() >= 2 {
            break;
        }
    }

    let closed = node.context().ledger_master.last_closed();
    assert!(closed.seq() >= 2, "the node closed a ledger by itself");
    assert!(closed.has_transaction(tx.id()).unwrap());
    assert!(closed.is_accepted());
}
