// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-network scenarios: several complete nodes in one process, joined
//! by a deterministic in-memory message bus and a shared scripted clock.

use meridian_consensus::{
    ConsensusConfig, CoreContext, NetworkSink, PeerId, RoundManager, UniqueNodeList,
    ValidationCollection, ValidatorSource,
};
use meridian_crypto::{Hash160, Hash256, NodeKeypair};
use meridian_infallible::Mutex;
use meridian_ledger::{AdmitAllEngine, LedgerMaster};
use meridian_shamap::FullBelowCache;
use meridian_store::HashedObjectStore;
use meridian_types::{PeerMessage, TestClock, Transaction};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

struct Bus {
    inboxes: Mutex<HashMap<PeerId, VecDeque<(PeerId, PeerMessage)>>>,
    severed: Mutex<HashSet<PeerId>>,
}

impl Bus {
    fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
        }
    }

    fn register(&self, id: PeerId) {
        self.inboxes.lock().insert(id, VecDeque::new());
    }

    fn reachable(&self, from: &PeerId, to: &PeerId) -> bool {
        let severed = self.severed.lock();
        !severed.contains(from) && !severed.contains(to)
    }

    fn post(&self, from: PeerId, to: PeerId, msg: PeerMessage) {
        if !self.reachable(&from, &to) {
            return;
        }
        if let Some(queue) = self.inboxes.lock().get_mut(&to) {
            queue.push_back((from, msg));
        }
    }

    fn sever(&self, id: PeerId) {
        self.severed.lock().insert(id);
    }

    fn heal(&self, id: &PeerId) {
        self.severed.lock().remove(id);
    }
}

struct BusSink {
    id: PeerId,
    bus: Arc<Bus>,
}

impl NetworkSink for BusSink {
    fn broadcast(&self, msg: PeerMessage) {
        let targets: Vec<PeerId> = self.bus.inboxes.lock().keys().copied().collect();
        for to in targets {
            if to != self.id {
                self.bus.post(self.id, to, msg.clone());
            }
        }
    }

    fn send(&self, peer: &PeerId, msg: PeerMessage) {
        self.bus.post(self.id, *peer, msg);
    }

    fn peers(&self) -> Vec<PeerId> {
        self.bus
            .inboxes
            .lock()
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect()
    }
}

struct SimNode {
    id: PeerId,
    ctx: Arc<CoreContext>,
    manager: RoundManager,
}

struct Sim {
    bus: Arc<Bus>,
    clock: Arc<TestClock>,
    nodes: Vec<SimNode>,
    now_ms: u64,
}

impl Sim {
    fn new(validators: usize) -> Self {
        let bus = Arc::new(Bus::new());
        let clock = Arc::new(TestClock::new(10_000));
        let mut rng = StdRng::seed_from_u64(2023);
        let keys: Vec<NodeKeypair> = (0..validators)
            .map(|_| NodeKeypair::generate(&mut rng))
            .collect();
        let publics: Vec<_> = keys.iter().map(|k| k.public()).collect();
        for key in &keys {
            bus.register(key.node_id());
        }

        let nodes = keys
            .into_iter()
            .map(|key| {
                let id = key.node_id();
                let config = ConsensusConfig::default();
                let store = Arc::new(HashedObjectStore::in_memory());
                let master = Arc::new(LedgerMaster::new(store.clone(), config.min_validations));
                let unl = Arc::new(UniqueNodeList::new(16));
                for public in &publics {
                    unl.add_validator(*public, ValidatorSource::Config);
                }
                unl.rescore();
                let validations = Arc::new(ValidationCollection::new(
                    clock.clone(),
                    unl.clone(),
                    master.clone(),
                    None,
                    &config,
                ));
                let ctx = Arc::new(CoreContext {
                    store,
                    ledger_master: master,
                    validations,
                    unl,
                    full_below: Arc::new(FullBelowCache::default()),
                    network: Arc::new(BusSink {
                        id,
                        bus: bus.clone(),
                    }),
                    clock: clock.clone(),
                    engine: Arc::new(AdmitAllEngine),
                    keys: Some(key),
                    config,
                });
                SimNode {
                    id,
                    ctx: ctx.clone(),
                    manager: RoundManager::new(ctx),
                }
            })
            .collect();

        Self {
            bus,
            clock,
            nodes,
            now_ms: 0,
        }
    }

    /// One 100 ms tick: every node cranks, then all queued messages flow
    /// until the bus is quiet.
    fn step(&mut self) {
        self.now_ms += 100;
        if self.now_ms % 1_000 == 0 {
            self.clock.advance(1);
        }
        for node in &mut self.nodes {
            node.manager.tick(self.now_ms).expect("tick never fails in simulation");
        }
        for _sweep in 0..16 {
            let mut quiet = true;
            for i in 0..self.nodes.len() {
                let id = self.nodes[i].id;
                let batch: Vec<(PeerId, PeerMessage)> = {
                    let mut inboxes = self.bus.inboxes.lock();
                    inboxes
                        .get_mut(&id)
                        .map(|queue| queue.drain(..).collect())
                        .unwrap_or_default()
                };
                for (from, msg) in batch {
                    quiet = false;
                    self.nodes[i].manager.handle_message(from, msg, self.now_ms);
                }
            }
            if quiet {
                break;
            }
        }
    }

    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.step();
        }
    }

    fn submit_to(&self, node: usize, tx: &Transaction) {
        let master = &self.nodes[node].ctx.ledger_master;
        master
            .submit(Arc::new(tx.clone()), master.open_seq())
            .expect("submission succeeds");
    }

    fn submit_to_all(&self, tx: &Transaction) {
        for i in 0..self.nodes.len() {
            self.submit_to(i, tx);
        }
    }

    /// Runs until every node holds a ledger at `seq`, within a tick budget.
    fn run_until_seq(&mut self, seq: u32, max_ticks: usize) {
        for _ in 0..max_ticks {
            self.step();
            if self
                .nodes
                .iter()
                .all(|n| n.ctx.ledger_master.ledger_by_seq(seq).is_some())
            {
                return;
            }
        }
        panic!("network never reached ledger sequence {}", seq);
    }

    fn ledger_hashes_at(&self, seq: u32) -> HashSet<Hash256> {
        self.nodes
            .iter()
            .filter_map(|n| n.ctx.ledger_master.ledger_by_seq(seq))
            .map(|l| l.hash())
            .collect()
    }
}

fn tx(body: &[u8]) -> Transaction {
    Transaction::new(Hash160::new([body[0]; 20]), 1, body.to_vec())
}

/// S4: five validators with identical open ledgers converge in one round
/// and produce identical, fully validated ledgers.
#[test]
fn five_node_happy_path() {
    let mut sim = Sim::new(5);
    let tx_a = tx(&[0xA1, 1]);
    let tx_b = tx(&[0xB2, 2]);
    sim.submit_to_all(&tx_a);
    sim.submit_to_all(&tx_b);

    sim.run_until_seq(2, 1_500);

    let hashes = sim.ledger_hashes_at(2);
    assert_eq!(hashes.len(), 1, "all five accepted the same ledger");
    let hash = *hashes.iter().next().unwrap();

    for node in &sim.nodes {
        let ledger = node.ctx.ledger_master.ledger_by_seq(2).unwrap();
        assert!(ledger.has_transaction(tx_a.id()).unwrap());
        assert!(ledger.has_transaction(tx_b.id()).unwrap());
        assert!(ledger.close_agree());
        // Chain linkage: parent is this node's genesis.
        let genesis = node.ctx.ledger_master.ledger_by_seq(1).unwrap();
        assert_eq!(*ledger.parent_hash(), genesis.hash());
    }

    // Let the validations finish crossing the bus.
    sim.run(50);
    for node in &sim.nodes {
        assert_eq!(node.ctx.validations.trusted_count(&hash), 5);
        let (first, last) = node.ctx.ledger_master.validated_range();
        assert!(first >= 2 || last >= 2, "ledger became fully validated");
    }
}

/// S5: one divergent proposer loses the dispute; its extra transaction is
/// excluded from this ledger but carried into the next one.
#[test]
fn divergent_proposer_is_outvoted_and_tx_carries_forward() {
    let mut sim = Sim::new(5);
    let tx_a = tx(&[0xA1, 1]);
    let tx_b = tx(&[0xB2, 2]);
    let tx_c = tx(&[0xC3, 3]);
    sim.submit_to_all(&tx_a);
    sim.submit_to_all(&tx_b);
    // Only node 0 starts with the contested transaction.
    sim.submit_to(0, &tx_c);

    sim.run_until_seq(2, 1_500);

    let hashes = sim.ledger_hashes_at(2);
    assert_eq!(hashes.len(), 1, "the majority position won everywhere");
    for node in &sim.nodes {
        let ledger = node.ctx.ledger_master.ledger_by_seq(2).unwrap();
        assert!(ledger.has_transaction(tx_a.id()).unwrap());
        assert!(ledger.has_transaction(tx_b.id()).unwrap());
        assert!(
            !ledger.has_transaction(tx_c.id()).unwrap(),
            "the disputed transaction lost this round"
        );
    }

    // The reapply-disputed step pushes it into the following ledger.
    sim.run_until_seq(3, 3_000);
    for node in &sim.nodes {
        let ledger = node.ctx.ledger_master.ledger_by_seq(3).unwrap();
        assert!(
            ledger.has_transaction(tx_c.id()).unwrap(),
            "the disputed transaction rode the next ledger"
        );
    }
}

/// S6: a partitioned node builds its own ledger, discovers the trusted
/// majority validated a different chain, abandons its own, acquires the
/// network ledger, and rejoins consensus.
#[test]
fn fork_recovery_after_partition() {
    let mut sim = Sim::new(5);
    let lonely = sim.nodes[4].id;
    let tx_x = tx(&[0xEE, 9]);

    sim.bus.sever(lonely);
    for i in 0..4 {
        sim.submit_to(i, &tx_x);
    }

    // Run long enough for both sides to close a seq-2 ledger.
    sim.run(700);
    let majority_2 = sim.nodes[0]
        .ctx
        .ledger_master
        .ledger_by_seq(2)
        .expect("majority closed a ledger");
    let lonely_2 = sim.nodes[4]
        .ctx
        .ledger_master
        .ledger_by_seq(2)
        .expect("the partitioned node closed its own ledger");
    assert_ne!(majority_2.hash(), lonely_2.hash(), "a genuine fork formed");

    // The lonely chain can never ratify: three trusted validations are
    // required and it only has its own.
    assert!(
        sim.nodes[4]
            .ctx
            .validations
            .trusted_count(&lonely_2.hash())
            < 3
    );

    sim.bus.heal(&lonely);
    // After healing, the next majority validations reveal the fork; the
    // node resynchronizes without operator help.
    let mut rejoined = false;
    for _ in 0..4_000 {
        sim.step();
        let reference = sim.nodes[0].ctx.ledger_master.last_closed();
        if reference.seq() < 3 {
            continue;
        }
        if sim.nodes[4]
            .ctx
            .ledger_master
            .ledger_by_hash(&reference.hash())
            .is_some()
        {
            rejoined = true;
            break;
        }
    }
    assert!(rejoined, "the partitioned node adopted the majority chain");

    // And it now agrees on new ledgers: find a sequence where all five
    // match after the rejoin.
    sim.run(600);
    let top = sim.nodes[0].ctx.ledger_master.last_closed().seq();
    let converged = (3..=top).rev().any(|seq| {
        let hashes = sim.ledger_hashes_at(seq);
        hashes.len() == 1 && sim.nodes.iter().all(|n| n.ctx.ledger_master.ledger_by_seq(seq).is_some())
    });
    assert!(converged, "all five nodes share a post-recovery ledger");

    // The majority's transaction was never lost.
    for node in &sim.nodes[..4] {
        let ledger = node.ctx.ledger_master.ledger_by_seq(2).unwrap();
        assert!(ledger.has_transaction(tx_x.id()).unwrap());
    }
}
