// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! One round of agreement on the next ledger.
//!
//! The machine runs `PreClose → Establish → Finished → Accepted`, cranked by
//! [`LedgerConsensus::timer_entry`] — a non-blocking turn of the crank — and
//! by message arrivals. Nothing here blocks: missing data schedules a fetch
//! and the round proceeds on other paths.

use crate::{
    acquire::{LedgerAcquire, TransactionAcquire, TxSetFilter},
    context::{CoreContext, PeerId},
    dispute::DisputedTx,
    timing::{self, Convergence},
    ConsensusError,
};
use meridian_crypto::Hash256;
use meridian_ledger::{round_close_time, next_close_resolution, CanonicalTxSet, Ledger};
use meridian_shamap::{AddResult, Item, LeafKind, SHAMap};
use meridian_types::{
    LedgerInfoType, NodeEvent, PeerMessage, Proposal, StatusChange, Transaction, TxSetStatus,
    Validation, SEQ_LEAVE,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    /// Our ledger is open; others may already be closing.
    PreClose,
    /// Exchanging positions and converging.
    Establish,
    /// Agreement reached; applying the set.
    Finished,
    /// The new last closed ledger is installed.
    Accepted,
}

/// What the round hands back to its driver once accepted.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub new_ledger_hash: Hash256,
    pub had_consensus: bool,
    pub proposers: usize,
    pub round_ms: u64,
}

pub struct LedgerConsensus {
    ctx: Arc<CoreContext>,
    filter: Arc<TxSetFilter>,
    state: ConsensusState,
    /// The wall (network) time we closed our ledger.
    close_time: u32,
    prev_ledger_hash: Hash256,
    previous_ledger: Arc<Ledger>,
    acquiring_ledger: Option<LedgerAcquire>,
    our_position: Option<Proposal>,
    proposing: bool,
    validating: bool,
    have_correct_lcl: bool,
    consensus_fail: bool,
    current_ms: u64,
    close_percent: u32,
    close_resolution: u8,
    have_close_time_consensus: bool,
    /// Timer origin: creation for the pre-close phase, reset at close.
    start_ms: u64,
    previous_proposers: usize,
    previous_ms: u64,
    peer_positions: HashMap<PeerId, Proposal>,
    /// Transaction sets we hold, by root hash.
    acquired: HashMap<Hash256, SHAMap>,
    /// Fetches in flight, by root hash.
    acquiring: HashMap<Hash256, TransactionAcquire>,
    /// Peers known to hold a given set.
    peer_data: HashMap<Hash256, Vec<PeerId>>,
    disputes: HashMap<Hash256, DisputedTx>,
    /// Close-time estimates from pre-positions (propose seq 0).
    close_times: BTreeMap<u32, usize>,
    dead_nodes: HashSet<PeerId>,
    result: Option<RoundResult>,
}

impl LedgerConsensus {
    pub fn new(
        ctx: Arc<CoreContext>,
        filter: Arc<TxSetFilter>,
        prev_ledger_hash: Hash256,
        previous_ledger: Arc<Ledger>,
        previous_proposers: usize,
        previous_ms: u64,
        now_ms: u64,
    ) -> Self {
        let validating = ctx.keys.is_some();
        let close_resolution = next_close_resolution(
            previous_ledger.close_resolution(),
            previous_ledger.close_agree(),
            previous_ledger.seq() + 1,
        );
        let have_correct_lcl = previous_ledger.hash() == prev_ledger_hash;
        let mut round = Self {
            ctx,
            filter,
            state: ConsensusState::PreClose,
            close_time: 0,
            prev_ledger_hash,
            previous_ledger,
            acquiring_ledger: None,
            our_position: None,
            proposing: validating && have_correct_lcl,
            validating,
            have_correct_lcl,
            consensus_fail: false,
            current_ms: 0,
            close_percent: 0,
            close_resolution,
            have_close_time_consensus: false,
            start_ms: now_ms,
            previous_proposers,
            previous_ms: previous_ms.max(1),
            peer_positions: HashMap::new(),
            acquired: HashMap::new(),
            acquiring: HashMap::new(),
            peer_data: HashMap::new(),
            disputes: HashMap::new(),
            close_times: BTreeMap::new(),
            dead_nodes: HashSet::new(),
            result: None,
        };
        if round.have_correct_lcl {
            info!(
                target: "consensus",
                lcl = %round.prev_ledger_hash,
                validating,
                "entering consensus round"
            );
        } else {
            let lcl = round.prev_ledger_hash;
            warn!(target: "consensus", want = %lcl, "entering round without the correct LCL");
            round.handle_lcl(lcl, now_ms);
        }
        round
    }

    pub fn state(&self) -> ConsensusState {
        self.state
    }

    pub fn prev_ledger_hash(&self) -> &Hash256 {
        &self.prev_ledger_hash
    }

    pub fn have_correct_lcl(&self) -> bool {
        self.have_correct_lcl
    }

    pub fn is_proposing(&self) -> bool {
        self.proposing
    }

    pub fn dispute_count(&self) -> usize {
        self.disputes.len()
    }

    pub fn our_position(&self) -> Option<&Proposal> {
        self.our_position.as_ref()
    }

    pub fn take_result(&mut self) -> Option<RoundResult> {
        self.result.take()
    }

    /// A transaction set we hold, for serving peer requests.
    pub fn acquired_set(&self, hash: &Hash256) -> Option<&SHAMap> {
        self.acquired.get(hash)
    }

    /// Average close-time vote offset relative to our own report, for local
    /// clock drift estimation after a validating round.
    pub fn close_time_offset(&self) -> i64 {
        let mut total: i64 = 0;
        let mut count: i64 = 1;
        for position in self.peer_positions.values() {
            if position.is_bow_out() {
                continue;
            }
            total += i64::from(position.close_time()) - i64::from(self.close_time);
            count += 1;
        }
        total / count
    }

    // ---- the crank -------------------------------------------------------

    /// One non-blocking turn. Called on a fixed cadence.
    pub fn timer_entry(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        if self.state != ConsensusState::Finished && self.state != ConsensusState::Accepted {
            self.check_lcl(now_ms);
        }
        self.poll_acquires(now_ms);

        self.current_ms = now_ms.saturating_sub(self.start_ms);
        self.close_percent = (self.current_ms * 100 / self.previous_ms) as u32;

        match self.state {
            ConsensusState::PreClose => self.state_pre_close(now_ms),
            ConsensusState::Establish => self.state_establish(now_ms),
            // Finished resolves inside accept; Accepted waits for the driver.
            ConsensusState::Finished | ConsensusState::Accepted => Ok(()),
        }
    }

    fn state_pre_close(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        let any_transactions = self.ctx.ledger_master.open_has_transactions();
        let proposers_closed = self.peer_positions.len();
        let proposers_validated = self
            .ctx
            .validations
            .trusted_count(&self.prev_ledger_hash);

        let now_net = self.ctx.clock.network_time();
        let last_close = self.ctx.ledger_master.last_close_time();
        let since_close_ms = if last_close == 0 {
            self.current_ms
        } else {
            u64::from(now_net.saturating_sub(last_close)) * 1000
        };
        let idle_interval_ms = if self.have_correct_lcl && self.previous_ledger.close_agree() {
            u64::from(
                (2 * u32::from(self.previous_ledger.close_resolution()))
                    .max(self.ctx.config.idle_interval_secs),
            ) * 1000
        } else {
            u64::from(self.ctx.config.idle_interval_secs) * 1000
        };

        if timing::should_close(
            any_transactions,
            self.previous_proposers,
            proposers_closed,
            proposers_validated,
            self.previous_ms,
            since_close_ms,
            self.current_ms,
            idle_interval_ms,
            &self.ctx.config,
        ) {
            self.close_ledger(now_ms)?;
        }
        Ok(())
    }

    /// Pre-Close → Establish: freeze our candidate set and publish it.
    fn close_ledger(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        self.state = ConsensusState::Establish;
        self.start_ms = now_ms;
        self.current_ms = 0;
        self.close_time = self.ctx.clock.network_time();
        self.status_change(NodeEvent::Closing);

        self.ctx.ledger_master.close_ledger(self.close_time)?;
        let position = self
            .ctx
            .ledger_master
            .take_position()
            .expect("close_ledger just installed a closing ledger");
        self.take_initial_position(position);
        Ok(())
    }

    fn take_initial_position(&mut self, position: SHAMap) {
        let set_hash = position.root_hash();
        info!(target: "consensus", position = %set_hash, "taking initial position");
        self.map_complete(set_hash, position, false);

        let now_net = self.ctx.clock.network_time();
        // Observers track a position internally but never publish it.
        let public = match &self.ctx.keys {
            Some(keys) => keys.public(),
            None => meridian_crypto::NodePublicKey::from_slice(&[0; 32])
                .expect("fixed-size key bytes"),
        };
        self.our_position = Some(Proposal::new_ours(
            public,
            self.prev_ledger_hash,
            set_hash,
            self.close_time,
            now_net,
        ));

        // Seed our vote on any dispute created before we had a position.
        if let Some(our_map) = self.acquired.get(&set_hash) {
            let votes: Vec<(Hash256, bool)> = self
                .disputes
                .keys()
                .map(|txid| (*txid, our_map.has(txid).unwrap_or(false)))
                .collect();
            for (txid, vote) in votes {
                if let Some(dispute) = self.disputes.get_mut(&txid) {
                    dispute.set_our_vote(vote);
                }
            }
        }

        // Sets that peers proposed before we closed: diff them against our
        // fresh position now.
        let mut contrary: Vec<Hash256> = Vec::new();
        let mut seen = HashSet::new();
        for position in self.peer_positions.values() {
            if position.is_bow_out() || position.is_initial_close_estimate() {
                continue;
            }
            let hash = *position.position();
            if hash != set_hash && seen.insert(hash) && self.acquired.contains_key(&hash) {
                contrary.push(hash);
            }
        }
        for hash in contrary {
            let mut fresh: Vec<(Hash256, Vec<u8>)> = Vec::new();
            if let (Some(ours), Some(theirs)) =
                (self.acquired.get(&set_hash), self.acquired.get(&hash))
            {
                if let Ok(Some(diff)) = ours.compare(theirs, self.ctx.config.max_diff) {
                    for (txid, (a, b)) in diff {
                        let item = a.or(b).expect("diff entries carry an item");
                        fresh.push((txid, item.data().to_vec()));
                    }
                }
            }
            for (txid, tx) in fresh {
                self.add_disputed_tx(txid, tx);
            }
        }

        if self.proposing {
            self.propose();
        }
    }

    fn state_establish(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        if self.current_ms < self.ctx.config.min_consensus_ms {
            return Ok(());
        }
        self.update_our_positions(now_ms);

        let our_hash = match &self.our_position {
            Some(our) => *our.position(),
            None => return Ok(()),
        };
        let mut agree = usize::from(self.proposing);
        let mut active = 0;
        for position in self.peer_positions.values() {
            if position.is_bow_out() || position.is_initial_close_estimate() {
                continue;
            }
            active += 1;
            if *position.position() == our_hash {
                agree += 1;
            }
        }

        let verdict = timing::have_consensus(
            self.previous_proposers,
            active,
            agree,
            self.close_percent,
            self.current_ms,
            self.proposing,
            &self.ctx.config,
        );
        match verdict {
            Convergence::No => Ok(()),
            Convergence::Yes if !self.have_close_time_consensus => {
                debug!(target: "consensus", "transaction consensus but no close-time consensus yet");
                Ok(())
            }
            Convergence::Yes => {
                info!(
                    target: "consensus",
                    participants = self.peer_positions.len(),
                    "converge cutoff reached"
                );
                self.state = ConsensusState::Finished;
                self.accept(now_ms)
            }
            Convergence::Failed => {
                warn!(target: "consensus", "round stuck; finishing without agreement");
                self.consensus_fail = true;
                self.state = ConsensusState::Finished;
                self.accept(now_ms)
            }
        }
    }

    // ---- positions and disputes -----------------------------------------

    /// Handles a peer's proposal. Returns whether it is new and relayable.
    /// The caller has already verified the signature and that the proposal
    /// names our previous ledger.
    pub fn peer_position(&mut self, proposal: Proposal) -> bool {
        let peer = proposal.node_id();
        if self.dead_nodes.contains(&peer) {
            debug!(target: "consensus", %peer, "position from a withdrawn node");
            return false;
        }
        if let Some(existing) = self.peer_positions.get(&peer) {
            if proposal.propose_seq() <= existing.propose_seq() {
                return false;
            }
        }

        if proposal.is_initial_close_estimate() {
            trace!(target: "consensus", %peer, close = proposal.close_time(), "close-time estimate");
            *self
                .close_times
                .entry(round_close_time(proposal.close_time(), self.close_resolution))
                .or_insert(0) += 1;
            self.peer_positions.insert(peer, proposal);
            return true;
        }

        if proposal.propose_seq() == SEQ_LEAVE {
            info!(target: "consensus", %peer, "peer withdraws from the round");
            for dispute in self.disputes.values_mut() {
                dispute.clear_vote(&peer);
            }
            self.peer_positions.remove(&peer);
            self.dead_nodes.insert(peer);
            return true;
        }

        let set_hash = *proposal.position();
        trace!(
            target: "consensus",
            %peer,
            seq = proposal.propose_seq(),
            position = %set_hash,
            "peer position"
        );
        self.peer_positions.insert(peer, proposal);

        if self.acquired.contains_key(&set_hash) {
            let set = &self.acquired[&set_hash];
            for dispute in self.disputes.values_mut() {
                dispute.set_vote(peer, set.has(dispute.txid()).unwrap_or(false));
            }
        } else {
            debug!(target: "consensus", position = %set_hash, "set not held; acquiring");
            self.start_acquire(set_hash);
        }
        true
    }

    /// A peer advertised (not sent) a transaction set.
    pub fn peer_has_set(&mut self, peer: PeerId, hash: Hash256, status: TxSetStatus) {
        if status != TxSetStatus::Have {
            return; // capability-only advertisements are future work
        }
        let known = self.peer_data.entry(hash).or_insert_with(Vec::new);
        if !known.contains(&peer) {
            known.push(peer);
        }
        if let Some(acquire) = self.acquiring.get_mut(&hash) {
            acquire.peer_has(peer, self.ctx.network.as_ref(), self.filter.as_ref());
        }
    }

    /// Candidate-set nodes arrived from a peer.
    pub fn peer_gave_nodes(
        &mut self,
        set_hash: Hash256,
        ids: &[Vec<u8>],
        blobs: &[Vec<u8>],
        now_ms: u64,
    ) -> AddResult {
        let acquire = match self.acquiring.get_mut(&set_hash) {
            Some(acquire) => acquire,
            None => {
                trace!(target: "consensus", set = %set_hash, "data for a set no longer acquiring");
                return AddResult::okay();
            }
        };
        let result = acquire.take_nodes(
            ids,
            blobs,
            self.ctx.network.as_ref(),
            self.filter.as_ref(),
            now_ms,
        );
        self.harvest_acquires();
        result
    }

    fn start_acquire(&mut self, hash: Hash256) {
        if self.acquired.contains_key(&hash) || self.acquiring.contains_key(&hash) {
            return;
        }
        if hash.is_zero() {
            // The empty set needs no network.
            let mut empty = SHAMap::new(meridian_shamap::MapType::Transaction);
            empty.set_immutable();
            self.map_complete(hash, empty, false);
            return;
        }
        let mut acquire =
            TransactionAcquire::new(hash, self.ctx.store.clone(), self.current_ms + self.start_ms);
        for peer in self.peer_data.get(&hash).cloned().unwrap_or_default() {
            acquire.peer_has(peer, self.ctx.network.as_ref(), self.filter.as_ref());
        }
        self.acquiring.insert(hash, acquire);
    }

    /// Completed fetches become held sets; newly learned transactions are
    /// submitted locally so they can ride a later ledger.
    fn harvest_acquires(&mut self) {
        let done: Vec<Hash256> = self
            .acquiring
            .iter()
            .filter(|(_, a)| a.is_complete() || a.is_failed())
            .map(|(h, _)| *h)
            .collect();
        for hash in done {
            let mut acquire = match self.acquiring.remove(&hash) {
                Some(acquire) => acquire,
                None => continue,
            };
            if let Some(map) = acquire.take_map() {
                self.map_complete(hash, map, true);
            } else {
                warn!(target: "consensus", set = %hash, "acquisition failed");
            }
        }
        let open_seq = self.ctx.ledger_master.open_seq();
        for tx in self.filter.drain_new_transactions() {
            let _ = self.ctx.ledger_master.submit(Arc::new(tx), open_seq);
        }
    }

    fn poll_acquires(&mut self, now_ms: u64) {
        let timeout = self.ctx.config.tx_acquire_timeout_ms;
        for acquire in self.acquiring.values_mut() {
            acquire.on_timer(now_ms, timeout, self.ctx.network.as_ref(), self.filter.as_ref());
        }
        self.harvest_acquires();

        if let Some(acquiring) = &mut self.acquiring_ledger {
            acquiring.on_timer(now_ms, timeout, self.ctx.network.as_ref(), self.filter.as_ref());
            if acquiring.is_complete() {
                if let Some(ledger) = acquiring.take_ledger() {
                    let hash = ledger.hash();
                    self.ctx.ledger_master.install_acquired(ledger);
                    self.acquiring_ledger = None;
                    info!(target: "consensus", lcl = %hash, "acquired the consensus ledger");
                    self.handle_lcl(hash, now_ms);
                }
            }
        }
    }

    /// A transaction set is now fully held: index it, create disputes
    /// against our position, and update votes for peers proposing it.
    pub fn map_complete(&mut self, hash: Hash256, map: SHAMap, acquired: bool) {
        if acquired {
            info!(target: "consensus", set = %hash, "transaction set acquired");
        }
        debug_assert_eq!(hash, map.root_hash());
        if self.acquired.contains_key(&hash) {
            self.acquiring.remove(&hash);
            return;
        }

        // Differences against our position become disputed transactions.
        let mut fresh_disputes: Vec<(Hash256, Vec<u8>)> = Vec::new();
        if let Some(our) = &self.our_position {
            if !our.is_bow_out() && *our.position() != hash {
                if let Some(our_map) = self.acquired.get(our.position()) {
                    match our_map.compare(&map, self.ctx.config.max_diff) {
                        Ok(Some(diff)) => {
                            for (txid, (ours, theirs)) in diff {
                                let item = ours.or(theirs).expect("diff entries carry an item");
                                fresh_disputes.push((txid, item.data().to_vec()));
                            }
                        }
                        Ok(None) => {
                            warn!(target: "consensus", set = %hash, "set differs beyond the dispute bound");
                        }
                        Err(err) => {
                            warn!(target: "consensus", %err, "dispute diff failed");
                        }
                    }
                }
            }
        }
        for (txid, tx) in fresh_disputes {
            self.add_disputed_tx(txid, tx);
        }

        self.acquired.insert(hash, map);
        self.acquiring.remove(&hash);

        let peers_here: Vec<PeerId> = self
            .peer_positions
            .iter()
            .filter(|(_, p)| *p.position() == hash && !p.is_bow_out())
            .map(|(peer, _)| *peer)
            .collect();
        if !peers_here.is_empty() {
            let set = &self.acquired[&hash];
            for dispute in self.disputes.values_mut() {
                let has = set.has(dispute.txid()).unwrap_or(false);
                for peer in &peers_here {
                    dispute.set_vote(*peer, has);
                }
            }
        } else if acquired {
            warn!(target: "consensus", set = %hash, "no peer proposes this set anymore");
        }

        self.ctx.network.broadcast(PeerMessage::HaveTxSet {
            status: TxSetStatus::Have,
            hash,
        });
    }

    fn add_disputed_tx(&mut self, txid: Hash256, tx: Vec<u8>) {
        if self.disputes.contains_key(&txid) {
            return;
        }
        debug!(target: "consensus", %txid, "transaction is disputed");
        let our_vote = self
            .our_position
            .as_ref()
            .and_then(|our| self.acquired.get(our.position()))
            .map(|map| map.has(&txid).unwrap_or(false))
            .unwrap_or(false);
        let mut dispute = DisputedTx::new(txid, tx, our_vote);
        for (peer, position) in &self.peer_positions {
            if position.is_bow_out() || position.is_initial_close_estimate() {
                continue;
            }
            if let Some(set) = self.acquired.get(position.position()) {
                dispute.set_vote(*peer, set.has(&txid).unwrap_or(false));
            }
        }
        self.disputes.insert(txid, dispute);
    }

    /// Re-votes every dispute on the rising threshold, recomputes the
    /// close-time tally, and publishes a new position if anything moved.
    fn update_our_positions(&mut self, _now_ms: u64) {
        let now_net = self.ctx.clock.network_time();
        let peer_cutoff = now_net.saturating_sub(self.ctx.config.propose_freshness_secs);
        let our_cutoff = now_net.saturating_sub(self.ctx.config.propose_interval_secs);

        // Expire stale peer positions, removing their dispute votes.
        let stale: Vec<PeerId> = self
            .peer_positions
            .iter()
            .filter(|(_, p)| p.is_stale(peer_cutoff))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in stale {
            warn!(target: "consensus", %peer, "removing stale proposal");
            for dispute in self.disputes.values_mut() {
                dispute.clear_vote(&peer);
            }
            self.peer_positions.remove(&peer);
        }

        let (our_hash, our_close_time, our_stale) = match &self.our_position {
            Some(our) => (*our.position(), our.close_time(), our.is_stale(our_cutoff)),
            None => return,
        };

        // Dispute re-votes; the first flip forks our candidate set.
        let mut new_set: Option<SHAMap> = None;
        let proposing = self.proposing;
        let close_percent = self.close_percent;
        for dispute in self.disputes.values_mut() {
            if dispute.update_vote(close_percent, proposing) {
                if new_set.is_none() {
                    new_set = Some(
                        self.acquired
                            .get_mut(&our_hash)
                            .expect("our own position set is always held")
                            .snapshot(true),
                    );
                }
                let set = new_set.as_mut().expect("created above");
                if dispute.our_vote() {
                    let _ = set.add(
                        Item::new(*dispute.txid(), dispute.tx_bytes().to_vec()),
                        LeafKind::TxnNoMeta,
                    );
                } else {
                    let _ = set.delete(dispute.txid());
                }
            }
        }

        // Close-time consensus: find the bucket that carries the needed
        // fraction of proposers.
        let resolution = self.close_resolution;
        let mut buckets: BTreeMap<u32, usize> = BTreeMap::new();
        for position in self.peer_positions.values() {
            if position.is_bow_out() {
                continue;
            }
            *buckets
                .entry(round_close_time(position.close_time(), resolution))
                .or_insert(0) += 1;
        }

        self.have_close_time_consensus = false;
        let mut agreed_close = 0u32;
        if self.peer_positions.is_empty() {
            self.have_close_time_consensus = true;
            agreed_close = round_close_time(our_close_time, resolution);
        } else {
            let mut participants = self
                .peer_positions
                .values()
                .filter(|p| !p.is_bow_out())
                .count();
            if proposing {
                *buckets
                    .entry(round_close_time(our_close_time, resolution))
                    .or_insert(0) += 1;
                participants += 1;
            }
            let needed = timing::needed_weight(close_percent) as usize;
            let ct_pct = timing::AV_CT_CONSENSUS_PCT as usize;
            let mut thresh_vote = (((participants * needed) + needed / 2) / 100).max(1);
            let thresh_consensus = (((participants * ct_pct) + ct_pct / 2) / 100).max(1);
            debug!(
                target: "consensus",
                proposers = participants,
                needed,
                thresh_vote,
                thresh_consensus,
                "close-time tally"
            );
            for (bucket, votes) in &buckets {
                if *votes >= thresh_vote {
                    agreed_close = *bucket;
                    thresh_vote = *votes;
                    if thresh_vote >= thresh_consensus {
                        self.have_close_time_consensus = true;
                    }
                }
            }
        }

        let mut changed = new_set.is_some();
        if !changed
            && (agreed_close != round_close_time(our_close_time, resolution) || our_stale)
        {
            // Close time moved (or our proposal aged out): re-publish on
            // the same transaction set.
            changed = true;
            new_set = Some(
                self.acquired
                    .get_mut(&our_hash)
                    .expect("our own position set is always held")
                    .snapshot(true),
            );
        }

        if changed {
            let mut set = new_set.expect("changed implies a forked set");
            set.set_immutable();
            let new_hash = set.root_hash();
            info!(
                target: "consensus",
                position = %new_hash,
                close = agreed_close,
                "position change"
            );
            let advanced = match &mut self.our_position {
                Some(our) => our.change_position(new_hash, agreed_close, now_net),
                None => false,
            };
            if advanced {
                self.map_complete(new_hash, set, false);
                if self.proposing {
                    self.propose();
                }
            }
        }
    }

    fn propose(&mut self) {
        let keys = match &self.ctx.keys {
            Some(keys) => keys,
            None => return,
        };
        if let Some(our) = &mut self.our_position {
            our.sign(keys);
            trace!(
                target: "consensus",
                seq = our.propose_seq(),
                position = %our.position(),
                "we propose"
            );
            self.ctx.network.broadcast(PeerMessage::Proposal(our.clone()));
        }
    }

    // ---- LCL tracking ----------------------------------------------------

    /// Asks the validation record which previous ledger the trusted set
    /// favours; a mismatch means we are on a fork and must switch.
    fn check_lcl(&mut self, now_ms: u64) {
        let prior = if self.have_correct_lcl {
            Some(*self.previous_ledger.parent_hash())
        } else {
            None
        };
        let counts = self
            .ctx
            .validations
            .current_validations(&self.prev_ledger_hash, prior.as_ref());

        let mut net_lgr = self.prev_ledger_hash;
        let mut net_count = 0usize;
        // Deterministic scan order so ties cannot flap between calls.
        let mut ranked: Vec<(&Hash256, &(usize, PeerId))> = counts.iter().collect();
        ranked.sort_by(|a, b| (a.1 .0, a.0).cmp(&(b.1 .0, b.0)));
        for (hash, (count, _max_id)) in ranked {
            if *count > net_count || (*count == net_count && *hash == self.prev_ledger_hash) {
                net_lgr = *hash;
                net_count = *count;
            }
        }

        if net_lgr != self.prev_ledger_hash {
            warn!(
                target: "consensus",
                from = %self.prev_ledger_hash,
                to = %net_lgr,
                state = ?self.state,
                "view of consensus changed (fork detected)"
            );
            self.handle_lcl(net_lgr, now_ms);
        } else if self.previous_ledger.hash() != self.prev_ledger_hash {
            self.handle_lcl(net_lgr, now_ms);
        }
    }

    fn handle_lcl(&mut self, lcl_hash: Hash256, now_ms: u64) {
        if self.prev_ledger_hash != lcl_hash {
            // First time switching to this ledger: abandon the round state
            // built on the wrong chain.
            self.prev_ledger_hash = lcl_hash;
            if self.have_correct_lcl && self.proposing && self.our_position.is_some() {
                info!(target: "consensus", "bowing out of consensus");
                let now_net = self.ctx.clock.network_time();
                if let Some(our) = &mut self.our_position {
                    our.bow_out(now_net);
                }
                self.propose();
            }
            self.proposing = false;
            self.peer_positions.clear();
            self.disputes.clear();
            self.close_times.clear();
            self.dead_nodes.clear();
        }

        if self.previous_ledger.hash() == self.prev_ledger_hash {
            self.have_correct_lcl = true;
            return;
        }

        if let Some(ledger) = self.ctx.ledger_master.ledger_by_hash(&lcl_hash) {
            debug_assert!(ledger.is_closed());
            self.previous_ledger = ledger;
            self.have_correct_lcl = true;
            self.close_resolution = next_close_resolution(
                self.previous_ledger.close_resolution(),
                self.previous_ledger.close_agree(),
                self.previous_ledger.seq() + 1,
            );
            info!(target: "consensus", lcl = %lcl_hash, "have the consensus ledger");
            return;
        }

        let already = self
            .acquiring_ledger
            .as_ref()
            .map_or(false, |a| *a.hash() == lcl_hash);
        if !already {
            warn!(target: "consensus", lcl = %lcl_hash, "need the consensus ledger");
            let mut acquire = LedgerAcquire::new(lcl_hash, self.ctx.store.clone(), now_ms);
            acquire.request(self.ctx.network.as_ref(), self.filter.as_ref());
            self.acquiring_ledger = Some(acquire);
        }
        self.have_correct_lcl = false;
    }

    /// Ledger-acquisition data routed from the wire.
    pub fn ledger_data(
        &mut self,
        ledger_hash: Hash256,
        info_type: LedgerInfoType,
        ids: &[Vec<u8>],
        blobs: &[Vec<u8>],
        now_ms: u64,
    ) -> AddResult {
        let acquiring = match &mut self.acquiring_ledger {
            Some(a) if *a.hash() == ledger_hash => a,
            _ => return AddResult::okay(),
        };
        let network = self.ctx.network.as_ref();
        let result = match info_type {
            LedgerInfoType::Base => match blobs.first() {
                Some(header) => {
                    acquiring.take_base(header, network, self.filter.as_ref(), now_ms)
                }
                None => AddResult::invalid(),
            },
            LedgerInfoType::TxSet | LedgerInfoType::AccountState => {
                acquiring.take_nodes(info_type, ids, blobs, network, self.filter.as_ref(), now_ms)
            }
            LedgerInfoType::Candidate => AddResult::okay(),
        };
        self.poll_acquires(now_ms);
        result
    }

    // ---- accept ----------------------------------------------------------

    fn apply_one(
        &self,
        tx: &Transaction,
        ledger: &mut Ledger,
        open_ledger: bool,
        retry_assured: bool,
    ) -> meridian_types::ApplyResult {
        let engine = self.ctx.engine.as_ref();
        // An engine panic must not take the round down; it costs the
        // transaction its slot instead.
        catch_unwind(AssertUnwindSafe(|| {
            engine.apply(tx, ledger, open_ledger, retry_assured)
        }))
        .unwrap_or_else(|_| {
            warn!(target: "consensus", txid = %tx.id(), "transaction engine panicked");
            meridian_types::ApplyResult::Fail
        })
    }

    /// Multi-pass application of a transaction set: retriable passes first,
    /// then final passes that no longer promise a retry.
    fn apply_transactions(
        &self,
        candidates: &[Transaction],
        target: &mut Ledger,
        check: Option<&Ledger>,
        failed: &mut CanonicalTxSet,
        open_ledger: bool,
    ) {
        for tx in candidates {
            let duplicate = match check {
                Some(check) => check.has_transaction(tx.id()).unwrap_or(false),
                None => false,
            };
            if duplicate {
                continue;
            }
            debug!(target: "consensus", txid = %tx.id(), "processing candidate transaction");
            if self.apply_one(tx, target, open_ledger, true) == meridian_types::ApplyResult::Retry {
                failed.insert(Arc::new(tx.clone()));
            }
        }

        let mut certain_retry = true;
        for pass in 0..self.ctx.config.total_passes {
            let mut changes = 0;
            for tx in failed.transactions() {
                match self.apply_one(&tx, target, open_ledger, certain_retry) {
                    meridian_types::ApplyResult::Success => {
                        failed.remove(&tx);
                        changes += 1;
                    }
                    meridian_types::ApplyResult::Fail | meridian_types::ApplyResult::Local => {
                        failed.remove(&tx);
                    }
                    meridian_types::ApplyResult::Retry => {}
                }
            }
            debug!(target: "consensus", pass, changes, "application pass finished");
            if changes == 0 && !certain_retry {
                return;
            }
            if changes == 0 || pass >= self.ctx.config.retry_passes {
                certain_retry = false;
            }
        }
    }

    fn set_transactions(&self, set_hash: &Hash256) -> Vec<Transaction> {
        let mut out = Vec::new();
        let set = match self.acquired.get(set_hash) {
            Some(set) => set,
            None => return out,
        };
        let mut cursor = set.first().ok().flatten();
        while let Some(item) = cursor {
            out.push(Transaction::from_raw(item.data().to_vec()));
            cursor = set.next(item.tag()).ok().flatten();
        }
        out
    }

    /// Finished → Accepted: apply the agreed set to a child of the previous
    /// ledger, flush, validate, install the new open ledger.
    fn accept(&mut self, _now_ms: u64) -> Result<(), ConsensusError> {
        let our = self
            .our_position
            .as_ref()
            .expect("cannot accept without a position");
        let set_hash = *our.position();
        let raw_close = our.close_time();

        let agreed_close = round_close_time(raw_close, self.close_resolution);
        let close_agree = agreed_close != 0;
        let final_close = if close_agree {
            agreed_close
        } else {
            // We agreed to disagree; stamp a time no honest bucket used.
            self.previous_ledger.close_time() + 1
        };

        info!(
            target: "consensus",
            set = %set_hash,
            close = final_close,
            close_agree,
            proposing = self.proposing,
            validating = self.validating,
            fail = self.consensus_fail,
            "accepting consensus set"
        );

        let candidates = self.set_transactions(&set_hash);
        let mut failed = CanonicalTxSet::new(set_hash);

        let mut new_lcl = Ledger::open_from_accepted(&self.previous_ledger);
        new_lcl.arm_maps();
        self.apply_transactions(&candidates, &mut new_lcl, None, &mut failed, false);
        new_lcl.close(final_close);
        new_lcl.freeze_maps();
        new_lcl.set_accepted(final_close, self.close_resolution, close_agree);
        new_lcl.flush_to_store(self.ctx.store.as_ref())?;

        let new_hash = new_lcl.hash();
        info!(target: "consensus", ledger = %new_hash, seq = new_lcl.seq(), "built new last closed ledger");
        self.status_change_for(NodeEvent::Accepted, &new_lcl);

        if self.validating && self.have_correct_lcl && !self.consensus_fail {
            let keys = self.ctx.keys.as_ref().expect("validating implies keys");
            let mut validation = Validation::new(
                new_hash,
                new_lcl.seq(),
                self.ctx.clock.network_time(),
                keys.public(),
                self.proposing,
            );
            validation.sign(keys);
            self.ctx.validations.add_validation(validation.clone(), "local");
            self.ctx
                .network
                .broadcast(PeerMessage::Validation(validation));
        } else {
            info!(target: "consensus", ledger = %new_hash, "not validating this ledger");
        }

        // Build the next open ledger and carry forward what did not make it:
        // disputes we voted NO on, then the leftover open-ledger txns.
        let mut new_open = Ledger::open_from_accepted(&new_lcl);
        for dispute in self.disputes.values() {
            if dispute.our_vote() {
                continue;
            }
            debug!(target: "consensus", txid = %dispute.txid(), "re-applying losing dispute");
            let tx = Transaction::from_raw(dispute.tx_bytes().to_vec());
            if self.apply_one(&tx, &mut new_open, true, false)
                == meridian_types::ApplyResult::Retry
            {
                failed.insert(Arc::new(tx));
            }
        }

        let leftovers = {
            let snapshot = self.ctx.ledger_master.open_tx_snapshot();
            let mut out = Vec::new();
            let mut cursor = snapshot.first().ok().flatten();
            while let Some(item) = cursor {
                out.push(Transaction::from_raw(item.data().to_vec()));
                cursor = snapshot.next(item.tag()).ok().flatten();
            }
            out
        };
        self.apply_transactions(&leftovers, &mut new_open, Some(&new_lcl), &mut failed, true);

        let proposers = self.peer_positions.len();
        self.ctx
            .ledger_master
            .push_ledger(new_lcl, new_open, !self.consensus_fail)?;

        self.result = Some(RoundResult {
            new_ledger_hash: new_hash,
            had_consensus: !self.consensus_fail,
            proposers,
            round_ms: self.current_ms.max(1),
        });
        self.state = ConsensusState::Accepted;
        Ok(())
    }

    fn status_change(&self, event: NodeEvent) {
        self.status_change_for(event, self.previous_ledger.as_ref());
    }

    fn status_change_for(&self, event: NodeEvent, ledger: &Ledger) {
        let event = if self.have_correct_lcl {
            event
        } else {
            NodeEvent::LostSync
        };
        let (first_seq, last_seq) = self.ctx.ledger_master.validated_range();
        self.ctx.network.broadcast(PeerMessage::StatusChange(StatusChange {
            event,
            ledger_seq: ledger.seq(),
            network_time: self.ctx.clock.network_time(),
            ledger_hash: ledger.hash(),
            prev_ledger_hash: *ledger.parent_hash(),
            first_seq,
            last_seq,
        }));
    }
}
