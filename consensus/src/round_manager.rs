// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drives consensus rounds back to back and routes peer traffic into the
//! current round: verify, dispatch, serve. Proposals for a previous ledger
//! we have not reached yet are parked and replayed once a round starts on
//! that ledger.

use crate::{
    acquire::{TempNodeCache, TxSetFilter},
    consensus::{ConsensusState, LedgerConsensus},
    context::{CoreContext, PeerId},
    ConsensusError,
};
use meridian_crypto::Hash256;
use meridian_shamap::NodeId;
use meridian_types::{LedgerInfoType, PeerMessage, Proposal};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bound on parked proposals; beyond this the oldest are dropped.
const MAX_DEFERRED_PROPOSALS: usize = 128;

pub struct RoundManager {
    ctx: Arc<CoreContext>,
    temp_cache: Arc<TempNodeCache>,
    filter: Arc<TxSetFilter>,
    round: Option<LedgerConsensus>,
    deferred_proposals: Vec<Proposal>,
    previous_proposers: usize,
    previous_round_ms: u64,
    close_time_offset: i64,
}

impl RoundManager {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        let temp_cache = Arc::new(TempNodeCache::default());
        let filter = Arc::new(TxSetFilter::new(temp_cache.clone()));
        Self {
            ctx,
            temp_cache,
            filter,
            round: None,
            deferred_proposals: Vec::new(),
            previous_proposers: 0,
            previous_round_ms: 4_000,
            close_time_offset: 0,
        }
    }

    pub fn round(&self) -> Option<&LedgerConsensus> {
        self.round.as_ref()
    }

    pub fn close_time_offset(&self) -> i64 {
        self.close_time_offset
    }

    /// One turn of the crank: start a round if none is live, advance it,
    /// and retire it once accepted.
    pub fn tick(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        if self.round.is_none() {
            self.start_round(now_ms);
        }
        if let Some(round) = &mut self.round {
            round.timer_entry(now_ms)?;
            if round.state() == ConsensusState::Accepted {
                self.close_time_offset = round.close_time_offset();
                if let Some(result) = round.take_result() {
                    info!(
                        target: "consensus",
                        ledger = %result.new_ledger_hash,
                        proposers = result.proposers,
                        round_ms = result.round_ms,
                        "round complete"
                    );
                    self.previous_proposers = result.proposers;
                    self.previous_round_ms = result.round_ms;
                }
                self.round = None;
            }
        }
        Ok(())
    }

    fn start_round(&mut self, now_ms: u64) {
        let last_closed = self.ctx.ledger_master.last_closed();
        let prev_hash = last_closed.hash();
        let mut round = LedgerConsensus::new(
            self.ctx.clone(),
            self.filter.clone(),
            prev_hash,
            last_closed,
            self.previous_proposers,
            self.previous_round_ms,
            now_ms,
        );

        // Replay proposals that arrived before we reached this ledger.
        let (replay, keep): (Vec<Proposal>, Vec<Proposal>) = self
            .deferred_proposals
            .drain(..)
            .partition(|p| p.prev_ledger() == round.prev_ledger_hash());
        for proposal in replay {
            debug!(target: "consensus", "applying stored proposal");
            round.peer_position(proposal);
        }
        self.deferred_proposals = keep;
        self.round = Some(round);
    }

    /// Routes one verified-on-arrival peer message.
    pub fn handle_message(&mut self, from: PeerId, msg: PeerMessage, now_ms: u64) {
        match msg {
            PeerMessage::Hello { .. } => {}
            PeerMessage::Proposal(proposal) => self.handle_proposal(proposal),
            PeerMessage::Validation(validation) => {
                if !validation.verify_signature() {
                    warn!(target: "consensus", "validation with a bad signature dropped");
                    return;
                }
                self.ctx.validations.add_validation(validation, "peer");
            }
            PeerMessage::GetLedger {
                ledger_hash,
                info_type,
                node_ids,
            } => self.serve_get_ledger(from, ledger_hash, info_type, &node_ids),
            PeerMessage::LedgerData {
                ledger_hash,
                info_type,
                node_ids,
                nodes,
            } => {
                if let Some(round) = &mut self.round {
                    match info_type {
                        LedgerInfoType::Candidate => {
                            round.peer_gave_nodes(ledger_hash, &node_ids, &nodes, now_ms);
                        }
                        _ => {
                            round.ledger_data(ledger_hash, info_type, &node_ids, &nodes, now_ms);
                        }
                    }
                }
            }
            PeerMessage::HaveTxSet { status, hash } => {
                if let Some(round) = &mut self.round {
                    round.peer_has_set(from, hash, status);
                }
            }
            PeerMessage::StatusChange(_) => {}
            PeerMessage::GetObject { hash } => {
                if let Ok(Some(data)) = self.ctx.store.get(&hash) {
                    self.ctx
                        .network
                        .send(&from, PeerMessage::Object { hash, data: (*data).clone() });
                }
            }
            PeerMessage::Object { hash, data } => {
                self.temp_cache.store(hash, data);
            }
        }
    }

    fn handle_proposal(&mut self, proposal: Proposal) {
        if !proposal.verify_signature() {
            warn!(target: "consensus", "proposal with a bad signature dropped");
            return;
        }
        let for_current = self
            .round
            .as_ref()
            .map_or(false, |round| proposal.prev_ledger() == round.prev_ledger_hash());
        if for_current {
            if let Some(round) = &mut self.round {
                round.peer_position(proposal);
            }
            return;
        }
        debug!(target: "consensus", "storing proposal for a ledger we are not on");
        self.deferred_proposals.push(proposal);
        if self.deferred_proposals.len() > MAX_DEFERRED_PROPOSALS {
            self.deferred_proposals.remove(0);
        }
    }

    /// Serves sync requests from our ledgers and held candidate sets.
    fn serve_get_ledger(
        &mut self,
        from: PeerId,
        ledger_hash: Hash256,
        info_type: LedgerInfoType,
        node_ids: &[Vec<u8>],
    ) {
        let mut ids_out: Vec<Vec<u8>> = Vec::new();
        let mut nodes_out: Vec<Vec<u8>> = Vec::new();

        match info_type {
            LedgerInfoType::Base => {
                if let Some(ledger) = self.ctx.ledger_master.ledger_by_hash(&ledger_hash) {
                    nodes_out.push(ledger.header_bytes());
                }
            }
            LedgerInfoType::Candidate => {
                if let Some(round) = &self.round {
                    if let Some(map) = round.acquired_set(&ledger_hash) {
                        serve_map(map, node_ids, &mut ids_out, &mut nodes_out);
                    }
                }
            }
            LedgerInfoType::TxSet | LedgerInfoType::AccountState => {
                if let Some(ledger) = self.ctx.ledger_master.ledger_by_hash(&ledger_hash) {
                    let map = if info_type == LedgerInfoType::TxSet {
                        ledger.tx_map()
                    } else {
                        ledger.state_map()
                    };
                    serve_map(map, node_ids, &mut ids_out, &mut nodes_out);
                }
            }
        }

        if nodes_out.is_empty() {
            return;
        }
        self.ctx.network.send(
            &from,
            PeerMessage::LedgerData {
                ledger_hash,
                info_type,
                node_ids: ids_out,
                nodes: nodes_out,
            },
        );
    }
}

fn serve_map(
    map: &meridian_shamap::SHAMap,
    node_ids: &[Vec<u8>],
    ids_out: &mut Vec<Vec<u8>>,
    nodes_out: &mut Vec<Vec<u8>>,
) {
    let requested: Vec<NodeId> = if node_ids.is_empty() {
        vec![NodeId::root()]
    } else {
        node_ids
            .iter()
            .filter_map(|raw| NodeId::from_wire(raw).ok())
            .collect()
    };
    for id in requested {
        match map.get_node_fat(&id, true, true) {
            Ok(fat) => {
                for (got_id, bytes) in fat {
                    ids_out.push(got_id.to_wire());
                    nodes_out.push(bytes);
                }
            }
            Err(err) => {
                warn!(target: "consensus", %err, "cannot serve requested node");
            }
        }
    }
}
