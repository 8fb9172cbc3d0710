// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-demand fetchers.
//!
//! [`TransactionAcquire`] pulls a candidate transaction set we only know by
//! hash from whichever peers advertise it, rotating peers on stall and
//! falling back to a broadcast when nobody answers. [`LedgerAcquire`] does
//! the same for a whole ledger (header, then both trees) when we discover
//! the network validated a ledger we do not have.

use crate::context::{NetworkSink, PeerId};
use meridian_crypto::Hash256;
use meridian_infallible::Mutex;
use meridian_ledger::Ledger;
use meridian_shamap::{AddResult, LeafKind, MapType, NodeFormat, NodeId, SHAMap, SyncFilter};
use meridian_store::HashedObjectStore;
use meridian_types::{LedgerInfoType, PeerMessage, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bounded cache of recently fetched tree nodes (PREFIXED bytes), shared
/// between concurrent acquisitions so one peer's answer serves every map
/// that needs the node.
pub struct TempNodeCache {
    capacity: usize,
    nodes: Mutex<HashMap<Hash256, Vec<u8>>>,
}

impl TempNodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, hash: Hash256, bytes: Vec<u8>) {
        let mut nodes = self.nodes.lock();
        if nodes.len() >= self.capacity {
            nodes.clear();
        }
        nodes.insert(hash, bytes);
    }

    pub fn fetch(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.nodes.lock().get(hash).cloned()
    }
}

impl Default for TempNodeCache {
    fn default() -> Self {
        Self::new(16_384)
    }
}

/// Sync filter for candidate transaction sets: resolves nodes from the temp
/// cache, and captures every transaction we first learn about from a peer's
/// proposed set so it can be submitted locally.
pub struct TxSetFilter {
    cache: Arc<TempNodeCache>,
    new_transactions: Mutex<Vec<Transaction>>,
}

impl TxSetFilter {
    pub fn new(cache: Arc<TempNodeCache>) -> Self {
        Self {
            cache,
            new_transactions: Mutex::new(Vec::new()),
        }
    }

    /// Transactions first seen inside acquired sets, for local submission.
    pub fn drain_new_transactions(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.new_transactions.lock())
    }
}

impl SyncFilter for TxSetFilter {
    fn have_node(&self, _id: &NodeId, hash: &Hash256) -> Option<Vec<u8>> {
        self.cache.fetch(hash)
    }

    fn got_node(&self, _id: &NodeId, hash: &Hash256, prefixed: &[u8], kind: Option<LeafKind>) {
        self.cache.store(*hash, prefixed.to_vec());
        if kind == Some(LeafKind::TxnNoMeta) {
            // PREFIXED leaf: prefix(4) ‖ tag(32) ‖ len(2) ‖ data.
            if prefixed.len() > 38 {
                let data = prefixed[38..].to_vec();
                let tx = Transaction::from_raw(data);
                debug!(target: "consensus", txid = %tx.id(), "proposed set carries a transaction we lacked");
                self.new_transactions.lock().push(tx);
            }
        }
    }
}

/// One missing transaction set. Drives `GetLedger(Candidate)` requests at
/// the peers that advertised the hash, feeding verified nodes into the
/// destination map until it completes.
pub struct TransactionAcquire {
    hash: Hash256,
    map: Option<SHAMap>,
    have_root: bool,
    complete: bool,
    failed: bool,
    peers: Vec<PeerId>,
    timeouts: u32,
    last_progress_ms: u64,
}

impl TransactionAcquire {
    pub fn new(hash: Hash256, store: Arc<HashedObjectStore>, now_ms: u64) -> Self {
        Self {
            hash,
            map: Some(SHAMap::new_synching(MapType::Transaction, hash).with_store(store)),
            have_root: false,
            complete: false,
            failed: false,
            peers: Vec::new(),
            timeouts: 0,
            last_progress_ms: now_ms,
        }
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// The finished, immutable map. Valid once `is_complete`.
    pub fn take_map(&mut self) -> Option<SHAMap> {
        if self.complete {
            self.map.take()
        } else {
            None
        }
    }

    /// A peer advertised this set; remember it and ask it for data.
    pub fn peer_has(
        &mut self,
        peer: PeerId,
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
    ) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
        self.request(Some(peer), network, filter);
    }

    fn request(
        &mut self,
        peer: Option<PeerId>,
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
    ) {
        if self.complete || self.failed {
            return;
        }
        let node_ids = if self.have_root {
            let map = match &mut self.map {
                Some(map) => map,
                None => return,
            };
            let missing = match map.get_missing_nodes(256, filter) {
                Ok(missing) => missing,
                Err(err) => {
                    warn!(target: "consensus", %err, "transaction set walk failed");
                    return;
                }
            };
            if missing.is_empty() {
                self.finish();
                return;
            }
            missing.iter().map(|(id, _)| id.to_wire()).collect()
        } else {
            vec![NodeId::root().to_wire()]
        };

        let msg = PeerMessage::GetLedger {
            ledger_hash: self.hash,
            info_type: LedgerInfoType::Candidate,
            node_ids,
        };
        let target = peer.or_else(|| {
            if self.peers.is_empty() {
                None
            } else {
                Some(self.peers[self.timeouts as usize % self.peers.len()])
            }
        });
        match target {
            Some(peer) => network.send(&peer, msg),
            None => network.broadcast(msg),
        }
    }

    /// Ingests one `LedgerData(Candidate)` reply. Any invalid node ends the
    /// sending peer's contribution to this sync.
    pub fn take_nodes(
        &mut self,
        ids: &[Vec<u8>],
        blobs: &[Vec<u8>],
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
        now_ms: u64,
    ) -> AddResult {
        if self.complete || self.failed || ids.len() != blobs.len() || ids.is_empty() {
            return AddResult::okay();
        }
        let map = match &mut self.map {
            Some(map) => map,
            None => return AddResult::okay(),
        };
        let mut combined = AddResult::okay();
        for (raw_id, bytes) in ids.iter().zip(blobs.iter()) {
            let id = match NodeId::from_wire(raw_id) {
                Ok(id) => id,
                Err(_) => return AddResult::invalid(),
            };
            let result = if id.is_root() {
                if self.have_root {
                    AddResult::okay()
                } else {
                    let r = map.add_root_node(Some(&self.hash), bytes, NodeFormat::Wire, filter);
                    if !r.is_invalid() {
                        self.have_root = true;
                    }
                    r
                }
            } else {
                match map.add_known_node(&id, bytes, filter) {
                    Ok(r) => r,
                    Err(err) => {
                        warn!(target: "consensus", %err, "node install failed");
                        AddResult::okay()
                    }
                }
            };
            if !combined.combine(result) {
                warn!(target: "consensus", set = %self.hash, "peer sent bad transaction set data");
                return combined;
            }
        }
        if combined.is_useful() {
            self.last_progress_ms = now_ms;
        }
        self.request(None, network, filter);
        combined
    }

    /// Stall handling: after a timeout without progress, rotate to another
    /// advertising peer; with none left, ask everyone.
    pub fn on_timer(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
    ) {
        if self.complete || self.failed {
            return;
        }
        if now_ms.saturating_sub(self.last_progress_ms) < timeout_ms {
            return;
        }
        self.timeouts += 1;
        self.last_progress_ms = now_ms;
        if self.peers.is_empty() {
            debug!(target: "consensus", set = %self.hash, "no peers advertise this set; broadcasting");
            self.request(None, network, filter);
        } else {
            self.request(None, network, filter); // rotation via the timeout counter
        }
    }

    fn finish(&mut self) {
        if let Some(map) = &self.map {
            if map.is_valid() {
                info!(target: "consensus", set = %self.hash, "acquired transaction set");
                self.complete = true;
                return;
            }
        }
        warn!(target: "consensus", set = %self.hash, "failed to acquire transaction set");
        self.failed = true;
    }
}

/// Fetches a whole ledger by hash: the header first, then both trees via
/// the map sync protocol. Used when the trusted validator set has moved to
/// a last-closed ledger we never built.
pub struct LedgerAcquire {
    hash: Hash256,
    store: Arc<HashedObjectStore>,
    ledger: Option<Ledger>,
    complete: bool,
    failed: bool,
    timeouts: u32,
    last_progress_ms: u64,
}

impl LedgerAcquire {
    pub fn new(hash: Hash256, store: Arc<HashedObjectStore>, now_ms: u64) -> Self {
        Self {
            hash,
            store,
            ledger: None,
            complete: false,
            failed: false,
            timeouts: 0,
            last_progress_ms: now_ms,
        }
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The acquired ledger, accepted and immutable. Valid once complete.
    pub fn take_ledger(&mut self) -> Option<Ledger> {
        if self.complete {
            self.ledger.take()
        } else {
            None
        }
    }

    pub fn request(&mut self, network: &dyn NetworkSink, filter: &dyn SyncFilter) {
        if self.complete || self.failed {
            return;
        }
        if self.ledger.is_none() {
            network.broadcast(PeerMessage::GetLedger {
                ledger_hash: self.hash,
                info_type: LedgerInfoType::Base,
                node_ids: Vec::new(),
            });
            return;
        }

        let mut all_present = true;
        let mut to_send = Vec::new();
        if let Some(ledger) = &mut self.ledger {
            for pass in 0..2 {
                let (info_type, map) = if pass == 0 {
                    (LedgerInfoType::TxSet, ledger.tx_map_mut())
                } else {
                    (LedgerInfoType::AccountState, ledger.state_map_mut())
                };
                if !map.is_synching() {
                    continue;
                }
                match map.get_missing_nodes(256, filter) {
                    Ok(missing) => {
                        if map.is_synching() {
                            all_present = false;
                        }
                        if !missing.is_empty() {
                            to_send.push((
                                info_type,
                                missing.iter().map(|(id, _)| id.to_wire()).collect(),
                            ));
                        }
                    }
                    Err(err) => {
                        warn!(target: "consensus", %err, "ledger tree walk failed");
                        all_present = false;
                    }
                }
            }
        }
        for (info_type, node_ids) in to_send {
            network.broadcast(PeerMessage::GetLedger {
                ledger_hash: self.hash,
                info_type,
                node_ids,
            });
        }
        if all_present {
            self.finish();
        }
    }

    /// Ingests a ledger header. Anything that does not hash to the ledger
    /// we are after is ignored.
    pub fn take_base(
        &mut self,
        header: &[u8],
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
        now_ms: u64,
    ) -> AddResult {
        if self.ledger.is_some() || self.complete || self.failed {
            return AddResult::okay();
        }
        let ledger = match Ledger::from_header_bytes(header, self.store.clone()) {
            Some(ledger) => ledger,
            None => return AddResult::invalid(),
        };
        if ledger.hash() != self.hash {
            warn!(target: "consensus", want = %self.hash, "ledger header hashes elsewhere");
            return AddResult::invalid();
        }
        info!(target: "consensus", ledger = %self.hash, seq = ledger.seq(), "have ledger base");
        self.ledger = Some(ledger);
        self.last_progress_ms = now_ms;
        self.request(network, filter);
        AddResult::useful()
    }

    /// Ingests tree nodes for one of the two maps.
    pub fn take_nodes(
        &mut self,
        info_type: LedgerInfoType,
        ids: &[Vec<u8>],
        blobs: &[Vec<u8>],
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
        now_ms: u64,
    ) -> AddResult {
        if self.complete || self.failed || ids.len() != blobs.len() {
            return AddResult::okay();
        }
        let ledger = match &mut self.ledger {
            Some(ledger) => ledger,
            None => return AddResult::okay(),
        };
        let map = match info_type {
            LedgerInfoType::TxSet => ledger.tx_map_mut(),
            LedgerInfoType::AccountState => ledger.state_map_mut(),
            _ => return AddResult::okay(),
        };
        let mut combined = AddResult::okay();
        for (raw_id, bytes) in ids.iter().zip(blobs.iter()) {
            let id = match NodeId::from_wire(raw_id) {
                Ok(id) => id,
                Err(_) => return AddResult::invalid(),
            };
            let result = if id.is_root() {
                map.add_root_node(None, bytes, NodeFormat::Wire, filter)
            } else {
                match map.add_known_node(&id, bytes, filter) {
                    Ok(r) => r,
                    Err(err) => {
                        warn!(target: "consensus", %err, "ledger node install failed");
                        AddResult::okay()
                    }
                }
            };
            if !combined.combine(result) {
                return combined;
            }
        }
        if combined.is_useful() {
            self.last_progress_ms = now_ms;
        }
        self.request(network, filter);
        combined
    }

    pub fn on_timer(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
        network: &dyn NetworkSink,
        filter: &dyn SyncFilter,
    ) {
        if self.complete || self.failed {
            return;
        }
        if now_ms.saturating_sub(self.last_progress_ms) < timeout_ms {
            return;
        }
        self.timeouts += 1;
        self.last_progress_ms = now_ms;
        self.request(network, filter);
    }

    fn finish(&mut self) {
        let ledger = match &mut self.ledger {
            Some(ledger) => ledger,
            None => return,
        };
        let (close_time, resolution, agree) = (
            ledger.close_time(),
            ledger.close_resolution(),
            ledger.close_agree(),
        );
        ledger.set_accepted(close_time, resolution, agree);
        info!(target: "consensus", ledger = %self.hash, "ledger fully acquired");
        self.complete = true;
    }
}
