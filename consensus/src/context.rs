// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{timing::ConsensusConfig, unl::UniqueNodeList, validations::ValidationCollection};
use meridian_crypto::{Hash160, NodeKeypair};
use meridian_ledger::{LedgerMaster, TransactionEngine};
use meridian_shamap::FullBelowCache;
use meridian_store::HashedObjectStore;
use meridian_types::{NetworkClock, PeerMessage};
use std::sync::Arc;

/// Peers are addressed by the 160-bit digest of their node public key.
pub type PeerId = Hash160;

/// Outbound message surface. The wire transport (framing, sockets) lives
/// outside this crate; in-process tests plug in a deterministic bus.
pub trait NetworkSink: Send + Sync {
    fn broadcast(&self, msg: PeerMessage);
    fn send(&self, peer: &PeerId, msg: PeerMessage);
    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;
}

/// Shared handles to every component a consensus round touches. Passing
/// this through constructors (instead of a process-wide singleton) is what
/// lets the scenario tests run several complete nodes in one process.
pub struct CoreContext {
    pub store: Arc<HashedObjectStore>,
    pub ledger_master: Arc<LedgerMaster>,
    pub validations: Arc<ValidationCollection>,
    pub unl: Arc<UniqueNodeList>,
    pub full_below: Arc<FullBelowCache>,
    pub network: Arc<dyn NetworkSink>,
    pub clock: Arc<dyn NetworkClock>,
    pub engine: Arc<dyn TransactionEngine>,
    /// Validator identity. `None` runs the node as an observer: it counts
    /// proposals and relays but never proposes or signs.
    pub keys: Option<NodeKeypair>,
    pub config: ConsensusConfig,
}

impl CoreContext {
    pub fn our_id(&self) -> Option<PeerId> {
        self.keys.as_ref().map(|k| k.node_id())
    }
}
