// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Peer-to-peer message bodies.
//!
//! Framing (length prefix, type code) is the transport's job and out of scope
//! here; these are the typed bodies, `bcs`-encodable when bytes are needed.
//! Tree node identifiers and raw nodes travel as opaque byte strings so the
//! message layer does not depend on the map implementation.

use crate::{Proposal, Validation};
use meridian_crypto::{Hash256, NodePublicKey};
use serde::{Deserialize, Serialize};

/// What part of a ledger a `GetLedger` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerInfoType {
    /// Header fields only.
    Base,
    /// Transaction tree nodes.
    TxSet,
    /// Account-state tree nodes.
    AccountState,
    /// A candidate transaction set being voted on (not yet in any ledger).
    Candidate,
}

/// Whether a peer holds a transaction set or merely knows where to get it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxSetStatus {
    Have,
    CanGet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    Closing,
    Accepted,
    LostSync,
}

/// Broadcast when our view of the ledger chain changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub event: NodeEvent,
    pub ledger_seq: u32,
    pub network_time: u32,
    pub ledger_hash: Hash256,
    pub prev_ledger_hash: Hash256,
    /// Validated range held locally.
    pub first_seq: u32,
    pub last_seq: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Hello {
        version: u32,
        port: u16,
        public_key: NodePublicKey,
    },
    Proposal(Proposal),
    Validation(Validation),
    GetLedger {
        ledger_hash: Hash256,
        info_type: LedgerInfoType,
        /// 33-byte wire node identifiers; empty means "the root".
        node_ids: Vec<Vec<u8>>,
    },
    LedgerData {
        ledger_hash: Hash256,
        info_type: LedgerInfoType,
        node_ids: Vec<Vec<u8>>,
        nodes: Vec<Vec<u8>>,
    },
    HaveTxSet {
        status: TxSetStatus,
        hash: Hash256,
    },
    StatusChange(StatusChange),
    GetObject {
        hash: Hash256,
    },
    Object {
        hash: Hash256,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcs_round_trip() {
        let msg = PeerMessage::GetLedger {
            ledger_hash: Hash256::new([3; 32]),
            info_type: LedgerInfoType::Candidate,
            node_ids: vec![vec![0; 33]],
        };
        let bytes = bcs::to_bytes(&msg).unwrap();
        let back: PeerMessage = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }
}
