// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::{HalfSha512, Hash160, Hash256, HashPrefix, NodeKeypair, NodePublicKey,
                      SignatureBytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Propose-sequence value signalling that the peer has withdrawn from the
/// round.
pub const SEQ_LEAVE: u32 = 0xFFFF_FFFF;

/// A proposer's published position for one consensus round: the transaction
/// set it wants in the next ledger and the close time it reports.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    prev_ledger: Hash256,
    position: Hash256,
    close_time: u32,
    propose_seq: u32,
    public_key: NodePublicKey,
    signature: Option<SignatureBytes>,
    /// Network time we created or received this proposal; drives staleness.
    create_time: u32,
}

impl Proposal {
    /// Our own first position for a round. Unsigned until [`Proposal::sign`];
    /// observers publish nothing so they never sign.
    pub fn new_ours(
        public_key: NodePublicKey,
        prev_ledger: Hash256,
        position: Hash256,
        close_time: u32,
        now: u32,
    ) -> Self {
        Self {
            prev_ledger,
            position,
            close_time,
            propose_seq: 1,
            public_key,
            signature: None,
            create_time: now,
        }
    }

    /// A position received from a peer.
    pub fn from_peer(
        prev_ledger: Hash256,
        position: Hash256,
        close_time: u32,
        propose_seq: u32,
        public_key: NodePublicKey,
        signature: SignatureBytes,
        now: u32,
    ) -> Self {
        Self {
            prev_ledger,
            position,
            close_time,
            propose_seq,
            public_key,
            signature: Some(signature),
            create_time: now,
        }
    }

    /// Digest covered by the proposal signature.
    pub fn signing_hash(&self) -> Hash256 {
        let mut h = HalfSha512::new(HashPrefix::Proposal);
        h.update(self.propose_seq.to_be_bytes())
            .update(self.close_time.to_be_bytes())
            .update(self.prev_ledger.as_bytes())
            .update(self.position.as_bytes());
        h.finish()
    }

    pub fn sign(&mut self, keypair: &NodeKeypair) {
        debug_assert_eq!(keypair.public(), self.public_key);
        self.signature = Some(keypair.sign(&self.signing_hash()));
    }

    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => self.public_key.verify(&self.signing_hash(), sig).is_ok(),
            None => false,
        }
    }

    /// Adopt a new position, invalidating the old signature and bumping the
    /// propose sequence.
    pub fn change_position(&mut self, position: Hash256, close_time: u32, now: u32) -> bool {
        if self.propose_seq == SEQ_LEAVE {
            return false;
        }
        self.position = position;
        self.close_time = close_time;
        self.propose_seq += 1;
        self.signature = None;
        self.create_time = now;
        true
    }

    /// Withdraw from the round; the re-signed proposal tells peers to drop
    /// our votes.
    pub fn bow_out(&mut self, now: u32) {
        self.propose_seq = SEQ_LEAVE;
        self.signature = None;
        self.create_time = now;
    }

    pub fn is_bow_out(&self) -> bool {
        self.propose_seq == SEQ_LEAVE
    }

    pub fn is_initial_close_estimate(&self) -> bool {
        self.propose_seq == 0
    }

    pub fn is_stale(&self, cutoff: u32) -> bool {
        self.create_time <= cutoff
    }

    pub fn prev_ledger(&self) -> &Hash256 {
        &self.prev_ledger
    }

    pub fn set_prev_ledger(&mut self, prev: Hash256) {
        self.prev_ledger = prev;
    }

    pub fn position(&self) -> &Hash256 {
        &self.position
    }

    pub fn close_time(&self) -> u32 {
        self.close_time
    }

    pub fn propose_seq(&self) -> u32 {
        self.propose_seq
    }

    pub fn public_key(&self) -> &NodePublicKey {
        &self.public_key
    }

    pub fn node_id(&self) -> Hash160 {
        self.public_key.node_id()
    }

    pub fn create_time(&self) -> u32 {
        self.create_time
    }
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal(seq={}, pos={}, prev={}, ct={})",
            self.propose_seq, self.position, self.prev_ledger, self.close_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn keypair() -> NodeKeypair {
        NodeKeypair::generate(&mut StdRng::seed_from_u64(42))
    }

    fn sample(kp: &NodeKeypair) -> Proposal {
        Proposal::new_ours(
            kp.public(),
            Hash256::new([1; 32]),
            Hash256::new([2; 32]),
            1000,
            1000,
        )
    }

    #[test]
    fn sign_then_verify() {
        let kp = keypair();
        let mut prop = sample(&kp);
        assert!(!prop.verify_signature());
        prop.sign(&kp);
        assert!(prop.verify_signature());
    }

    #[test]
    fn change_position_invalidates_signature() {
        let kp = keypair();
        let mut prop = sample(&kp);
        prop.sign(&kp);
        assert!(prop.change_position(Hash256::new([3; 32]), 1010, 1001));
        assert_eq!(prop.propose_seq(), 2);
        assert!(!prop.verify_signature());
    }

    #[test]
    fn bow_out_is_terminal() {
        let kp = keypair();
        let mut prop = sample(&kp);
        prop.bow_out(1002);
        assert!(prop.is_bow_out());
        assert!(!prop.change_position(Hash256::new([3; 32]), 1010, 1003));
    }

    #[test]
    fn signing_hash_covers_position() {
        let kp = keypair();
        let a = sample(&kp);
        let mut b = sample(&kp);
        b.change_position(Hash256::new([9; 32]), a.close_time(), a.create_time());
        assert_ne!(a.signing_hash(), b.signing_hash());
    }
}
