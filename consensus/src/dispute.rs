// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{context::PeerId, timing};
use meridian_crypto::Hash256;
use std::collections::HashMap;
use tracing::debug;

/// A transaction whose membership in the candidate set differs between our
/// position and at least one peer's. Tracks every peer's yes/no vote and
/// our own, which moves with the weighted majority on a rising threshold.
pub struct DisputedTx {
    txid: Hash256,
    tx: Vec<u8>,
    our_vote: bool,
    yays: usize,
    nays: usize,
    votes: HashMap<PeerId, bool>,
}

impl DisputedTx {
    pub fn new(txid: Hash256, tx: Vec<u8>, our_vote: bool) -> Self {
        Self {
            txid,
            tx,
            our_vote,
            yays: 0,
            nays: 0,
            votes: HashMap::new(),
        }
    }

    pub fn txid(&self) -> &Hash256 {
        &self.txid
    }

    pub fn tx_bytes(&self) -> &[u8] {
        &self.tx
    }

    pub fn our_vote(&self) -> bool {
        self.our_vote
    }

    pub fn set_our_vote(&mut self, vote: bool) {
        self.our_vote = vote;
    }

    pub fn yays(&self) -> usize {
        self.yays
    }

    pub fn nays(&self) -> usize {
        self.nays
    }

    /// Records or updates one peer's vote.
    pub fn set_vote(&mut self, peer: PeerId, votes_yes: bool) {
        match self.votes.insert(peer, votes_yes) {
            None => {
                if votes_yes {
                    debug!(target: "consensus", %peer, txid = %self.txid, "peer votes YES");
                    self.yays += 1;
                } else {
                    debug!(target: "consensus", %peer, txid = %self.txid, "peer votes NO");
                    self.nays += 1;
                }
            }
            Some(previous) if previous != votes_yes => {
                if votes_yes {
                    self.nays -= 1;
                    self.yays += 1;
                } else {
                    self.yays -= 1;
                    self.nays += 1;
                }
            }
            Some(_) => {}
        }
    }

    /// Removes a peer's vote (the peer bowed out or went stale).
    pub fn clear_vote(&mut self, peer: &PeerId) {
        if let Some(vote) = self.votes.remove(peer) {
            if vote {
                self.yays -= 1;
            } else {
                self.nays -= 1;
            }
        }
    }

    /// Recomputes our vote from the current tallies and the time-dependent
    /// threshold. Returns `true` when our vote flipped. When not proposing
    /// we carry no weight of our own and simply move with the majority.
    pub fn update_vote(&mut self, close_percent: u32, proposing: bool) -> bool {
        // Unanimity in our favour: nothing to reconsider.
        if self.our_vote && self.nays == 0 {
            return false;
        }
        if !self.our_vote && self.yays == 0 {
            return false;
        }

        let new_vote = if proposing {
            let weight =
                (self.yays * 100 + if self.our_vote { 100 } else { 0 }) / (self.yays + self.nays + 1);
            weight as u32 > timing::needed_weight(close_percent)
        } else {
            self.yays > self.nays
        };

        if new_vote == self.our_vote {
            return false;
        }
        debug!(
            target: "consensus",
            txid = %self.txid,
            vote = if new_vote { "YES" } else { "NO" },
            close_percent,
            "our dispute vote changed"
        );
        self.our_vote = new_vote;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::AV_STUCK_CONSENSUS_TIME;
    use meridian_crypto::Hash160;

    fn peer(n: u8) -> PeerId {
        Hash160::new([n; 20])
    }

    fn dispute(our_vote: bool) -> DisputedTx {
        DisputedTx::new(Hash256::new([7; 32]), vec![1, 2, 3], our_vote)
    }

    #[test]
    fn votes_tally_and_flip() {
        let mut d = dispute(true);
        d.set_vote(peer(1), true);
        d.set_vote(peer(2), false);
        assert_eq!((d.yays(), d.nays()), (1, 1));
        d.set_vote(peer(2), true);
        assert_eq!((d.yays(), d.nays()), (2, 0));
        d.set_vote(peer(2), true);
        assert_eq!((d.yays(), d.nays()), (2, 0));
        d.clear_vote(&peer(1));
        assert_eq!((d.yays(), d.nays()), (1, 0));
    }

    #[test]
    fn majority_no_flips_us_late() {
        let mut d = dispute(true);
        for n in 1..=4 {
            d.set_vote(peer(n), false);
        }
        d.set_vote(peer(5), true);
        // Early: 1 yay + us = 2/6 = 33% which is below 50, so we flip even
        // at the initial threshold.
        assert!(d.update_vote(10, true));
        assert!(!d.our_vote());
    }

    #[test]
    fn minority_yay_does_not_drag_us_back() {
        let mut d = dispute(false);
        d.set_vote(peer(1), true);
        for n in 2..=5 {
            d.set_vote(peer(n), false);
        }
        assert!(!d.update_vote(50, true));
        assert!(!d.our_vote());
    }

    #[test]
    fn observer_moves_with_plain_majority() {
        let mut d = dispute(false);
        d.set_vote(peer(1), true);
        d.set_vote(peer(2), true);
        d.set_vote(peer(3), false);
        assert!(d.update_vote(0, false));
        assert!(d.our_vote());
    }

    /// Property 7: with fixed peer votes and the stuck threshold, a single
    /// `update_vote` reaches a fixed point — a second call never flips.
    #[test]
    fn update_vote_reaches_fixed_point_at_stuck() {
        for yays in 0..6usize {
            for nays in 0..6usize {
                for initial in [false, true].iter() {
                    let mut d = dispute(*initial);
                    for n in 0..yays {
                        d.set_vote(peer(n as u8), true);
                    }
                    for n in 0..nays {
                        d.set_vote(peer(0x40 + n as u8), false);
                    }
                    d.update_vote(AV_STUCK_CONSENSUS_TIME, true);
                    assert!(
                        !d.update_vote(AV_STUCK_CONSENSUS_TIME, true),
                        "second call flipped with yays={} nays={} initial={}",
                        yays,
                        nays,
                        initial
                    );
                }
            }
        }
    }
}
