// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! The unique node list: the validators this node trusts, selected from a
//! scored graph of known validator candidates.
//!
//! Candidates arrive from ranked sources; a periodic scorer distributes
//! each node's points among the validators it refers, inversely by referral
//! order, and after a fixed number of rounds the top scorers form the
//! active list. Consensus only ever reads the atomically swapped active
//! set, so scoring never blocks the round.

use arc_swap::ArcSwap;
use meridian_crypto::NodePublicKey;
use meridian_infallible::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// How many distribution rounds the scorer iterates before picking the
/// active set.
const SCORE_ROUNDS: usize = 10;

/// Damping applied to referred points each round, keeping the iteration
/// from oscillating.
const REFERRAL_DAMPING: f64 = 0.5;

/// Where we learned about a validator candidate; decides its base score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorSource {
    /// Listed in our configuration.
    Config,
    /// Added by an operator at runtime.
    Manual,
    /// Referred by another validator's published list.
    Referral,
    /// Scraped from a published web domain.
    Web,
    /// From a fetched validator-list document.
    ValidatorList,
    /// Learned from an inbound connection.
    Inbound,
}

impl ValidatorSource {
    fn base_score(self) -> f64 {
        match self {
            ValidatorSource::Config => 1500.0,
            ValidatorSource::Manual => 1500.0,
            ValidatorSource::Referral => 0.0,
            ValidatorSource::Web => 200.0,
            ValidatorSource::ValidatorList => 1000.0,
            ValidatorSource::Inbound => 0.0,
        }
    }
}

struct Candidate {
    source: ValidatorSource,
    /// Validators this candidate vouches for, in its stated preference
    /// order.
    referrals: Vec<NodePublicKey>,
}

pub struct UniqueNodeList {
    max_active: usize,
    candidates: Mutex<HashMap<NodePublicKey, Candidate>>,
    active: ArcSwap<HashSet<NodePublicKey>>,
}

impl UniqueNodeList {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active,
            candidates: Mutex::new(HashMap::new()),
            active: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Registers a candidate (keeping the better source if already known).
    pub fn add_validator(&self, key: NodePublicKey, source: ValidatorSource) {
        let mut candidates = self.candidates.lock();
        candidates
            .entry(key)
            .and_modify(|c| {
                if source.base_score() > c.source.base_score() {
                    c.source = source;
                }
            })
            .or_insert(Candidate {
                source,
                referrals: Vec::new(),
            });
    }

    /// Records that `from` vouches for `to`, appending to its preference
    /// order. Unknown referrers are registered as referral-sourced.
    pub fn add_referral(&self, from: NodePublicKey, to: NodePublicKey) {
        let mut candidates = self.candidates.lock();
        candidates
            .entry(to)
            .or_insert(Candidate {
                source: ValidatorSource::Referral,
                referrals: Vec::new(),
            });
        let entry = candidates.entry(from).or_insert(Candidate {
            source: ValidatorSource::Referral,
            referrals: Vec::new(),
        });
        if !entry.referrals.contains(&to) {
            entry.referrals.push(to);
        }
    }

    /// Runs the scorer and swaps in a fresh active set. Called from the
    /// periodic sweep, never from the consensus path.
    pub fn rescore(&self) {
        let candidates = self.candidates.lock();
        let mut scores: HashMap<NodePublicKey, f64> = candidates
            .iter()
            .map(|(key, c)| (*key, c.source.base_score()))
            .collect();

        for _ in 0..SCORE_ROUNDS {
            let mut next: HashMap<NodePublicKey, f64> = candidates
                .iter()
                .map(|(key, c)| (*key, c.source.base_score()))
                .collect();
            for (key, candidate) in candidates.iter() {
                let own = scores.get(key).copied().unwrap_or(0.0);
                if own <= 0.0 || candidate.referrals.is_empty() {
                    continue;
                }
                // Weight 1/(position+1), normalized over the list, damped.
                let total_weight: f64 = (0..candidate.referrals.len())
                    .map(|i| 1.0 / (i as f64 + 1.0))
                    .sum();
                for (i, referred) in candidate.referrals.iter().enumerate() {
                    let share =
                        own * REFERRAL_DAMPING * (1.0 / (i as f64 + 1.0)) / total_weight;
                    *next.entry(*referred).or_insert(0.0) += share;
                }
            }
            scores = next;
        }

        let mut ranked: Vec<(NodePublicKey, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let active: HashSet<NodePublicKey> = ranked
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .take(self.max_active)
            .map(|(key, _)| key)
            .collect();
        info!(target: "consensus", active = active.len(), "trusted validator list rebuilt");
        self.active.store(Arc::new(active));
    }

    /// The read side consensus uses; lock-free.
    pub fn in_unl(&self, key: &NodePublicKey) -> bool {
        self.active.load().contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.load().len()
    }
}
