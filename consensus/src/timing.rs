// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Round timing: when to close the open ledger, how the agreement threshold
//! rises as a round ages, and when a round is declared stuck.
//!
//! `close_percent` measures round age as a percentage of the previous
//! round's duration, so a network that converges quickly demands quick
//! convergence of the next round too.

/// Threshold schedule checkpoints, in percent of the previous round time.
pub const AV_MID_CONSENSUS_TIME: u32 = 50;
pub const AV_LATE_CONSENSUS_TIME: u32 = 85;
pub const AV_STUCK_CONSENSUS_TIME: u32 = 200;

/// Agreement percentages required at each checkpoint.
pub const AV_INIT_CONSENSUS_PCT: u32 = 50;
pub const AV_MID_CONSENSUS_PCT: u32 = 65;
pub const AV_LATE_CONSENSUS_PCT: u32 = 70;
pub const AV_STUCK_CONSENSUS_PCT: u32 = 95;

/// Fraction of proposers that must vote one close-time bucket before the
/// round has close-time consensus.
pub const AV_CT_CONSENSUS_PCT: u32 = 75;

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long an empty open ledger sits before closing anyway.
    pub idle_interval_secs: u32,
    /// Minimum time a ledger stays open once it has transactions.
    pub min_close_ms: u64,
    /// Minimum time in the establish phase before declaring convergence.
    pub min_consensus_ms: u64,
    /// Proposals older than this are dropped from the count.
    pub propose_freshness_secs: u32,
    /// How often we are willing to re-sign our own position.
    pub propose_interval_secs: u32,
    /// Validation currency window (see `Validation::is_current`).
    pub validation_early_secs: u32,
    pub validation_interval_secs: u32,
    /// Transaction-set fetch: ticks without progress before rotating peers.
    pub tx_acquire_timeout_ms: u64,
    /// Transaction application passes (total, of which retriable).
    pub total_passes: usize,
    pub retry_passes: usize,
    /// Bound on the map diff when creating disputes.
    pub max_diff: usize,
    /// Trusted validations needed to ratify a ledger.
    pub min_validations: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 15,
            min_close_ms: 2_000,
            min_consensus_ms: 2_000,
            propose_freshness_secs: 20,
            propose_interval_secs: 12,
            validation_early_secs: 180,
            validation_interval_secs: 300,
            tx_acquire_timeout_ms: 250,
            total_passes: 8,
            retry_passes: 5,
            max_diff: 16_384,
            min_validations: 3,
        }
    }
}

/// The agreement percentage required at `close_percent` of the previous
/// round's duration. Raising the bar over time prevents avalanche stalls:
/// early on a bare majority may flip positions, late in the round only a
/// near-unanimous set should.
pub fn needed_weight(close_percent: u32) -> u32 {
    if close_percent < AV_MID_CONSENSUS_TIME {
        AV_INIT_CONSENSUS_PCT
    } else if close_percent < AV_LATE_CONSENSUS_TIME {
        AV_MID_CONSENSUS_PCT
    } else if close_percent < AV_STUCK_CONSENSUS_TIME {
        AV_LATE_CONSENSUS_PCT
    } else {
        AV_STUCK_CONSENSUS_PCT
    }
}

/// Should the open ledger close now?
#[allow(clippy::too_many_arguments)]
pub fn should_close(
    any_transactions: bool,
    previous_proposers: usize,
    proposers_closed: usize,
    proposers_validated: usize,
    previous_ms: u64,
    since_close_ms: u64,
    open_ms: u64,
    idle_interval_ms: u64,
    config: &ConsensusConfig,
) -> bool {
    // A wildly implausible previous-round time means the clock jumped;
    // close and let the next round measure honestly.
    if previous_ms == 0 || previous_ms > 600_000 {
        return true;
    }
    // Over half the network has moved on without us.
    if proposers_closed + proposers_validated > previous_proposers / 2 {
        return true;
    }
    if !any_transactions {
        return since_close_ms >= idle_interval_ms;
    }
    // Give late submitters a fair window.
    if open_ms < config.min_close_ms {
        return false;
    }
    // Close promptly once we have been open as long as the last round took.
    since_close_ms >= previous_ms
}

/// Convergence verdict for the establish phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Keep establishing.
    No,
    /// Agreement reached; proceed to accept.
    Yes,
    /// The round is stuck past rescue; finish without claiming agreement
    /// (the resulting ledger will not be validated by us).
    Failed,
}

/// Whether the round has transaction-set consensus.
///
/// `agree` counts proposers sharing our exact position, ourselves included
/// when proposing. Proposers who have never published a position count as
/// disagreement only once the round is past the stuck threshold; before
/// that they are simply absent.
#[allow(clippy::too_many_arguments)]
pub fn have_consensus(
    previous_proposers: usize,
    current_proposers: usize,
    agree: usize,
    close_percent: u32,
    current_ms: u64,
    proposing: bool,
    config: &ConsensusConfig,
) -> Convergence {
    if current_ms < config.min_consensus_ms {
        return Convergence::No;
    }
    let mut total = current_proposers + usize::from(proposing);
    if close_percent >= AV_STUCK_CONSENSUS_TIME {
        // Count the silent: everyone who proposed last round but not this
        // one is now treated as disagreeing.
        total = total.max(previous_proposers + usize::from(proposing));
    }
    let agree_pct = (agree * 100 / total.max(1)) as u32;
    if agree_pct > needed_weight(close_percent) {
        return Convergence::Yes;
    }
    if close_percent >= AV_STUCK_CONSENSUS_TIME {
        return Convergence::Failed;
    }
    Convergence::No
}
