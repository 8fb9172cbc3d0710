// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The round-based agreement protocol.
//!
//! Each round converges the trusted validator set on two things: the set of
//! transactions going into the next ledger, and that ledger's close time.
//! The driver is [`RoundManager`], which owns one [`LedgerConsensus`] state
//! machine at a time and cranks it from a periodic timer; everything else —
//! validation bookkeeping, the trusted-validator list, the fetcher for
//! transaction sets we have only heard named — hangs off the shared
//! [`CoreContext`].

pub mod acquire;
pub mod consensus;
pub mod context;
pub mod dispute;
pub mod round_manager;
pub mod timing;
pub mod unl;
pub mod validations;

pub use acquire::{LedgerAcquire, TempNodeCache, TransactionAcquire, TxSetFilter};
pub use consensus::{ConsensusState, LedgerConsensus};
pub use context::{CoreContext, NetworkSink, PeerId};
pub use dispute::DisputedTx;
pub use round_manager::RoundManager;
pub use timing::{needed_weight, should_close, ConsensusConfig, Convergence};
pub use unl::{UniqueNodeList, ValidatorSource};
pub use validations::{ValidationCollection, ValidationStore};

use meridian_ledger::LedgerError;
use meridian_shamap::SHAMapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Map(#[from] SHAMapError),
}
