// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The ledger pipeline: open → closing → accepted.
//!
//! A [`Ledger`] owns two authenticated maps (transactions and account state)
//! plus the header scalars that, hashed together, name the ledger. The
//! [`LedgerMaster`] holds the one current open ledger, the at-most-one
//! closing ledger, and the accepted history, and routes incoming
//! transactions to the right generation.

mod canonical;
mod engine;
mod ledger;
mod master;

pub use canonical::CanonicalTxSet;
pub use engine::{AdmitAllEngine, TransactionEngine};
pub use ledger::{
    account_index, next_close_resolution, round_close_time, Ledger, CLOSE_RESOLUTIONS,
    DEFAULT_CLOSE_RESOLUTION,
};
pub use master::{LedgerMaster, SubmitOutcome};

use meridian_shamap::SHAMapError;
use meridian_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger is {0}; operation not permitted")]
    WrongState(&'static str),
    #[error(transparent)]
    Map(#[from] SHAMapError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
