// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Core data types exchanged between Meridian components and peers.

pub mod clock;
pub mod message;
pub mod proposal;
pub mod transaction;
pub mod validation;

pub use clock::{NetworkClock, SystemClock, TestClock};
pub use message::{LedgerInfoType, NodeEvent, PeerMessage, StatusChange, TxSetStatus};
pub use proposal::{Proposal, SEQ_LEAVE};
pub use transaction::{ApplyResult, Transaction, TxStatus};
pub use validation::Validation;
