// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Node assembly: wires the storage, ledger, and consensus components into
//! one process and gives background work a home on a prioritized job queue.
//!
//! The wire transport and operator surfaces (RPC, configuration files) live
//! above this crate; a [`Node`] only needs a [`NetworkSink`] to talk
//! through.

mod job_queue;
mod node;

pub use job_queue::{JobQueue, JobType};
pub use node::{Node, NodeConfig};
