// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The authenticated map underlying ledger state and transaction sets.
//!
//! A `SHAMap` is a copy-on-write radix-16 Merkle trie keyed by 256-bit tags.
//! Leaves sit at the shallowest depth where their tag is unique, every inner
//! node commits to its sixteen children, and the root hash commits to the
//! whole map. Snapshots are O(1): nodes are immutable values behind `Arc`,
//! shared between generations, and any mutation rebuilds the changed path
//! with nodes stamped by the owning map's sequence number.
//!
//! The same structure doubles as a sync protocol: a node that knows only a
//! root hash repeatedly asks [`SHAMap::get_missing_nodes`] what it lacks and
//! feeds peer responses through [`SHAMap::add_known_node`] until the tree is
//! complete.

mod diff;
mod error;
mod item;
mod map;
mod node;
mod node_id;
mod sync;

pub use diff::{Diff, DiffEntry};
pub use error::SHAMapError;
pub use item::Item;
pub use map::{flush_dirty, DirtyMap, MapState, MapType, SHAMap};
pub use node::{LeafKind, NodeFormat, NodeKind, TreeNode};
pub use node_id::NodeId;
pub use sync::{check_path, AddResult, FullBelowCache, NullFilter, SyncFilter};
