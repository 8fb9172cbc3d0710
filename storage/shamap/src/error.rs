// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{map::MapType, node_id::NodeId};
use meridian_crypto::Hash256;
use meridian_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SHAMapError {
    /// A walk needed a node that is neither cached nor in the object store.
    /// Non-fatal: the caller schedules a fetch and continues on other paths.
    #[error("missing {map_type:?} node {node_id} (hash {node_hash})")]
    MissingNode {
        map_type: MapType,
        node_id: NodeId,
        node_hash: Hash256,
        /// The tag the walk was headed for, when known.
        target: Option<Hash256>,
    },
    /// Received bytes did not parse, or did not hash to the expected value.
    #[error("invalid node {node_id}")]
    InvalidNode { node_id: NodeId },
    /// Operation not permitted in the map's current state.
    #[error("map is {state}, operation requires {requires}")]
    WrongState {
        state: &'static str,
        requires: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
