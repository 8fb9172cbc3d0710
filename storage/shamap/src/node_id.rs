// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::SHAMapError;
use meridian_crypto::Hash256;
use std::fmt;

/// Identifies a node position in the trie: a depth and the path prefix that
/// leads there. Only the top `depth` nibbles of `id` are significant; the
/// rest are zero so identifiers compare and hash cleanly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    depth: u8,
    id: Hash256,
}

impl NodeId {
    pub const MAX_DEPTH: u8 = 64;
    /// Wire encoding: 32-byte id followed by one depth byte.
    pub const WIRE_LENGTH: usize = 33;

    pub fn root() -> Self {
        Self {
            depth: 0,
            id: Hash256::zero(),
        }
    }

    /// Canonicalizes `path` to a node identifier at `depth`.
    pub fn new(depth: u8, path: &Hash256) -> Self {
        debug_assert!(depth <= Self::MAX_DEPTH);
        Self {
            depth,
            id: mask(depth, path),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn id(&self) -> &Hash256 {
        &self.id
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// The identifier of the child on `branch`.
    pub fn child(&self, branch: u8) -> Self {
        debug_assert!(branch < 16);
        debug_assert!(self.depth < Self::MAX_DEPTH);
        let mut id = self.id;
        id.set_nibble(self.depth as usize, branch);
        Self {
            depth: self.depth + 1,
            id,
        }
    }

    /// Which branch a tag takes out of this node. The tag must lie under
    /// this node's prefix.
    pub fn select_branch(&self, tag: &Hash256) -> u8 {
        debug_assert!(self.contains(tag), "tag does not belong under this node");
        tag.nibble(self.depth as usize)
    }

    /// Whether `tag`'s first `depth` nibbles agree with this node's path.
    pub fn contains(&self, tag: &Hash256) -> bool {
        mask(self.depth, tag) == self.id
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LENGTH);
        out.extend_from_slice(self.id.as_bytes());
        out.push(self.depth);
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, SHAMapError> {
        if bytes.len() != Self::WIRE_LENGTH {
            return Err(SHAMapError::InvalidNode {
                node_id: NodeId::root(),
            });
        }
        let depth = bytes[32];
        if depth > Self::MAX_DEPTH {
            return Err(SHAMapError::InvalidNode {
                node_id: NodeId::root(),
            });
        }
        let id = Hash256::from_slice(&bytes[..32]).expect("length checked above");
        Ok(Self::new(depth, &id))
    }
}

fn mask(depth: u8, path: &Hash256) -> Hash256 {
    let mut out = *path;
    for nibble in depth as usize..NodeId::MAX_DEPTH as usize {
        out.set_nibble(nibble, 0);
    }
    out
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({},{})", self.depth, self.id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
