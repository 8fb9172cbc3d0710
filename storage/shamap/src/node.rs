// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Item, NodeId, SHAMapError};
use meridian_crypto::{HalfSha512, Hash256, HashPrefix};
use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;

/// What a leaf holds, which also selects its hash-domain prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    TxnNoMeta,
    TxnWithMeta,
    AccountState,
}

impl LeafKind {
    fn prefix(self) -> HashPrefix {
        match self {
            LeafKind::TxnNoMeta => HashPrefix::TxnId,
            LeafKind::TxnWithMeta => HashPrefix::TxnNode,
            LeafKind::AccountState => HashPrefix::LeafNode,
        }
    }

    fn wire_code(self) -> u8 {
        match self {
            LeafKind::TxnNoMeta => 1,
            LeafKind::TxnWithMeta => 2,
            LeafKind::AccountState => 3,
        }
    }

    fn from_wire_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => LeafKind::TxnNoMeta,
            2 => LeafKind::TxnWithMeta,
            3 => LeafKind::AccountState,
            _ => return None,
        })
    }
}

/// Serialized framings of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFormat {
    /// Compact form used in sync messages: body followed by one kind byte.
    Wire,
    /// Hashing and persistence form: 4-byte domain prefix followed by body.
    /// A node's hash is `sha512_half(PREFIXED)`.
    Prefixed,
}

const WIRE_INNER: u8 = 0;

#[derive(Clone, PartialEq, Eq)]
pub enum NodeKind {
    Inner { children: [Hash256; 16] },
    Leaf { kind: LeafKind, item: Arc<Item> },
}

/// One node of a map. Immutable once shared: maps clone a node, restamp it
/// with their own sequence, and rethread parents instead of mutating in
/// place.
#[derive(Clone, PartialEq, Eq)]
pub struct TreeNode {
    kind: NodeKind,
    hash: Hash256,
    seq: u32,
}

impl TreeNode {
    pub fn new_inner(seq: u32) -> Self {
        Self {
            kind: NodeKind::Inner {
                children: [Hash256::zero(); 16],
            },
            hash: Hash256::zero(),
            seq,
        }
    }

    pub fn new_leaf(kind: LeafKind, item: Arc<Item>, seq: u32) -> Self {
        let mut node = Self {
            kind: NodeKind::Leaf { kind, item },
            hash: Hash256::zero(),
            seq,
        };
        node.update_hash();
        node
    }

    /// A copy from an older generation, restamped for the mutating map.
    pub fn reclone(&self, seq: u32) -> Self {
        let mut node = self.clone();
        node.seq = seq;
        node
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.kind, NodeKind::Inner { .. })
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_inner()
    }

    pub fn leaf_kind(&self) -> Option<LeafKind> {
        match &self.kind {
            NodeKind::Leaf { kind, .. } => Some(*kind),
            NodeKind::Inner { .. } => None,
        }
    }

    /// The item in a leaf. Inner nodes return `None`.
    pub fn item(&self) -> Option<&Arc<Item>> {
        match &self.kind {
            NodeKind::Leaf { item, .. } => Some(item),
            NodeKind::Inner { .. } => None,
        }
    }

    pub fn tag(&self) -> Option<&Hash256> {
        self.item().map(|i| i.tag())
    }

    pub fn child_hash(&self, branch: u8) -> &Hash256 {
        match &self.kind {
            NodeKind::Inner { children } => &children[branch as usize],
            NodeKind::Leaf { .. } => {
                debug_assert!(false, "leaf nodes have no children");
                &self.hash
            }
        }
    }

    pub fn is_empty_branch(&self, branch: u8) -> bool {
        self.child_hash(branch).is_zero()
    }

    pub fn branch_count(&self) -> usize {
        match &self.kind {
            NodeKind::Inner { children } => children.iter().filter(|c| !c.is_zero()).count(),
            NodeKind::Leaf { .. } => 0,
        }
    }

    pub fn is_empty_inner(&self) -> bool {
        self.is_inner() && self.branch_count() == 0
    }

    /// Replaces one child hash and recomputes the node hash. Returns `false`
    /// if the child was already set to `hash`.
    pub fn set_child(&mut self, branch: u8, hash: Hash256) -> bool {
        match &mut self.kind {
            NodeKind::Inner { children } => {
                if children[branch as usize] == hash {
                    return false;
                }
                children[branch as usize] = hash;
                self.update_hash();
                true
            }
            NodeKind::Leaf { .. } => {
                debug_assert!(false, "leaf nodes have no children");
                false
            }
        }
    }

    /// Turns this node into a leaf holding `item` (the single-leaf collapse
    /// after a delete, and in-place leaf replacement on update).
    pub fn set_item(&mut self, kind: LeafKind, item: Arc<Item>) -> bool {
        if let NodeKind::Leaf {
            kind: old_kind,
            item: old_item,
        } = &self.kind
        {
            if *old_kind == kind && old_item.data() == item.data() && old_item.tag() == item.tag() {
                return false;
            }
        }
        self.kind = NodeKind::Leaf { kind, item };
        self.update_hash();
        true
    }

    fn update_hash(&mut self) {
        self.hash = match &self.kind {
            NodeKind::Inner { children } => {
                if children.iter().all(|c| c.is_zero()) {
                    Hash256::zero()
                } else {
                    let mut h = HalfSha512::new(HashPrefix::InnerNode);
                    for child in children.iter() {
                        h.update(child.as_bytes());
                    }
                    h.finish()
                }
            }
            NodeKind::Leaf { kind, item } => {
                let mut h = HalfSha512::new(kind.prefix());
                h.update(item.tag().as_bytes())
                    .update((item.data().len() as u16).to_be_bytes())
                    .update(item.data());
                h.finish()
            }
        };
    }

    /// Serializes in the requested framing. The laws the sync protocol and
    /// the store rely on: `parse(serialize(n, f), f) == n` for both framings,
    /// and `hash(n) == sha512_half(serialize(n, Prefixed))`.
    pub fn serialize(&self, format: NodeFormat) -> Vec<u8> {
        let mut out = Vec::new();
        match format {
            NodeFormat::Prefixed => {
                let prefix = match &self.kind {
                    NodeKind::Inner { .. } => HashPrefix::InnerNode,
                    NodeKind::Leaf { kind, .. } => kind.prefix(),
                };
                out.extend_from_slice(&prefix.to_be_bytes());
                self.push_body(&mut out);
            }
            NodeFormat::Wire => {
                self.push_body(&mut out);
                let code = match &self.kind {
                    NodeKind::Inner { .. } => WIRE_INNER,
                    NodeKind::Leaf { kind, .. } => kind.wire_code(),
                };
                out.push(code);
            }
        }
        out
    }

    fn push_body(&self, out: &mut Vec<u8>) {
        match &self.kind {
            NodeKind::Inner { children } => {
                for child in children.iter() {
                    out.extend_from_slice(child.as_bytes());
                }
            }
            NodeKind::Leaf { item, .. } => {
                out.extend_from_slice(item.tag().as_bytes());
                out.extend_from_slice(&(item.data().len() as u16).to_be_bytes());
                out.extend_from_slice(item.data());
            }
        }
    }

    /// Parses a node received at position `id`. The caller still has to
    /// verify the resulting hash against whatever hash it expected.
    pub fn parse(id: &NodeId, bytes: &[u8], format: NodeFormat, seq: u32) -> Result<Self, SHAMapError> {
        let invalid = || SHAMapError::InvalidNode { node_id: *id };
        let (body, kind_code) = match format {
            NodeFormat::Wire => {
                let (&code, body) = bytes.split_last().ok_or_else(invalid)?;
                (body, code)
            }
            NodeFormat::Prefixed => {
                if bytes.len() < 4 {
                    return Err(invalid());
                }
                let prefix = u32::from_be_bytes(bytes[..4].try_into().expect("length checked"));
                let code = if prefix == HashPrefix::InnerNode as u32 {
                    WIRE_INNER
                } else if prefix == HashPrefix::TxnId as u32 {
                    LeafKind::TxnNoMeta.wire_code()
                } else if prefix == HashPrefix::TxnNode as u32 {
                    LeafKind::TxnWithMeta.wire_code()
                } else if prefix == HashPrefix::LeafNode as u32 {
                    LeafKind::AccountState.wire_code()
                } else {
                    return Err(invalid());
                };
                (&bytes[4..], code)
            }
        };

        let kind = if kind_code == WIRE_INNER {
            if body.len() != 16 * 32 {
                return Err(invalid());
            }
            let mut children = [Hash256::zero(); 16];
            for (i, chunk) in body.chunks_exact(32).enumerate() {
                children[i] = Hash256::from_slice(chunk).expect("chunk is 32 bytes");
            }
            NodeKind::Inner { children }
        } else {
            let leaf_kind = LeafKind::from_wire_code(kind_code).ok_or_else(invalid)?;
            if body.len() < 34 {
                return Err(invalid());
            }
            let tag = Hash256::from_slice(&body[..32]).expect("length checked");
            let len = u16::from_be_bytes(body[32..34].try_into().expect("length checked")) as usize;
            if tag.is_zero() || body.len() != 34 + len {
                return Err(invalid());
            }
            NodeKind::Leaf {
                kind: leaf_kind,
                item: Arc::new(Item::new(tag, body[34..].to_vec())),
            }
        };

        let mut node = Self {
            kind,
            hash: Hash256::zero(),
            seq,
        };
        node.update_hash();
        Ok(node)
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Inner { .. } => write!(
                f,
                "Inner(branches={}, hash={}, seq={})",
                self.branch_count(),
                self.hash,
                self.seq
            ),
            NodeKind::Leaf { kind, item } => {
                write!(f, "Leaf({:?}, tag={}, seq={})", kind, item.tag(), self.seq)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::sha512_half;

    fn leaf() -> TreeNode {
        let item = Arc::new(Item::new(Hash256::new([0xAB; 32]), vec![1, 2, 3, 4]));
        TreeNode::new_leaf(LeafKind::AccountState, item, 1)
    }

    #[test]
    fn leaf_hash_is_prefixed_serialization() {
        let node = leaf();
        let prefixed = node.serialize(NodeFormat::Prefixed);
        assert_eq!(
            *node.hash(),
            meridian_crypto::content_hash(&prefixed),
            "hash law: hash(n) == sha512_half(PREFIXED)"
        );
        // And the framing is exactly prefix ‖ tag ‖ len ‖ data.
        let expected = sha512_half(
            HashPrefix::LeafNode,
            &[&[0xAB; 32][..], &4u16.to_be_bytes(), &[1, 2, 3, 4]],
        );
        assert_eq!(*node.hash(), expected);
    }

    #[test]
    fn wire_round_trip_leaf() {
        let node = leaf();
        let wire = node.serialize(NodeFormat::Wire);
        let back = TreeNode::parse(&NodeId::root(), &wire, NodeFormat::Wire, 1).unwrap();
        assert_eq!(node, back);
    }

    #[test]
    fn prefixed_round_trip_inner() {
        let mut node = TreeNode::new_inner(1);
        node.set_child(3, Hash256::new([1; 32]));
        node.set_child(12, Hash256::new([2; 32]));
        let prefixed = node.serialize(NodeFormat::Prefixed);
        let back = TreeNode::parse(&NodeId::root(), &prefixed, NodeFormat::Prefixed, 1).unwrap();
        assert_eq!(node, back);
        assert_eq!(node.hash(), back.hash());
    }

    #[test]
    fn empty_inner_hashes_to_zero() {
        let node = TreeNode::new_inner(1);
        assert!(node.hash().is_zero());
    }

    #[test]
    fn leaf_kinds_hash_in_distinct_domains() {
        let item = Arc::new(Item::new(Hash256::new([5; 32]), vec![9]));
        let a = TreeNode::new_leaf(LeafKind::AccountState, item.clone(), 1);
        let b = TreeNode::new_leaf(LeafKind::TxnNoMeta, item.clone(), 1);
        let c = TreeNode::new_leaf(LeafKind::TxnWithMeta, item, 1);
        assert_ne!(a.hash(), b.hash());
        assert_ne!(b.hash(), c.hash());
    }

    #[test]
    fn truncated_bytes_rejected() {
        let node = leaf();
        let mut wire = node.serialize(NodeFormat::Wire);
        wire.truncate(wire.len() - 3);
        assert!(TreeNode::parse(&NodeId::root(), &wire, NodeFormat::Wire, 1).is_err());
        assert!(TreeNode::parse(&NodeId::root(), &[], NodeFormat::Wire, 1).is_err());
    }
}
