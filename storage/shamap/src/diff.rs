// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Structural comparison of two maps.
//!
//! `compare` lists the items whose membership or data differs, descending
//! only into branches whose child hashes disagree. This feeds dispute
//! creation in consensus: each asymmetric leaf between our candidate set and
//! a peer's becomes a disputed transaction. A bound caps the work so a
//! nonsense map from a peer cannot make us walk forever.

use crate::{map::SHAMap, node::TreeNode, Item, NodeId, SHAMapError};
use meridian_crypto::Hash256;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `(ours, theirs)`: one side `None` means only the other map has the item;
/// both `Some` means the tag exists in both with different data.
pub type DiffEntry = (Option<Arc<Item>>, Option<Arc<Item>>);

/// Differences keyed by item tag.
pub type Diff = BTreeMap<Hash256, DiffEntry>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Ours,
    Theirs,
}

impl Side {
    fn entry(self, item: Arc<Item>) -> DiffEntry {
        match self {
            Side::Ours => (Some(item), None),
            Side::Theirs => (None, Some(item)),
        }
    }
}

struct DiffBuilder {
    diff: Diff,
    remaining: usize,
}

impl DiffBuilder {
    fn insert(&mut self, tag: Hash256, entry: DiffEntry) -> bool {
        self.diff.insert(tag, entry);
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

impl SHAMap {
    /// Compares this map (`ours`) against `other` (`theirs`), producing up
    /// to `max_count` differing items. Returns `None` when the maps differ
    /// by more than the bound.
    pub fn compare(&self, other: &SHAMap, max_count: usize) -> Result<Option<Diff>, SHAMapError> {
        let mut builder = DiffBuilder {
            diff: Diff::new(),
            remaining: max_count.max(1),
        };
        if self.root_hash() == other.root_hash() {
            return Ok(Some(builder.diff));
        }

        let mut stack: Vec<(NodeId, Option<Arc<TreeNode>>, Option<Arc<TreeNode>>)> =
            vec![(NodeId::root(), Some(self.root_node()), Some(other.root_node()))];

        while let Some((id, ours, theirs)) = stack.pop() {
            match (ours, theirs) {
                (Some(a), Some(b)) => {
                    if a.hash() == b.hash() {
                        continue;
                    }
                    match (a.item(), b.item()) {
                        (Some(our_item), Some(their_item)) => {
                            if !diff_leaf_pair(our_item, their_item, &mut builder) {
                                return Ok(None);
                            }
                        }
                        (Some(our_item), None) => {
                            // Our lone leaf against their subtree.
                            if !walk_branch(
                                other,
                                &id,
                                &b,
                                Some(our_item.clone()),
                                Side::Theirs,
                                &mut builder,
                            )? {
                                return Ok(None);
                            }
                        }
                        (None, Some(their_item)) => {
                            if !walk_branch(
                                self,
                                &id,
                                &a,
                                Some(their_item.clone()),
                                Side::Ours,
                                &mut builder,
                            )? {
                                return Ok(None);
                            }
                        }
                        (None, None) => {
                            for branch in 0..16 {
                                let ours_hash = *a.child_hash(branch);
                                let theirs_hash = *b.child_hash(branch);
                                if ours_hash == theirs_hash {
                                    continue;
                                }
                                let child_id = id.child(branch);
                                let our_child = if ours_hash.is_zero() {
                                    None
                                } else {
                                    Some(self.fetch(&child_id, &ours_hash, None)?)
                                };
                                let their_child = if theirs_hash.is_zero() {
                                    None
                                } else {
                                    Some(other.fetch(&child_id, &theirs_hash, None)?)
                                };
                                stack.push((child_id, our_child, their_child));
                            }
                        }
                    }
                }
                (Some(a), None) => {
                    if !walk_branch(self, &id, &a, None, Side::Ours, &mut builder)? {
                        return Ok(None);
                    }
                }
                (None, Some(b)) => {
                    if !walk_branch(other, &id, &b, None, Side::Theirs, &mut builder)? {
                        return Ok(None);
                    }
                }
                (None, None) => {}
            }
        }

        Ok(Some(builder.diff))
    }

    /// Structural equality down to items; pulls nodes through both maps'
    /// stores. Intended for tests and the sync completion check.
    pub fn deep_compare(&self, other: &SHAMap) -> Result<bool, SHAMapError> {
        let mut stack = vec![(NodeId::root(), self.root_node(), other.root_node())];
        while let Some((id, a, b)) = stack.pop() {
            if a.hash() != b.hash() {
                return Ok(false);
            }
            match (a.item(), b.item()) {
                (Some(our_item), Some(their_item)) => {
                    if our_item.tag() != their_item.tag()
                        || our_item.data() != their_item.data()
                    {
                        return Ok(false);
                    }
                }
                (None, None) => {
                    for branch in 0..16 {
                        let empty_a = a.is_empty_branch(branch);
                        let empty_b = b.is_empty_branch(branch);
                        if empty_a != empty_b {
                            return Ok(false);
                        }
                        if empty_a {
                            continue;
                        }
                        let child_id = id.child(branch);
                        let our_child = self.fetch(&child_id, a.child_hash(branch), None)?;
                        let their_child = other.fetch(&child_id, b.child_hash(branch), None)?;
                        stack.push((child_id, our_child, their_child));
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

fn diff_leaf_pair(
    our_item: &Arc<Item>,
    their_item: &Arc<Item>,
    builder: &mut DiffBuilder,
) -> bool {
    if our_item.tag() == their_item.tag() {
        if our_item.data() != their_item.data() {
            return builder.insert(
                *our_item.tag(),
                (Some(our_item.clone()), Some(their_item.clone())),
            );
        }
        true
    } else {
        if !builder.insert(*our_item.tag(), (Some(our_item.clone()), None)) {
            return false;
        }
        builder.insert(*their_item.tag(), (None, Some(their_item.clone())))
    }
}

/// Walks one map's subtree that the other map matches with an empty branch
/// or a single leaf. Every item found is a difference on `side`, except a
/// tag match against `counterpart`, which diffs by data.
fn walk_branch(
    map: &SHAMap,
    id: &NodeId,
    node: &Arc<TreeNode>,
    counterpart: Option<Arc<Item>>,
    side: Side,
    builder: &mut DiffBuilder,
) -> Result<bool, SHAMapError> {
    let mut counterpart = counterpart;
    let mut stack = vec![(*id, node.clone())];
    while let Some((at, node)) = stack.pop() {
        if let Some(item) = node.item() {
            match &counterpart {
                Some(other) if other.tag() == item.tag() => {
                    if other.data() != item.data() {
                        let entry = match side {
                            Side::Ours => (Some(item.clone()), Some(other.clone())),
                            Side::Theirs => (Some(other.clone()), Some(item.clone())),
                        };
                        if !builder.insert(*item.tag(), entry) {
                            return Ok(false);
                        }
                    }
                    counterpart = None;
                }
                _ => {
                    if !builder.insert(*item.tag(), side.entry(item.clone())) {
                        return Ok(false);
                    }
                }
            }
            continue;
        }
        for branch in 0..16 {
            if node.is_empty_branch(branch) {
                continue;
            }
            let child_id = at.child(branch);
            let child = map.fetch(&child_id, node.child_hash(branch), None)?;
            stack.push((child_id, child));
        }
    }

    if let Some(other) = counterpart {
        let tag = *other.tag();
        let entry = match side {
            Side::Ours => (None, Some(other)),
            Side::Theirs => (Some(other), None),
        };
        if !builder.insert(tag, entry) {
            return Ok(false);
        }
    }
    Ok(true)
}
