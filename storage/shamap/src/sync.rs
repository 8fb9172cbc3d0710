// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-sided, interruptible subtree transfer.
//!
//! The destination knows only a root hash. It installs the root via
//! [`SHAMap::add_root_node`], then loops: [`SHAMap::get_missing_nodes`] names
//! child positions it cannot resolve, peers answer with fat responses served
//! by [`SHAMap::get_node_fat`], and each received node passes through
//! [`SHAMap::add_known_node`], which verifies it against the parent's
//! recorded child hash before installing. When nothing is missing the map is
//! complete and becomes immutable.

use crate::{
    map::{MapState, MapType, SHAMap},
    node::{LeafKind, NodeFormat, TreeNode},
    NodeId, SHAMapError,
};
use meridian_crypto::Hash256;
use meridian_infallible::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of feeding received bytes into a synching map. `invalid` means
/// the sender gave us something provably wrong and its contribution to this
/// sync should end; `useful` means the map made progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddResult {
    invalid: bool,
    useful: bool,
}

impl AddResult {
    pub fn okay() -> Self {
        Self::default()
    }

    pub fn useful() -> Self {
        Self {
            invalid: false,
            useful: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            invalid: true,
            useful: false,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn is_useful(&self) -> bool {
        self.useful
    }

    /// OR on `invalid`, OR on `useful`. Returns `false` once invalid.
    pub fn combine(&mut self, other: AddResult) -> bool {
        self.invalid |= other.invalid;
        self.useful |= other.useful;
        !self.invalid
    }
}

/// Side-effect hooks the sync protocol calls as nodes flow through a map.
/// `have_node` lets a destination resolve nodes from somewhere other than
/// its own table (a shared temp cache, the transaction index); `got_node`
/// observes every verified node (PREFIXED bytes) as it is installed.
pub trait SyncFilter {
    fn have_node(&self, id: &NodeId, hash: &Hash256) -> Option<Vec<u8>>;
    fn got_node(&self, id: &NodeId, hash: &Hash256, prefixed: &[u8], kind: Option<LeafKind>);
}

/// A filter that neither resolves nor observes anything.
#[derive(Debug, Default)]
pub struct NullFilter;

impl SyncFilter for NullFilter {
    fn have_node(&self, _id: &NodeId, _hash: &Hash256) -> Option<Vec<u8>> {
        None
    }

    fn got_node(&self, _id: &NodeId, _hash: &Hash256, _prefixed: &[u8], _kind: Option<LeafKind>) {}
}

/// Hashes of subtrees known to be fully present locally, shared across maps
/// so one ledger's sync saves the next one's traversal. Bounded by a coarse
/// clear when over capacity.
pub struct FullBelowCache {
    capacity: usize,
    set: Mutex<HashSet<Hash256>>,
}

impl FullBelowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            set: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert(&self, hash: Hash256) {
        let mut set = self.set.lock();
        if set.len() >= self.capacity {
            set.clear();
        }
        set.insert(hash);
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.set.lock().contains(hash)
    }
}

impl Default for FullBelowCache {
    fn default() -> Self {
        Self::new(65_536)
    }
}

impl SHAMap {
    fn is_full_below(&self, hash: &Hash256) -> bool {
        self.full_below_local.contains(hash)
            || self
                .full_below_shared
                .as_ref()
                .map_or(false, |cache| cache.contains(hash))
    }

    fn mark_full_below(&mut self, hash: Hash256) {
        self.full_below_local.insert(hash);
        if self.map_type() == MapType::State {
            if let Some(cache) = &self.full_below_shared {
                cache.insert(hash);
            }
        }
    }

    fn complete_sync(&mut self) {
        if self.state() == MapState::Synching {
            self.set_immutable();
        }
    }

    /// Resolves a child during sync: the position table, then the object
    /// store, then the filter. Anything found is verified against `hash`
    /// and installed.
    fn sync_fetch(
        &mut self,
        id: &NodeId,
        hash: &Hash256,
        filter: &dyn SyncFilter,
    ) -> Result<Option<Arc<TreeNode>>, SHAMapError> {
        if let Some(node) = self.nodes_get(id) {
            return Ok(Some(node));
        }
        if let Some(store) = self.store() {
            if let Some(bytes) = store.get(hash)? {
                if let Some(node) = parse_verified(id, &bytes, NodeFormat::Prefixed, hash, self.seq())
                {
                    let node = Arc::new(node);
                    self.install_shared(*id, node.clone());
                    return Ok(Some(node));
                }
                warn!(target: "shamap", %id, "object store returned bytes with the wrong hash");
            }
        }
        if let Some(bytes) = filter.have_node(id, hash) {
            if let Some(node) = parse_verified(id, &bytes, NodeFormat::Prefixed, hash, self.seq()) {
                let node = Arc::new(node);
                self.install_shared(*id, node.clone());
                return Ok(Some(node));
            }
            debug!(target: "shamap", %id, "filter offered bytes with the wrong hash");
        }
        Ok(None)
    }

    /// DFS from the root naming up to `max` child positions whose nodes are
    /// not resolvable locally. Branch order is randomized per node so a
    /// cohort of syncing peers does not request the same nodes in lockstep.
    /// Subtrees verified complete are marked full-below and skipped
    /// thereafter. An empty result means the sync is complete.
    pub fn get_missing_nodes(
        &mut self,
        max: usize,
        filter: &dyn SyncFilter,
    ) -> Result<Vec<(NodeId, Hash256)>, SHAMapError> {
        if !self.is_synching() {
            return Ok(Vec::new());
        }
        // Awaiting a non-trivial root: the placeholder still hashes to zero,
        // which must read as "need the root", not "empty map, done".
        if let Some(expected) = self.expected_root {
            if !expected.is_zero() && self.root_hash().is_zero() {
                return Ok(vec![(NodeId::root(), expected)]);
            }
        }
        let root = self.root_node();
        if root.hash().is_zero() || root.is_leaf() || self.is_full_below(root.hash()) {
            self.complete_sync();
            return Ok(Vec::new());
        }

        let mut missing = Vec::new();
        let mut stack = vec![(NodeId::root(), root)];
        let mut rng = rand::thread_rng();

        while let Some((id, node)) = stack.pop() {
            let base: usize = rng.gen_range(0, 16);
            let mut have_all = true;
            for offset in 0..16usize {
                let branch = ((base + offset) % 16) as u8;
                if node.is_empty_branch(branch) {
                    continue;
                }
                let child_hash = *node.child_hash(branch);
                if self.is_full_below(&child_hash) {
                    continue;
                }
                let child_id = id.child(branch);
                match self.sync_fetch(&child_id, &child_hash, filter)? {
                    Some(child) => {
                        if child.is_inner() {
                            have_all = false;
                            stack.push((child_id, child));
                        }
                    }
                    None => {
                        have_all = false;
                        missing.push((child_id, child_hash));
                        if missing.len() >= max {
                            return Ok(missing);
                        }
                    }
                }
            }
            if have_all {
                self.mark_full_below(*node.hash());
            }
        }

        if missing.is_empty() {
            self.complete_sync();
        }
        Ok(missing)
    }

    /// Installs the root of a synching map after hash verification. The
    /// expected hash is whatever the map was created to acquire, unless the
    /// caller pins one explicitly.
    pub fn add_root_node(
        &mut self,
        expected: Option<&Hash256>,
        bytes: &[u8],
        format: NodeFormat,
        filter: &dyn SyncFilter,
    ) -> AddResult {
        if !self.root_hash().is_zero() {
            trace!(target: "shamap", "got root node, already have one");
            return AddResult::okay();
        }
        let node = match TreeNode::parse(&NodeId::root(), bytes, format, self.seq()) {
            Ok(node) => node,
            Err(_) => return AddResult::invalid(),
        };
        let expected = expected.copied().or(self.expected_root);
        if let Some(expected) = expected {
            if *node.hash() != expected {
                warn!(target: "shamap", "root node does not match the hash being acquired");
                return AddResult::invalid();
            }
        }

        let hash = *node.hash();
        let prefixed = node.serialize(NodeFormat::Prefixed);
        let kind = node.leaf_kind();
        let complete = hash.is_zero() || node.is_leaf();
        self.install_shared(NodeId::root(), Arc::new(node));
        if !hash.is_zero() {
            filter.got_node(&NodeId::root(), &hash, &prefixed, kind);
        }
        if complete {
            self.complete_sync();
        }
        AddResult::useful()
    }

    /// Installs a non-root node previously named by `get_missing_nodes`.
    /// The bytes are verified against the parent's recorded child hash, so a
    /// peer cannot smuggle in a wrong subtree.
    pub fn add_known_node(
        &mut self,
        id: &NodeId,
        bytes: &[u8],
        filter: &dyn SyncFilter,
    ) -> Result<AddResult, SHAMapError> {
        if id.is_root() {
            debug_assert!(false, "root nodes go through add_root_node");
            return Ok(AddResult::okay());
        }
        if !self.is_synching() {
            trace!(target: "shamap", "node arrived while not synching");
            return Ok(AddResult::okay());
        }
        if self.contains_id(id) {
            return Ok(AddResult::okay());
        }

        let mut at = NodeId::root();
        let mut node = self.root_node();
        loop {
            if node.is_leaf() || self.is_full_below(node.hash()) || at.depth() >= id.depth() {
                trace!(target: "shamap", %id, "got node, already had it (late)");
                return Ok(AddResult::okay());
            }
            if !at.contains(id.id()) {
                warn!(target: "shamap", %id, "node does not belong under this map's path");
                return Ok(AddResult::invalid());
            }
            let branch = at.select_branch(id.id());
            if node.is_empty_branch(branch) {
                warn!(target: "shamap", %id, "received node for an empty branch");
                return Ok(AddResult::invalid());
            }
            let child_hash = *node.child_hash(branch);
            if self.is_full_below(&child_hash) {
                return Ok(AddResult::okay());
            }
            let child_id = at.child(branch);
            match self.sync_fetch(&child_id, &child_hash, filter)? {
                Some(child) => {
                    at = child_id;
                    node = child;
                }
                None => {
                    if at.depth() != id.depth() - 1 {
                        // Either the tree is broken or we did not ask for
                        // this node yet.
                        warn!(target: "shamap", %id, at = %at, "unable to hook received node");
                        return Ok(AddResult::invalid());
                    }
                    let new_node = match TreeNode::parse(id, bytes, NodeFormat::Wire, self.seq()) {
                        Ok(node) => node,
                        Err(_) => return Ok(AddResult::invalid()),
                    };
                    if *new_node.hash() != child_hash {
                        warn!(target: "shamap", %id, "corrupt node received");
                        return Ok(AddResult::invalid());
                    }
                    let prefixed = new_node.serialize(NodeFormat::Prefixed);
                    let kind = new_node.leaf_kind();
                    filter.got_node(id, &child_hash, &prefixed, kind);
                    self.install_shared(*id, Arc::new(new_node));
                    return Ok(AddResult::useful());
                }
            }
        }
    }

    /// Serves a sync request: the named node and, unless it is the root
    /// (when `fat_root` is off) or a leaf, its direct children. Fat
    /// responses amortize round trips.
    pub fn get_node_fat(
        &self,
        id: &NodeId,
        fat_root: bool,
        fat_leaves: bool,
    ) -> Result<Vec<(NodeId, Vec<u8>)>, SHAMapError> {
        let node = match self.node_by_id(id)? {
            Some(node) => node,
            None => {
                warn!(target: "shamap", %id, "peer requested a node not in the map");
                return Ok(Vec::new());
            }
        };
        if node.is_empty_inner() {
            warn!(target: "shamap", %id, "peer requested an empty node");
            return Ok(Vec::new());
        }

        let mut out = vec![(*id, node.serialize(NodeFormat::Wire))];
        if (id.is_root() && !fat_root) || node.is_leaf() {
            return Ok(out);
        }
        for branch in 0..16 {
            if node.is_empty_branch(branch) {
                continue;
            }
            let child_id = id.child(branch);
            let child = self.fetch(&child_id, node.child_hash(branch), None)?;
            if fat_leaves || child.is_inner() {
                out.push((child_id, child.serialize(NodeFormat::Wire)));
            }
        }
        Ok(out)
    }

    pub fn get_root_node(&self, format: NodeFormat) -> Vec<u8> {
        self.root_node().serialize(format)
    }

    /// The root-to-leaf node chain proving `tag`'s membership, or `None` if
    /// the tag is absent.
    pub fn get_path(
        &self,
        tag: &Hash256,
        format: NodeFormat,
    ) -> Result<Option<Vec<Vec<u8>>>, SHAMapError> {
        let mut out = Vec::new();
        let mut id = NodeId::root();
        let mut node = self.root_node();
        loop {
            out.push(node.serialize(format));
            if node.is_leaf() {
                return Ok(if node.tag() == Some(tag) { Some(out) } else { None });
            }
            let branch = id.select_branch(tag);
            if node.is_empty_branch(branch) {
                return Ok(None);
            }
            let child_hash = *node.child_hash(branch);
            id = id.child(branch);
            node = self.fetch(&id, &child_hash, Some(tag))?;
        }
    }
}

/// Verifies a membership path produced by [`SHAMap::get_path`] (WIRE format)
/// against a trusted root hash.
pub fn check_path(root_hash: &Hash256, tag: &Hash256, path: &[Vec<u8>]) -> bool {
    let mut expected = *root_hash;
    let mut id = NodeId::root();
    for (i, bytes) in path.iter().enumerate() {
        let node = match TreeNode::parse(&id, bytes, NodeFormat::Wire, 0) {
            Ok(node) => node,
            Err(_) => return false,
        };
        if *node.hash() != expected {
            return false;
        }
        if node.is_leaf() {
            return node.tag() == Some(tag) && i == path.len() - 1;
        }
        let branch = id.select_branch(tag);
        if node.is_empty_branch(branch) {
            return false;
        }
        expected = *node.child_hash(branch);
        id = id.child(branch);
    }
    false
}

fn parse_verified(
    id: &NodeId,
    bytes: &[u8],
    format: NodeFormat,
    expected: &Hash256,
    seq: u32,
) -> Option<TreeNode> {
    let node = TreeNode::parse(id, bytes, format, seq).ok()?;
    if node.hash() == expected {
        Some(node)
    } else {
        None
    }
}
