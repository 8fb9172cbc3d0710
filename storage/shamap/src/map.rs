// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    node::{LeafKind, NodeFormat, TreeNode},
    sync::FullBelowCache,
    Item, NodeId, SHAMapError,
};
use meridian_crypto::{content_hash, Hash256};
use meridian_store::{HashedObjectStore, ObjectType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// What the map holds, which decides fetch behaviour and the full-below
/// cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// A ledger's transaction tree or a consensus candidate set.
    Transaction,
    /// A ledger's account-state tree.
    State,
    /// A tree not attached to a ledger.
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Items can be added and removed (an open ledger).
    Modifying,
    /// The map can never change again (a closed ledger).
    Immutable,
    /// The root hash is pinned; verified nodes may be installed (a peer's
    /// set being acquired).
    Synching,
    /// Known bad, usually an aborted acquisition.
    Invalid,
}

impl MapState {
    fn name(self) -> &'static str {
        match self {
            MapState::Modifying => "modifying",
            MapState::Immutable => "immutable",
            MapState::Synching => "synching",
            MapState::Invalid => "invalid",
        }
    }
}

pub type DirtyMap = HashMap<NodeId, Arc<TreeNode>>;

/// The copy-on-write authenticated map. See the crate docs for the model;
/// briefly: `nodes` caches every reachable node by position, nodes are
/// immutable behind `Arc`, and mutations rebuild the root path stamped with
/// this map's `seq`. A snapshot clones the position table (refcount bumps
/// only) and bumps `seq` on both maps so neither can touch shared nodes.
pub struct SHAMap {
    map_type: MapType,
    state: MapState,
    seq: u32,
    nodes: HashMap<NodeId, Arc<TreeNode>>,
    dirty: Option<DirtyMap>,
    store: Option<Arc<HashedObjectStore>>,
    pub(crate) full_below_local: std::collections::HashSet<Hash256>,
    pub(crate) full_below_shared: Option<Arc<FullBelowCache>>,
    /// Root hash a synching map is working toward, when known up front.
    pub(crate) expected_root: Option<Hash256>,
}

impl SHAMap {
    /// A new empty, mutable map.
    pub fn new(map_type: MapType) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::root(), Arc::new(TreeNode::new_inner(1)));
        Self {
            map_type,
            state: MapState::Modifying,
            seq: 1,
            nodes,
            dirty: None,
            store: None,
            full_below_local: Default::default(),
            full_below_shared: None,
            expected_root: None,
        }
    }

    /// A map that will be synced toward `root_hash` via the sync protocol.
    pub fn new_synching(map_type: MapType, root_hash: Hash256) -> Self {
        let mut map = Self::new(map_type);
        map.state = MapState::Synching;
        map.expected_root = Some(root_hash);
        map
    }

    pub fn with_store(mut self, store: Arc<HashedObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_full_below_cache(mut self, cache: Arc<FullBelowCache>) -> Self {
        self.full_below_shared = Some(cache);
        self
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn is_synching(&self) -> bool {
        self.state == MapState::Synching
    }

    pub fn is_valid(&self) -> bool {
        self.state != MapState::Invalid
    }

    pub fn set_immutable(&mut self) {
        debug_assert!(self.state != MapState::Invalid);
        self.state = MapState::Immutable;
    }

    pub fn set_synching(&mut self) {
        self.state = MapState::Synching;
    }

    pub fn set_invalid(&mut self) {
        self.state = MapState::Invalid;
    }

    /// The root hash; zero for an empty map.
    pub fn root_hash(&self) -> Hash256 {
        *self.root_node().hash()
    }

    pub(crate) fn root_node(&self) -> Arc<TreeNode> {
        self.nodes
            .get(&NodeId::root())
            .expect("a map always has a root node")
            .clone()
    }

    /// O(1) snapshot. The new map shares every node with this one; both
    /// sides copy before writing from here on. `mutable` controls whether
    /// the snapshot accepts further changes.
    pub fn snapshot(&mut self, mutable: bool) -> SHAMap {
        self.seq += 1;
        SHAMap {
            map_type: self.map_type,
            state: if mutable {
                MapState::Modifying
            } else {
                MapState::Immutable
            },
            seq: self.seq,
            nodes: self.nodes.clone(),
            dirty: None,
            store: self.store.clone(),
            full_below_local: Default::default(),
            full_below_shared: self.full_below_shared.clone(),
            expected_root: None,
        }
    }

    /// A mutable copy of a frozen map. Unlike [`SHAMap::snapshot`] this
    /// takes `&self`: an immutable map's nodes can never change, so only
    /// the copy needs copy-on-write protection.
    pub fn fork(&self) -> SHAMap {
        debug_assert!(
            self.state == MapState::Immutable,
            "fork is only sound on an immutable map"
        );
        SHAMap {
            map_type: self.map_type,
            state: MapState::Modifying,
            seq: self.seq + 1,
            nodes: self.nodes.clone(),
            dirty: None,
            store: self.store.clone(),
            full_below_local: Default::default(),
            full_below_shared: self.full_below_shared.clone(),
            expected_root: None,
        }
    }

    // ---- node access -----------------------------------------------------

    /// Looks up a node by position, falling back to the object store. Does
    /// not populate the position table, so read paths stay `&self`; the
    /// sync side caches what it pulls in.
    pub(crate) fn fetch(
        &self,
        id: &NodeId,
        hash: &Hash256,
        target: Option<&Hash256>,
    ) -> Result<Arc<TreeNode>, SHAMapError> {
        if let Some(node) = self.nodes.get(id) {
            debug_assert_eq!(node.hash(), hash, "position table entry is stale");
            return Ok(node.clone());
        }
        self.fetch_external(id, hash, target)
    }

    pub(crate) fn nodes_get(&self, id: &NodeId) -> Option<Arc<TreeNode>> {
        self.nodes.get(id).cloned()
    }

    /// The object store backing this map, if any.
    pub fn store(&self) -> Option<Arc<HashedObjectStore>> {
        self.store.clone()
    }

    /// Installs an already-shared node (sync path), tracking dirty state
    /// the same way as [`SHAMap::install`].
    pub(crate) fn install_shared(&mut self, id: NodeId, node: Arc<TreeNode>) {
        if let Some(dirty) = &mut self.dirty {
            dirty.insert(id, node.clone());
        }
        self.nodes.insert(id, node);
    }

    fn fetch_external(
        &self,
        id: &NodeId,
        hash: &Hash256,
        target: Option<&Hash256>,
    ) -> Result<Arc<TreeNode>, SHAMapError> {
        let missing = || SHAMapError::MissingNode {
            map_type: self.map_type,
            node_id: *id,
            node_hash: *hash,
            target: target.copied(),
        };
        let store = self.store.as_ref().ok_or_else(missing)?;
        let bytes = store.get(hash)?.ok_or_else(missing)?;
        let node = TreeNode::parse(id, &bytes, NodeFormat::Prefixed, self.seq.saturating_sub(1))
            .map_err(|_| missing())?;
        if node.hash() != hash {
            warn!(target: "shamap", %id, "stored bytes do not hash to their key");
            return Err(missing());
        }
        Ok(Arc::new(node))
    }

    /// Installs a rebuilt node, tracking it as dirty when flushing is armed.
    pub(crate) fn install(&mut self, id: NodeId, node: TreeNode) -> Hash256 {
        let hash = *node.hash();
        let node = Arc::new(node);
        if let Some(dirty) = &mut self.dirty {
            dirty.insert(id, node.clone());
        }
        self.nodes.insert(id, node);
        hash
    }

    pub(crate) fn remove_node(&mut self, id: &NodeId) {
        self.nodes.remove(id);
    }

    pub(crate) fn contains_id(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Walks by node identifier (not by tag), as the fat-node server side
    /// does when answering `GetLedger` requests.
    pub(crate) fn node_by_id(&self, id: &NodeId) -> Result<Option<Arc<TreeNode>>, SHAMapError> {
        if let Some(node) = self.nodes.get(id) {
            return Ok(Some(node.clone()));
        }
        let mut at = NodeId::root();
        let mut node = self.root_node();
        while at != *id {
            if node.is_leaf() || !at.contains(id.id()) {
                return Ok(None);
            }
            let branch = at.select_branch(id.id());
            if node.is_empty_branch(branch) {
                return Ok(None);
            }
            let child_hash = *node.child_hash(branch);
            at = at.child(branch);
            node = self.fetch(&at, &child_hash, None)?;
        }
        Ok(Some(node))
    }

    // ---- tag walks -------------------------------------------------------

    /// Root-to-terminal walk toward `tag`. The returned stack holds the
    /// inner nodes along the path; the terminal node (a leaf, matching or
    /// not, or the inner node with the empty branch) is last.
    fn walk_stack(&self, tag: &Hash256) -> Result<Vec<(NodeId, Arc<TreeNode>)>, SHAMapError> {
        let mut stack = Vec::new();
        let mut id = NodeId::root();
        let mut node = self.root_node();
        loop {
            if node.is_leaf() {
                stack.push((id, node));
                return Ok(stack);
            }
            let branch = id.select_branch(tag);
            if node.is_empty_branch(branch) {
                stack.push((id, node));
                return Ok(stack);
            }
            let child_hash = *node.child_hash(branch);
            stack.push((id, node));
            id = id.child(branch);
            node = self.fetch(&id, &child_hash, Some(tag))?;
        }
    }

    /// Returns the item stored under `tag`, if any.
    pub fn get(&self, tag: &Hash256) -> Result<Option<Arc<Item>>, SHAMapError> {
        let mut id = NodeId::root();
        let mut node = self.root_node();
        while node.is_inner() {
            let branch = id.select_branch(tag);
            if node.is_empty_branch(branch) {
                return Ok(None);
            }
            let child_hash = *node.child_hash(branch);
            id = id.child(branch);
            node = self.fetch(&id, &child_hash, Some(tag))?;
        }
        Ok(node.item().filter(|i| i.tag() == tag).cloned())
    }

    pub fn has(&self, tag: &Hash256) -> Result<bool, SHAMapError> {
        Ok(self.get(tag)?.is_some())
    }

    fn require_mutable(&self) -> Result<(), SHAMapError> {
        if self.state != MapState::Modifying {
            return Err(SHAMapError::WrongState {
                state: self.state.name(),
                requires: "modifying",
            });
        }
        Ok(())
    }

    /// Inserts an item. Returns `false` when an item with the same tag is
    /// already present (the map is unchanged).
    pub fn add(&mut self, item: Item, kind: LeafKind) -> Result<bool, SHAMapError> {
        self.require_mutable()?;
        let tag = *item.tag();
        let item = Arc::new(item);

        let mut stack = self.walk_stack(&tag)?;
        let (terminal_id, terminal) = stack.pop().expect("walk always yields the root");

        let new_hash;
        if terminal.is_inner() {
            if terminal_id.is_root() && terminal.is_empty_inner() {
                // First item: the lone leaf is the root.
                let leaf = TreeNode::new_leaf(kind, item, self.seq);
                new_hash = self.install(terminal_id, leaf);
                debug_assert!(stack.is_empty());
                return Ok(true);
            }
            // The path ends on an empty branch: hang the new leaf there.
            let branch = terminal_id.select_branch(&tag);
            debug_assert!(terminal.is_empty_branch(branch));
            let leaf_id = terminal_id.child(branch);
            let leaf = TreeNode::new_leaf(kind, item, self.seq);
            let leaf_hash = self.install(leaf_id, leaf);

            let mut parent = terminal.reclone(self.seq);
            parent.set_child(branch, leaf_hash);
            new_hash = self.install(terminal_id, parent);
        } else {
            let existing = terminal.item().expect("leaf holds an item").clone();
            let existing_kind = terminal.leaf_kind().expect("leaf has a kind");
            if existing.tag() == &tag {
                return Ok(false);
            }

            // Two leaves now collide at this position: build inner nodes
            // down to the depth where their paths diverge.
            let mut chain = Vec::new();
            let mut at = terminal_id;
            loop {
                let b_new = at.select_branch(&tag);
                let b_old = at.select_branch(existing.tag());
                if b_new != b_old {
                    let new_leaf = TreeNode::new_leaf(kind, item, self.seq);
                    let new_leaf_hash = self.install(at.child(b_new), new_leaf);
                    let old_leaf = TreeNode::new_leaf(existing_kind, existing, self.seq);
                    let old_leaf_hash = self.install(at.child(b_old), old_leaf);

                    let mut inner = TreeNode::new_inner(self.seq);
                    inner.set_child(b_new, new_leaf_hash);
                    inner.set_child(b_old, old_leaf_hash);
                    let mut hash = self.install(at, inner);

                    // Thread the freshly built chain back up to the
                    // original collision position.
                    while let Some((chain_id, branch)) = chain.pop() {
                        let mut inner = TreeNode::new_inner(self.seq);
                        inner.set_child(branch, hash);
                        hash = self.install(chain_id, inner);
                    }
                    new_hash = hash;
                    break;
                }
                chain.push((at, b_new));
                at = at.child(b_new);
            }
        }

        self.dirty_up(&mut stack, &tag, new_hash);
        Ok(true)
    }

    /// Replaces the data under an existing tag. Returns `false` if the tag
    /// is absent or the replacement changes nothing.
    pub fn update(&mut self, item: Item, kind: LeafKind) -> Result<bool, SHAMapError> {
        self.require_mutable()?;
        let tag = *item.tag();

        let mut stack = self.walk_stack(&tag)?;
        let (leaf_id, leaf) = stack.pop().expect("walk always yields the root");
        if leaf.tag() != Some(&tag) {
            return Ok(false);
        }

        let mut replacement = leaf.reclone(self.seq);
        if !replacement.set_item(kind, Arc::new(item)) {
            return Ok(false);
        }
        let new_hash = self.install(leaf_id, replacement);
        self.dirty_up(&mut stack, &tag, new_hash);
        Ok(true)
    }

    /// Removes the item under `tag`, re-canonicalizing the path: inner nodes
    /// left with no children disappear, inner nodes left over a single leaf
    /// collapse to hold that leaf directly.
    pub fn delete(&mut self, tag: &Hash256) -> Result<bool, SHAMapError> {
        self.require_mutable()?;

        let mut stack = self.walk_stack(tag)?;
        let (leaf_id, leaf) = stack.pop().expect("walk always yields the root");
        if leaf.tag() != Some(tag) {
            return Ok(false);
        }
        if leaf_id.is_root() {
            // Deleting the only item: back to the empty map.
            self.install(leaf_id, TreeNode::new_inner(self.seq));
            return Ok(true);
        }
        self.remove_node(&leaf_id);

        let mut prev_hash = Hash256::zero();
        while let Some((id, node)) = stack.pop() {
            debug_assert!(node.is_inner());
            let mut rebuilt = node.reclone(self.seq);
            rebuilt.set_child(id.select_branch(tag), prev_hash);

            match rebuilt.branch_count() {
                0 if !id.is_root() => {
                    self.remove_node(&id);
                    prev_hash = Hash256::zero();
                    continue;
                }
                1 => {
                    // A lone leaf below an inner node is pulled up so the
                    // shape depends only on the surviving items.
                    if let Some((kind, only)) = self.only_below(&id, &rebuilt)? {
                        self.erase_children(&id, &rebuilt)?;
                        rebuilt.set_item(kind, only);
                    }
                }
                _ => {}
            }
            prev_hash = self.install(id, rebuilt);
        }
        Ok(true)
    }

    /// If exactly one leaf lives below `node`, returns it.
    fn only_below(
        &self,
        id: &NodeId,
        node: &TreeNode,
    ) -> Result<Option<(LeafKind, Arc<Item>)>, SHAMapError> {
        let mut id = *id;
        let mut current = node.clone();
        while current.is_inner() {
            let mut next = None;
            for branch in 0..16 {
                if !current.is_empty_branch(branch) {
                    if next.is_some() {
                        return Ok(None); // two subtrees below
                    }
                    next = Some((id.child(branch), *current.child_hash(branch)));
                }
            }
            let (child_id, child_hash) = next.expect("canonical inner nodes are never empty");
            current = (*self.fetch(&child_id, &child_hash, None)?).clone();
            id = child_id;
        }
        Ok(current
            .leaf_kind()
            .zip(current.item().cloned()))
    }

    /// Drops the position-table entries of the single-child chain below a
    /// collapsing node, so later walks cannot see stale entries.
    fn erase_children(&mut self, id: &NodeId, node: &TreeNode) -> Result<(), SHAMapError> {
        let mut id = *id;
        let mut current = node.clone();
        let mut erase = false;
        while current.is_inner() {
            let mut next = None;
            for branch in 0..16 {
                if !current.is_empty_branch(branch) {
                    next = Some((id.child(branch), *current.child_hash(branch)));
                    break;
                }
            }
            let (child_id, child_hash) = match next {
                Some(n) => n,
                None => break,
            };
            let child = self.fetch(&child_id, &child_hash, None)?;
            if erase {
                self.remove_node(&id);
            }
            erase = true;
            current = (*child).clone();
            id = child_id;
        }
        self.remove_node(&id);
        Ok(())
    }

    /// Rebuilds the inner nodes above a change, bottom-up, copying each one
    /// into this map's generation.
    fn dirty_up(
        &mut self,
        stack: &mut Vec<(NodeId, Arc<TreeNode>)>,
        tag: &Hash256,
        mut child_hash: Hash256,
    ) {
        while let Some((id, node)) = stack.pop() {
            debug_assert!(node.is_inner());
            let mut rebuilt = node.reclone(self.seq);
            rebuilt.set_child(id.select_branch(tag), child_hash);
            child_hash = self.install(id, rebuilt);
        }
    }

    // ---- ordered traversal ----------------------------------------------

    fn first_below(
        &self,
        mut id: NodeId,
        mut node: Arc<TreeNode>,
        descending: bool,
    ) -> Result<Option<Arc<Item>>, SHAMapError> {
        loop {
            if let Some(item) = node.item() {
                return Ok(Some(item.clone()));
            }
            let branches: Vec<u8> = if descending {
                (0..16).rev().collect()
            } else {
                (0..16).collect()
            };
            let mut found = false;
            for branch in branches {
                if !node.is_empty_branch(branch) {
                    let child_hash = *node.child_hash(branch);
                    id = id.child(branch);
                    node = self.fetch(&id, &child_hash, None)?;
                    found = true;
                    break;
                }
            }
            if !found {
                return Ok(None);
            }
        }
    }

    pub fn first(&self) -> Result<Option<Arc<Item>>, SHAMapError> {
        self.first_below(NodeId::root(), self.root_node(), false)
    }

    pub fn last(&self) -> Result<Option<Arc<Item>>, SHAMapError> {
        self.first_below(NodeId::root(), self.root_node(), true)
    }

    /// The item with the smallest tag strictly greater than `tag`.
    pub fn next(&self, tag: &Hash256) -> Result<Option<Arc<Item>>, SHAMapError> {
        let mut stack = self.walk_stack(tag)?;
        while let Some((id, node)) = stack.pop() {
            if let Some(item) = node.item() {
                if item.tag() > tag {
                    return Ok(Some(item.clone()));
                }
                continue;
            }
            let from = if id.contains(tag) {
                id.select_branch(tag) + 1
            } else {
                0
            };
            for branch in from..16 {
                if !node.is_empty_branch(branch) {
                    let child_hash = *node.child_hash(branch);
                    let child_id = id.child(branch);
                    let child = self.fetch(&child_id, &child_hash, None)?;
                    if let Some(item) = self.first_below(child_id, child, false)? {
                        return Ok(Some(item));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The item with the largest tag strictly smaller than `tag`.
    pub fn prev(&self, tag: &Hash256) -> Result<Option<Arc<Item>>, SHAMapError> {
        let mut stack = self.walk_stack(tag)?;
        while let Some((id, node)) = stack.pop() {
            if let Some(item) = node.item() {
                if item.tag() < tag {
                    return Ok(Some(item.clone()));
                }
                continue;
            }
            let upto = if id.contains(tag) {
                id.select_branch(tag)
            } else {
                16
            };
            for branch in (0..upto).rev() {
                if !node.is_empty_branch(branch) {
                    let child_hash = *node.child_hash(branch);
                    let child_id = id.child(branch);
                    let child = self.fetch(&child_id, &child_hash, None)?;
                    if let Some(item) = self.first_below(child_id, child, true)? {
                        return Ok(Some(item));
                    }
                }
            }
        }
        Ok(None)
    }

    // ---- dirty-node flushing --------------------------------------------

    /// Starts recording rebuilt nodes for flushing and opens a new
    /// generation. Returns the new sequence.
    pub fn arm_dirty(&mut self) -> u32 {
        self.dirty = Some(HashMap::new());
        self.seq += 1;
        self.seq
    }

    /// Stops recording and hands back everything collected since
    /// [`SHAMap::arm_dirty`].
    pub fn disarm_dirty(&mut self) -> Option<DirtyMap> {
        self.dirty.take()
    }
}

/// Writes up to `limit` dirty nodes into the object store in PREFIXED form,
/// removing them from `dirty`. Returns how many were flushed; callers loop
/// until it reports zero.
pub fn flush_dirty(
    dirty: &mut DirtyMap,
    limit: usize,
    object_type: ObjectType,
    ledger_seq: u32,
    store: &HashedObjectStore,
) -> Result<usize, SHAMapError> {
    let mut flushed = 0;
    let batch: Vec<NodeId> = dirty.keys().take(limit).copied().collect();
    for id in batch {
        if let Some(node) = dirty.remove(&id) {
            let bytes = node.serialize(NodeFormat::Prefixed);
            debug_assert_eq!(content_hash(&bytes), *node.hash());
            store.put(object_type, ledger_seq, bytes, *node.hash())?;
            flushed += 1;
        }
    }
    Ok(flushed)
}
