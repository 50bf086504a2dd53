//! Merkle Search Tree operations

use super::cursor::{CursorPosition, MstCursor};
use super::node::{NodeData, NodeEntry};
use super::util;
use crate::codec;
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Verified write operation with required prev fields
///
/// Used when replaying a diff or a firehose event: every update and delete
/// carries the CID it expects to replace, validated against tree state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedWriteOp {
    /// Create new record (verified not to exist)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Update existing record (with verified prev CID)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: IpldCid,
        /// Previous CID (required, validated)
        prev: IpldCid,
    },

    /// Delete record (with verified current CID)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Previous CID (required, validated)
        prev: IpldCid,
    },
}

/// A Merkle Search Tree node handle
///
/// `Mst` is a handle on one node plus the storage it loads children from.
/// Mutating operations never touch the receiver: they hand back a new
/// handle whose changed nodes are fresh and whose untouched subtrees are
/// the same handles as before. Content addressing makes that sharing safe;
/// a serialized node can never change under its CID.
///
/// Each handle carries its slot list lazily (`None` until first read from
/// storage) and caches its own CID, invalidated by the `stale` flag
/// whenever the slots were edited. Computing the CID of a dirty node
/// serializes its dirty descendants first, since child CIDs are part of
/// the node bytes.
///
/// Shape is not chosen by this code at all: a key's SHA-256 hash fixes its
/// layer, every node holds keys of a single layer, and child pointers step
/// down exactly one layer. Whatever order keys arrive in, the same mapping
/// settles into the same nodes and therefore the same root CID.
#[derive(Debug, Clone)]
pub struct Mst<S: BlockStore> {
    /// Where node blocks come from and go to
    storage: Arc<S>,

    /// Slot list; `None` until loaded, `Some(vec![])` for an empty node
    slots: Arc<RwLock<Option<Vec<NodeEntry<S>>>>>,

    /// Cached CID of this node, meaningful only while `stale` is false
    cached_cid: Arc<RwLock<IpldCid>>,

    /// Set when `slots` no longer matches `cached_cid`
    stale: Arc<RwLock<bool>>,

    /// Layer hint; `None` means derive it from the contents
    layer: Option<usize>,
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Empty tree
    ///
    /// Its root CID is the canonical empty-node CID until keys are added.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            slots: Arc::new(RwLock::new(Some(Vec::new()))),
            cached_cid: Arc::new(RwLock::new(IpldCid::default())),
            stale: Arc::new(RwLock::new(true)),
            layer: Some(0),
        }
    }

    /// Node built from a ready slot list, CID computed up front
    pub(crate) async fn create(
        storage: Arc<S>,
        slots: Vec<NodeEntry<S>>,
        layer: Option<usize>,
    ) -> Result<Self> {
        let cid = util::node_cid(&slots).await?;

        Ok(Self {
            storage,
            slots: Arc::new(RwLock::new(Some(slots))),
            cached_cid: Arc::new(RwLock::new(cid)),
            stale: Arc::new(RwLock::new(false)),
            layer,
        })
    }

    /// Handle on a stored node, loaded lazily
    ///
    /// Nothing is read until the slots are first needed. For an eager,
    /// checked read use [`Mst::load_verified`].
    pub fn load(storage: Arc<S>, cid: IpldCid, layer: Option<usize>) -> Self {
        Self {
            storage,
            slots: Arc::new(RwLock::new(None)),
            cached_cid: Arc::new(RwLock::new(cid)),
            stale: Arc::new(RwLock::new(false)),
            layer,
        }
    }

    /// Load a stored tree and check its structural invariants
    ///
    /// Walks everything reachable from `cid`, confirming keys are valid and
    /// strictly ascending in-order and that every node's keys sit on that
    /// node's layer. Violations fail `MalformedTree`; a missing node block
    /// fails `NotFound`.
    pub async fn load_verified(storage: Arc<S>, cid: IpldCid) -> Result<Self> {
        let tree = Self::load(storage, cid, None);
        tree.verify_structure().await?;
        Ok(tree)
    }

    /// Full structural check; returns the leaf count
    pub async fn verify_structure(&self) -> Result<usize> {
        let mut prev_key: Option<SmolStr> = None;
        let mut seen = 0;
        self.check_node(None, &mut prev_key, &mut seen).await?;
        Ok(seen)
    }

    fn check_node<'a>(
        &'a self,
        expected_layer: Option<usize>,
        prev_key: &'a mut Option<SmolStr>,
        seen: &'a mut usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let slots = self.node_entries().await?;

            // A node's layer comes from its first leaf; a leafless bridge
            // node inherits the parent's expectation
            let leaf_layer = slots.iter().find_map(|s| s.key().map(util::layer_for_key));
            let layer = match (leaf_layer, expected_layer) {
                (Some(found), Some(expected)) if found != expected => {
                    return Err(RepoError::malformed_tree(format!(
                        "node at layer {expected} holds a key of layer {found}"
                    )));
                }
                (Some(found), _) => Some(found),
                (None, inherited) => inherited,
            };

            for slot in &slots {
                match slot {
                    NodeEntry::Leaf { key, .. } => {
                        util::validate_key(key)?;

                        if let Some(layer) = layer {
                            let key_layer = util::layer_for_key(key);
                            if key_layer != layer {
                                return Err(RepoError::malformed_tree(format!(
                                    "key {key} has layer {key_layer}, node is at layer {layer}"
                                )));
                            }
                        }

                        if let Some(prev) = prev_key.as_ref() {
                            if key.as_str() <= prev.as_str() {
                                return Err(RepoError::malformed_tree(format!(
                                    "keys out of order: {key} after {prev}"
                                )));
                            }
                        }
                        *prev_key = Some(key.clone());
                        *seen += 1;
                    }
                    NodeEntry::Child(child) => {
                        let below = match layer {
                            Some(0) => {
                                return Err(RepoError::malformed_tree(
                                    "child pointer below layer 0",
                                ));
                            }
                            Some(l) => Some(l - 1),
                            None => None,
                        };

                        if child.node_entries().await?.is_empty() {
                            return Err(RepoError::malformed_tree(
                                "empty node reachable below the root",
                            ));
                        }

                        child.check_node(below, prev_key, seen).await?;
                    }
                }
            }

            Ok(())
        })
    }

    /// Fetch (and cache) this node's slot list
    pub(crate) async fn node_entries(&self) -> Result<Vec<NodeEntry<S>>> {
        if let Some(cached) = self.slots.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let cid = *self.cached_cid.read().await;
        let raw = self
            .storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::not_found("MST node", &cid))?;
        let wire: NodeData = codec::decode(&raw)?;
        let slots = util::decode_entries(self.storage.clone(), &wire, self.layer)?;

        *self.slots.write().await = Some(slots.clone());
        Ok(slots)
    }

    /// This node's CID, reserializing first if the slots were edited
    ///
    /// Computing the CID does not persist anything; [`Mst::persist`] and
    /// [`Mst::collect_blocks`] handle storage.
    pub async fn root(&self) -> Result<IpldCid> {
        if !*self.stale.read().await {
            return Ok(*self.cached_cid.read().await);
        }

        let slots = self.node_entries().await?;
        let cid = util::node_cid(&slots).await?;

        *self.cached_cid.write().await = cid;
        *self.stale.write().await = false;
        Ok(cid)
    }

    /// Shared handle on the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Layer of this node
    ///
    /// Taken from the hint when present, else from the first leaf; a
    /// leafless bridge node sits one above its first child.
    pub(crate) fn node_layer<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(layer) = self.layer {
                return Ok(layer);
            }

            let slots = self.node_entries().await?;
            if let Some(found) = slots.iter().find_map(|s| s.key().map(util::layer_for_key)) {
                return Ok(found);
            }
            for slot in &slots {
                if let NodeEntry::Child(child) = slot {
                    return Ok(child.node_layer().await? + 1);
                }
            }
            Ok(0)
        })
    }

    /// Index of the first leaf whose key is >= `key`
    ///
    /// `slots.len()` when every leaf sorts below it.
    fn leaf_search(slots: &[NodeEntry<S>], key: &str) -> usize {
        slots
            .iter()
            .position(|slot| matches!(slot, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
            .unwrap_or(slots.len())
    }

    /// New handle over the same storage with an edited copy of the slots
    ///
    /// The result gets its own CID cell, marked stale, so recomputing it
    /// later can never clobber the cache of the version it came from.
    async fn edit<F>(&self, apply: F) -> Result<Mst<S>>
    where
        F: FnOnce(&mut Vec<NodeEntry<S>>) + Send,
    {
        let mut slots = self.node_entries().await?;
        apply(&mut slots);
        self.with_slots(slots).await
    }

    async fn with_slots(&self, slots: Vec<NodeEntry<S>>) -> Result<Mst<S>> {
        Ok(Self {
            storage: self.storage.clone(),
            slots: Arc::new(RwLock::new(Some(slots))),
            cached_cid: Arc::new(RwLock::new(IpldCid::default())),
            stale: Arc::new(RwLock::new(true)),
            layer: self.layer,
        })
    }

    /// Look up a key
    pub fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IpldCid>>> + Send + 'a>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let slots = self.node_entries().await?;
            let at = Self::leaf_search(&slots, key);

            if let Some(NodeEntry::Leaf { key: found, value }) = slots.get(at) {
                if found.as_str() == key {
                    return Ok(Some(*value));
                }
            }

            // Anything below this node's layer lives in the child just
            // left of where the key would sit
            match at.checked_sub(1).map(|i| &slots[i]) {
                Some(NodeEntry::Child(child)) => child.get(key).await,
                _ => Ok(None),
            }
        })
    }

    /// Whether a key is present
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Number of stored keys
    pub fn count<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut n = 0;
            for slot in self.node_entries().await? {
                n += match slot {
                    NodeEntry::Leaf { .. } => 1,
                    NodeEntry::Child(child) => child.count().await?,
                };
            }
            Ok(n)
        })
    }

    /// Insert or replace a key (returns the new tree)
    ///
    /// Re-adding a key with the value it already has changes nothing at the
    /// content level; the root CID comes out identical.
    pub fn add<'a>(
        &'a self,
        key: &'a str,
        value: IpldCid,
    ) -> Pin<Box<dyn Future<Output = Result<Mst<S>>> + Send + 'a>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let target = util::layer_for_key(key);
            let here = self.node_layer().await?;

            if target > here {
                self.grow_above(key, value, target - here).await
            } else if target < here {
                self.insert_below(key, value).await
            } else {
                self.insert_here(key, value).await
            }
        })
    }

    /// The key's layer matches this node: it lands in this slot list
    async fn insert_here(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        let slots = self.node_entries().await?;
        let at = Self::leaf_search(&slots, key);

        // Replacement keeps the slot and swaps the value
        if let Some(NodeEntry::Leaf { key: found, .. }) = slots.get(at) {
            if found.as_str() == key {
                return self
                    .edit(|s| {
                        s[at] = NodeEntry::Leaf {
                            key: SmolStr::new(key),
                            value,
                        };
                    })
                    .await;
            }
        }

        let leaf = NodeEntry::Leaf {
            key: SmolStr::new(key),
            value,
        };

        match at.checked_sub(1).map(|i| &slots[i]) {
            Some(NodeEntry::Child(straddler)) => {
                // The child left of the slot spans the new key; its halves
                // become the new leaf's neighbours
                let (below, above) = straddler.split_at(key).await?;
                self.edit(move |s| {
                    let mut patch = Vec::with_capacity(3);
                    if let Some(t) = below {
                        patch.push(NodeEntry::Child(t));
                    }
                    patch.push(leaf);
                    if let Some(t) = above {
                        patch.push(NodeEntry::Child(t));
                    }
                    s.splice(at - 1..at, patch);
                })
                .await
            }
            _ => self.edit(move |s| s.insert(at, leaf)).await,
        }
    }

    /// The key belongs some layers down: descend, opening a child if needed
    async fn insert_below(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        let slots = self.node_entries().await?;
        let at = Self::leaf_search(&slots, key);

        match at.checked_sub(1).map(|i| &slots[i]) {
            Some(NodeEntry::Child(child)) => {
                let grown = child.add(key, value).await?;
                self.edit(move |s| s[at - 1] = NodeEntry::Child(grown)).await
            }
            _ => {
                let below = self.node_layer().await?.saturating_sub(1);
                let child = Mst::create(self.storage.clone(), Vec::new(), Some(below)).await?;
                let child = child.add(key, value).await?;
                self.edit(move |s| s.insert(at, NodeEntry::Child(child)))
                    .await
            }
        }
    }

    /// The key's layer is above this node: a new root forms around it
    async fn grow_above(&self, key: &str, value: IpldCid, levels: usize) -> Result<Mst<S>> {
        let (mut below, mut above) = self.split_at(key).await?;

        // Bridge any skipped layers so child pointers still step down one
        // layer at a time
        for _ in 1..levels {
            below = match below {
                Some(t) => Some(t.lift().await?),
                None => None,
            };
            above = match above {
                Some(t) => Some(t.lift().await?),
                None => None,
            };
        }

        let mut slots = Vec::with_capacity(3);
        if let Some(t) = below {
            slots.push(NodeEntry::Child(t));
        }
        slots.push(NodeEntry::Leaf {
            key: SmolStr::new(key),
            value,
        });
        if let Some(t) = above {
            slots.push(NodeEntry::Child(t));
        }

        Mst::create(self.storage.clone(), slots, Some(util::layer_for_key(key))).await
    }

    /// Replace the value of a key that must already exist
    pub async fn update(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;

        match self.get(key).await? {
            Some(_) => self.add(key, value).await,
            None => Err(RepoError::not_found("key", key)),
        }
    }

    /// Remove a key (returns the new tree)
    ///
    /// Idempotent: removing a key that isn't there hands back an unchanged
    /// tree.
    pub fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Mst<S>>> + Send + 'a>> {
        Box::pin(async move {
            util::validate_key(key)?;

            if self.get(key).await?.is_none() {
                return Ok(self.clone());
            }

            self.remove_known(key).await?.collapse_root().await
        })
    }

    /// Remove a key known to be present somewhere under this node
    fn remove_known<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Mst<S>>> + Send + 'a>> {
        Box::pin(async move {
            let slots = self.node_entries().await?;
            let at = Self::leaf_search(&slots, key);

            let here = matches!(slots.get(at), Some(NodeEntry::Leaf { key: k, .. }) if k.as_str() == key);
            if !here {
                // The key sits in the child left of its slot position
                let Some(NodeEntry::Child(child)) = at.checked_sub(1).map(|i| &slots[i]) else {
                    return Err(RepoError::not_found("key", key));
                };
                let shrunk = child.remove_known(key).await?;

                return if shrunk.node_entries().await?.is_empty() {
                    // An emptied child pointer is dropped, not kept as null
                    self.edit(|s| {
                        s.remove(at - 1);
                    })
                    .await
                } else {
                    self.edit(move |s| s[at - 1] = NodeEntry::Child(shrunk)).await
                };
            }

            // When children flank the leaf, removing it leaves them covering
            // one open interval at one layer, so they fuse into a single node
            if let (Some(NodeEntry::Child(lhs)), Some(NodeEntry::Child(rhs))) =
                (at.checked_sub(1).map(|i| &slots[i]), slots.get(at + 1))
            {
                let fused = lhs.join(rhs).await?;
                return self
                    .edit(move |s| {
                        s.splice(at - 1..=at + 1, [NodeEntry::Child(fused)]);
                    })
                    .await;
            }

            self.edit(|s| {
                s.remove(at);
            })
            .await
        })
    }

    /// Drop single-pointer layers off the top
    ///
    /// After deletions the root can degenerate into a lone child pointer;
    /// promoting it (repeatedly) lands the root on the layer of the highest
    /// surviving key, which the canonical form requires.
    fn collapse_root(self) -> Pin<Box<dyn Future<Output = Result<Mst<S>>> + Send>> {
        Box::pin(async move {
            let slots = self.node_entries().await?;
            match slots.as_slice() {
                [NodeEntry::Child(only)] => only.clone().collapse_root().await,
                _ => Ok(self),
            }
        })
    }

    /// Cut this subtree in two around `key`
    ///
    /// Everything strictly below the key goes left, everything at or above
    /// it goes right; a child pointer spanning the cut is split recursively
    /// and its halves handed to each side. Empty sides come back as `None`.
    pub(crate) fn split_at<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(Option<Mst<S>>, Option<Mst<S>>)>> + Send + 'a>> {
        Box::pin(async move {
            let slots = self.node_entries().await?;
            let cut = Self::leaf_search(&slots, key);

            let mut lower = slots[..cut].to_vec();
            let mut upper = slots[cut..].to_vec();

            if let Some(NodeEntry::Child(boundary)) = lower.last() {
                let (below, above) = boundary.split_at(key).await?;
                lower.pop();
                if let Some(t) = below {
                    lower.push(NodeEntry::Child(t));
                }
                if let Some(t) = above {
                    upper.insert(0, NodeEntry::Child(t));
                }
            }

            let lower = match lower.is_empty() {
                true => None,
                false => Some(self.with_slots(lower).await?),
            };
            let upper = match upper.is_empty() {
                true => None,
                false => Some(self.with_slots(upper).await?),
            };
            Ok((lower, upper))
        })
    }

    /// Concatenate a neighbouring subtree onto this one
    ///
    /// Every key in `right` must sort after every key here, and both nodes
    /// must sit on the same layer. Where the seam has a child pointer on
    /// each side, those children are themselves neighbours one layer down
    /// and fuse first.
    pub(crate) fn join<'a>(
        &'a self,
        right: &'a Mst<S>,
    ) -> Pin<Box<dyn Future<Output = Result<Mst<S>>> + Send + 'a>> {
        Box::pin(async move {
            if self.node_layer().await? != right.node_layer().await? {
                return Err(RepoError::malformed_tree(
                    "adjacent nodes on different layers cannot fuse",
                ));
            }

            let mut slots = self.node_entries().await?;
            let mut rest = right.node_entries().await?;

            if let (Some(NodeEntry::Child(lhs)), Some(NodeEntry::Child(rhs))) =
                (slots.last(), rest.first())
            {
                let fused = lhs.join(rhs).await?;
                slots.pop();
                rest.remove(0);
                slots.push(NodeEntry::Child(fused));
            }

            slots.append(&mut rest);
            self.with_slots(slots).await
        })
    }

    /// Wrap this node in a parent one layer up
    pub(crate) async fn lift(self) -> Result<Mst<S>> {
        let layer = self.node_layer().await?;
        let storage = self.storage.clone();
        Mst::create(storage, vec![NodeEntry::Child(self)], Some(layer + 1)).await
    }

    /// All key/value pairs in ascending key order
    pub fn leaves<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(SmolStr, IpldCid)>>> + Send + 'a>> {
        Box::pin(async move {
            let mut out = Vec::new();
            let mut cursor = MstCursor::new(self.clone());
            cursor.advance().await?;

            loop {
                match cursor.current() {
                    CursorPosition::Leaf { key, cid } => {
                        out.push((key.clone(), *cid));
                        cursor.advance().await?;
                    }
                    CursorPosition::Subtree { .. } => cursor.advance().await?,
                    CursorPosition::End => break,
                }
            }

            Ok(out)
        })
    }

    /// All keys in ascending order
    pub async fn keys(&self) -> Result<Vec<SmolStr>> {
        Ok(self.leaves().await?.into_iter().map(|(k, _)| k).collect())
    }

    /// Bulk-build a tree from key/value pairs
    ///
    /// Later duplicates win, as with repeated insertion, and the root CID
    /// is the same one sequential `add` calls would reach in any order.
    pub async fn from_entries(
        storage: Arc<S>,
        entries: impl IntoIterator<Item = (SmolStr, IpldCid)>,
    ) -> Result<Mst<S>> {
        let mut pairs: BTreeMap<SmolStr, IpldCid> = BTreeMap::new();
        for (key, cid) in entries {
            util::validate_key(&key)?;
            pairs.insert(key, cid);
        }

        let mut tree = Mst::new(storage);
        for (key, cid) in pairs {
            tree = tree.add(&key, cid).await?;
        }
        Ok(tree)
    }

    /// Apply verified write operations in order (returns the new tree)
    ///
    /// - Create fails `AlreadyExists` when the key is present
    /// - Update and Delete fail `NotFound` for absent keys and
    ///   `InvalidSwap` when the tree's current CID isn't the expected prev
    pub async fn batch(&self, ops: &[VerifiedWriteOp]) -> Result<Mst<S>> {
        let mut tree = self.clone();

        for op in ops {
            tree = match op {
                VerifiedWriteOp::Create { key, cid } => {
                    if tree.get(key).await?.is_some() {
                        return Err(RepoError::already_exists("key", key));
                    }
                    tree.add(key, *cid).await?
                }

                VerifiedWriteOp::Update { key, cid, prev } => {
                    let current = tree
                        .get(key)
                        .await?
                        .ok_or_else(|| RepoError::not_found("key", key.as_str()))?;
                    if &current != prev {
                        return Err(RepoError::invalid_swap(format!(
                            "update of {key}: expected {prev}, found {current}"
                        )));
                    }
                    tree.add(key, *cid).await?
                }

                VerifiedWriteOp::Delete { key, prev } => {
                    let current = tree
                        .get(key)
                        .await?
                        .ok_or_else(|| RepoError::not_found("key", key.as_str()))?;
                    if &current != prev {
                        return Err(RepoError::invalid_swap(format!(
                            "delete of {key}: expected {prev}, found {current}"
                        )));
                    }
                    tree.delete(key).await?
                }
            };
        }

        Ok(tree)
    }

    /// Gather every block missing from storage, bottom-up
    ///
    /// Subtrees whose node block is already stored are skipped whole, so a
    /// mutation pays only for its changed path. Returns the root CID and a
    /// CID-to-bytes map of what still needs writing.
    pub fn collect_blocks<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(IpldCid, BTreeMap<IpldCid, Bytes>)>> + Send + 'a>>
    {
        Box::pin(async move {
            let cid = self.root().await?;
            let mut missing = BTreeMap::new();

            if self.storage.has(&cid).await? {
                return Ok((cid, missing));
            }

            let slots = self.node_entries().await?;
            let wire = util::encode_entries(&slots).await?;
            missing.insert(cid, Bytes::from(codec::encode(&wire)?));

            for slot in &slots {
                if let NodeEntry::Child(child) = slot {
                    let (_, below) = child.collect_blocks().await?;
                    missing.extend(below);
                }
            }

            Ok((cid, missing))
        })
    }

    /// Write every missing block to storage; returns the root CID
    pub async fn persist(&self) -> Result<IpldCid> {
        let (root, missing) = self.collect_blocks().await?;

        if !missing.is_empty() {
            self.storage.put_many(missing).await?;
        }

        Ok(root)
    }

    /// CIDs along the lookup path of a key
    ///
    /// The descent a `get` would take, starting at this node's CID. A
    /// present key contributes its record CID as the final element; for an
    /// absent key the path stops at the node that would hold it, which is
    /// exactly the absence proof.
    pub fn proof_path<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<IpldCid>>> + Send + 'a>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let mut path = vec![self.root().await?];
            let slots = self.node_entries().await?;
            let at = Self::leaf_search(&slots, key);

            if let Some(NodeEntry::Leaf { key: found, value }) = slots.get(at) {
                if found.as_str() == key {
                    path.push(*value);
                    return Ok(path);
                }
            }

            if let Some(NodeEntry::Child(child)) = at.checked_sub(1).map(|i| &slots[i]) {
                path.extend(child.proof_path(key).await?);
            }

            Ok(path)
        })
    }

    /// Serialized node blocks along the lookup path of a key
    ///
    /// Same descent as [`Mst::proof_path`], collecting node bytes into
    /// `out`; used to assemble event block bundles.
    pub fn path_blocks<'a>(
        &'a self,
        key: &'a str,
        out: &'a mut BTreeMap<IpldCid, Bytes>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let slots = self.node_entries().await?;
            let wire = util::encode_entries(&slots).await?;
            out.insert(self.root().await?, Bytes::from(codec::encode(&wire)?));

            let at = Self::leaf_search(&slots, key);
            if let Some(NodeEntry::Leaf { key: found, .. }) = slots.get(at) {
                if found.as_str() == key {
                    return Ok(());
                }
            }

            match at.checked_sub(1).map(|i| &slots[i]) {
                Some(NodeEntry::Child(child)) => child.path_blocks(key, out).await,
                _ => Ok(()),
            }
        })
    }

    /// Stream every node and record block under this tree into a CAR writer
    ///
    /// Node blocks are written during the walk; record blocks are fetched
    /// in one batch afterwards. Nothing is held in memory beyond the CID
    /// list.
    pub async fn stream_to_car<W: tokio::io::AsyncWrite + Send + Unpin>(
        &self,
        writer: &mut iroh_car::CarWriter<W>,
    ) -> Result<()> {
        let mut records = Vec::new();
        self.stream_nodes(writer, &mut records).await?;

        for (cid, block) in records.iter().zip(self.storage.get_many(&records).await?) {
            if let Some(data) = block {
                writer.write(*cid, &data).await.map_err(RepoError::car)?;
            }
        }

        Ok(())
    }

    fn stream_nodes<'a, W: tokio::io::AsyncWrite + Send + Unpin>(
        &'a self,
        writer: &'a mut iroh_car::CarWriter<W>,
        records: &'a mut Vec<IpldCid>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let cid = self.root().await?;
            let raw = self
                .storage
                .get(&cid)
                .await?
                .ok_or_else(|| RepoError::not_found("MST node", &cid))?;
            writer.write(cid, &raw).await.map_err(RepoError::car)?;

            for slot in self.node_entries().await? {
                match slot {
                    NodeEntry::Leaf { value, .. } => records.push(value),
                    NodeEntry::Child(child) => child.stream_nodes(writer, records).await?,
                }
            }

            Ok(())
        })
    }
}

/// Abbreviate a CID for log and debug output
pub fn short_cid(cid: &IpldCid) -> String {
    let s = cid.to_string();
    match s.len() > 12 {
        true => format!("…{}", &s[s.len() - 8..]),
        false => s,
    }
}
