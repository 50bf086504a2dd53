//! Tree-to-tree diffing
//!
//! Two cursors walk the old and new tree side by side. Whenever both stand
//! on subtrees with the same CID the whole branch is provably identical and
//! gets skipped, so the walk costs in proportion to what actually changed,
//! not to how big the trees are.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use super::cursor::{CursorPosition, MstCursor};
use super::tree::{Mst, VerifiedWriteOp};
use super::util::encode_entries;
use crate::codec;
use crate::error::Result;
use crate::event::{RepoOp, WriteAction};
use crate::mst::NodeEntry;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

/// What separates one tree state from another
///
/// Key-level changes come in three buckets, and alongside them the diff
/// keeps the block-level ledger a commit needs: which record CIDs became
/// referenced or unreferenced, and which node blocks appeared or fell out
/// of use along the rewritten paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MstDiff {
    /// Keys present only in the new tree (key, new CID)
    pub creates: Vec<(SmolStr, IpldCid)>,

    /// Keys in both trees whose value changed (key, new CID, old CID)
    pub updates: Vec<(SmolStr, IpldCid, IpldCid)>,

    /// Keys present only in the old tree (key, old CID)
    pub deletes: Vec<(SmolStr, IpldCid)>,

    /// Record CIDs the new tree references and the old one didn't
    pub new_leaf_cids: Vec<IpldCid>,

    /// Record CIDs the new tree dropped
    ///
    /// Garbage-collection candidates, if nothing else points at them.
    pub removed_cids: Vec<IpldCid>,

    /// Node blocks the new tree introduced along changed paths
    pub new_mst_blocks: BTreeMap<IpldCid, Bytes>,

    /// Node blocks the new tree no longer reaches
    pub removed_mst_blocks: Vec<IpldCid>,
}

impl MstDiff {
    /// Diff with nothing in it
    pub fn new() -> Self {
        Self {
            creates: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            new_leaf_cids: Vec::new(),
            removed_cids: Vec::new(),
            new_mst_blocks: BTreeMap::new(),
            removed_mst_blocks: Vec::new(),
        }
    }

    /// True when no key changed
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total changed keys across all three buckets
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    fn note_create(&mut self, key: SmolStr, cid: IpldCid) {
        self.creates.push((key, cid));
        self.new_leaf_cids.push(cid);
    }

    fn note_update(&mut self, key: SmolStr, new: IpldCid, old: IpldCid) {
        self.updates.push((key, new, old));
        self.new_leaf_cids.push(new);
        self.removed_cids.push(old);
    }

    fn note_delete(&mut self, key: SmolStr, cid: IpldCid) {
        self.deletes.push((key, cid));
        self.removed_cids.push(cid);
    }

    /// Express the diff as verified write operations
    ///
    /// Feeding these to [`Mst::batch`] replays the transition; updates and
    /// deletes carry the prev CIDs the walk observed.
    pub fn to_verified_ops(&self) -> Vec<VerifiedWriteOp> {
        let creates = self.creates.iter().map(|(key, cid)| VerifiedWriteOp::Create {
            key: key.clone(),
            cid: *cid,
        });
        let updates = self
            .updates
            .iter()
            .map(|(key, cid, prev)| VerifiedWriteOp::Update {
                key: key.clone(),
                cid: *cid,
                prev: *prev,
            });
        let deletes = self.deletes.iter().map(|(key, prev)| VerifiedWriteOp::Delete {
            key: key.clone(),
            prev: *prev,
        });

        creates.chain(updates).chain(deletes).collect()
    }

    /// Express the diff as event operation descriptions
    ///
    /// Creates first, then updates, then deletes.
    pub fn to_repo_ops(&self) -> Vec<RepoOp> {
        let creates = self.creates.iter().map(|(key, cid)| RepoOp {
            action: WriteAction::Create,
            path: key.clone(),
            cid: Some(*cid),
            prev: None,
        });
        let updates = self.updates.iter().map(|(key, new, old)| RepoOp {
            action: WriteAction::Update,
            path: key.clone(),
            cid: Some(*new),
            prev: Some(*old),
        });
        let deletes = self.deletes.iter().map(|(key, old)| RepoOp {
            action: WriteAction::Delete,
            path: key.clone(),
            cid: None,
            prev: Some(*old),
        });

        creates.chain(updates).chain(deletes).collect()
    }

    /// Pull the newly referenced record blocks out of storage
    ///
    /// Handy when a commit or event bundle needs to carry the record data
    /// itself, not just the CIDs.
    pub async fn fetch_new_blocks<S: BlockStore>(
        &self,
        storage: &S,
    ) -> Result<BTreeMap<IpldCid, Bytes>> {
        let mut out = BTreeMap::new();
        for cid in &self.new_leaf_cids {
            if let Some(block) = storage.get(cid).await? {
                out.insert(*cid, block);
            }
        }
        Ok(out)
    }
}

impl Default for MstDiff {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Changes that turn `self` into `other`
    ///
    /// Creates are keys only `other` has, deletes are keys only `self` has,
    /// updates are shared keys whose CIDs differ. Branches with matching
    /// CIDs are skipped without being entered.
    pub async fn diff(&self, other: &Mst<S>) -> Result<MstDiff> {
        let mut out = MstDiff::new();
        walk_diff(self, other, &mut out).await?;

        // A node listed as both introduced and dropped was merely passed
        // through under two different parents; it changed on neither side
        let unchanged: Vec<IpldCid> = out
            .removed_mst_blocks
            .iter()
            .filter(|cid| out.new_mst_blocks.contains_key(cid))
            .copied()
            .collect();
        for cid in &unchanged {
            out.new_mst_blocks.remove(cid);
        }
        out.removed_mst_blocks.retain(|cid| !unchanged.contains(cid));

        Ok(out)
    }

    /// Diff against an empty tree: everything here becomes a delete
    pub async fn diff_to_empty(&self) -> Result<MstDiff> {
        let mut out = MstDiff::new();
        absorb_removed(self, &mut out).await?;
        Ok(out)
    }
}

/// Run both cursors from the roots and classify every divergence
fn walk_diff<'a, S: BlockStore + Sync + 'static>(
    old_root: &'a Mst<S>,
    new_root: &'a Mst<S>,
    out: &'a mut MstDiff,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if old_root.root().await? == new_root.root().await? {
            return Ok(());
        }

        let mut old = MstCursor::new(old_root.clone());
        let mut new = MstCursor::new(new_root.clone());

        loop {
            // Positions are cloned out so either cursor can move freely
            // while the other's position is still being examined
            match (old.current().clone(), new.current().clone()) {
                (CursorPosition::End, CursorPosition::End) => return Ok(()),

                // One side is exhausted: everything left on the other side
                // belongs to a single bucket
                (CursorPosition::End, CursorPosition::Leaf { key, cid }) => {
                    out.note_create(key, cid);
                    new.advance().await?;
                }
                (CursorPosition::End, CursorPosition::Subtree { mst }) => {
                    absorb_created(&mst, out).await?;
                    new.skip_subtree().await?;
                }
                (CursorPosition::Leaf { key, cid }, CursorPosition::End) => {
                    out.note_delete(key, cid);
                    old.advance().await?;
                }
                (CursorPosition::Subtree { mst }, CursorPosition::End) => {
                    absorb_removed(&mst, out).await?;
                    old.skip_subtree().await?;
                }

                // Two leaves: plain key comparison decides which side lags,
                // regardless of what layer either cursor is walking
                (
                    CursorPosition::Leaf {
                        key: old_key,
                        cid: old_cid,
                    },
                    CursorPosition::Leaf {
                        key: new_key,
                        cid: new_cid,
                    },
                ) => match old_key.cmp(&new_key) {
                    Ordering::Equal => {
                        if old_cid != new_cid {
                            out.note_update(old_key, new_cid, old_cid);
                        }
                        old.advance().await?;
                        new.advance().await?;
                    }
                    Ordering::Less => {
                        out.note_delete(old_key, old_cid);
                        old.advance().await?;
                    }
                    Ordering::Greater => {
                        out.note_create(new_key, new_cid);
                        new.advance().await?;
                    }
                },

                // A subtree on at least one side: line the walks up by the
                // depth each cursor is at before comparing further
                (old_pos, new_pos) => {
                    let old_depth = old.layer().await?;
                    let new_depth = new.layer().await?;

                    match old_depth.cmp(&new_depth) {
                        Ordering::Equal => match (old_pos, new_pos) {
                            (
                                CursorPosition::Subtree { mst: lhs },
                                CursorPosition::Subtree { mst: rhs },
                            ) => {
                                if lhs.root().await? == rhs.root().await? {
                                    // Identical branch; nothing inside can
                                    // differ
                                    old.skip_subtree().await?;
                                    new.skip_subtree().await?;
                                } else {
                                    record_new_node(&rhs, out).await?;
                                    out.removed_mst_blocks.push(lhs.root().await?);
                                    old.advance().await?;
                                    new.advance().await?;
                                }
                            }
                            (_, CursorPosition::Subtree { mst }) => {
                                record_new_node(&mst, out).await?;
                                new.advance().await?;
                            }
                            (CursorPosition::Subtree { mst }, _) => {
                                out.removed_mst_blocks.push(mst.root().await?);
                                old.advance().await?;
                            }
                            _ => {}
                        },

                        // Old cursor is higher up: bring it down, or feed
                        // the new side until depths meet
                        Ordering::Greater => match old_pos {
                            CursorPosition::Subtree { mst } => {
                                out.removed_mst_blocks.push(mst.root().await?);
                                old.advance().await?;
                            }
                            _ => {
                                if let CursorPosition::Subtree { mst } = &new_pos {
                                    record_new_node(mst, out).await?;
                                }
                                new.advance().await?;
                            }
                        },

                        Ordering::Less => match new_pos {
                            CursorPosition::Subtree { mst } => {
                                record_new_node(&mst, out).await?;
                                new.advance().await?;
                            }
                            _ => {
                                if let CursorPosition::Subtree { mst } = &old_pos {
                                    out.removed_mst_blocks.push(mst.root().await?);
                                }
                                old.advance().await?;
                            }
                        },
                    }
                }
            }
        }
    })
}

/// Serialize a node and list it among the introduced blocks
async fn record_new_node<S: BlockStore + Sync + 'static>(
    node: &Mst<S>,
    out: &mut MstDiff,
) -> Result<()> {
    let cid = node.root().await?;
    let slots = node.node_entries().await?;
    let wire = encode_entries(&slots).await?;
    out.new_mst_blocks.insert(cid, Bytes::from(codec::encode(&wire)?));
    Ok(())
}

/// Every leaf and node under `tree` enters the diff as created
fn absorb_created<'a, S: BlockStore + Sync + 'static>(
    tree: &'a Mst<S>,
    out: &'a mut MstDiff,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        record_new_node(tree, out).await?;

        for slot in tree.node_entries().await? {
            match slot {
                NodeEntry::Leaf { key, value } => out.note_create(key, value),
                NodeEntry::Child(child) => absorb_created(&child, out).await?,
            }
        }

        Ok(())
    })
}

/// Every leaf and node under `tree` enters the diff as removed
fn absorb_removed<'a, S: BlockStore + Sync + 'static>(
    tree: &'a Mst<S>,
    out: &'a mut MstDiff,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        out.removed_mst_blocks.push(tree.root().await?);

        for slot in tree.node_entries().await? {
            match slot {
                NodeEntry::Leaf { key, value } => out.note_delete(key, value),
                NodeEntry::Child(child) => absorb_removed(&child, out).await?,
            }
        }

        Ok(())
    })
}
