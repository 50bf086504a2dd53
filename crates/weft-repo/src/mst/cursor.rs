//! Cursor for in-order MST traversal
//!
//! A cursor snapshots the tree at construction: later writers build new
//! roots out of fresh nodes, so an in-flight traversal keeps seeing the
//! version it started from.

use super::node::NodeEntry;
use super::tree::Mst;
use crate::error::Result;
use crate::storage::BlockStore;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

/// Position within an MST traversal
#[derive(Debug, Clone)]
pub enum CursorPosition<S: BlockStore> {
    /// Standing on a leaf
    Leaf {
        /// Leaf key
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Standing on a subtree not yet entered
    Subtree {
        /// The subtree's root handle
        mst: Mst<S>,
    },

    /// Past the last entry
    End,
}

/// Walks an MST in ascending key order
///
/// `advance()` moves one step, descending into subtrees; `skip_subtree()`
/// steps over the subtree under the cursor without entering it, which is
/// what lets the diff walk discard identical branches in one move.
///
/// A fresh cursor stands on the root (a `Subtree` position); the first
/// `advance()` steps inside.
#[derive(Debug, Clone)]
pub struct MstCursor<S: BlockStore> {
    /// Descent stack: each level is (node, its slots, index into them)
    trail: Vec<(Mst<S>, Vec<NodeEntry<S>>, usize)>,

    /// Where the cursor currently stands
    at: CursorPosition<S>,
}

impl<S: BlockStore + Sync + 'static> MstCursor<S> {
    /// Cursor standing on the root of `tree`
    pub fn new(tree: Mst<S>) -> Self {
        Self {
            trail: Vec::new(),
            at: CursorPosition::Subtree { mst: tree },
        }
    }

    /// Current position, without moving
    pub fn current(&self) -> &CursorPosition<S> {
        &self.at
    }

    /// Whether the traversal is finished
    pub fn is_end(&self) -> bool {
        matches!(self.at, CursorPosition::End)
    }

    /// Key under the cursor, when standing on a leaf
    pub fn key(&self) -> Option<&str> {
        match &self.at {
            CursorPosition::Leaf { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Layer of the node the cursor is walking inside
    ///
    /// Standing on a node before entering it counts as one layer higher
    /// than walking its contents; the diff walk leans on that convention
    /// when it lines up two trees of different heights.
    pub async fn layer(&self) -> Result<usize> {
        match self.trail.last() {
            Some((inside, _, _)) => inside.node_layer().await,
            None => match &self.at {
                CursorPosition::Subtree { mst } => Ok(mst.node_layer().await? + 1),
                _ => Ok(0),
            },
        }
    }

    /// Move one step in sorted order
    ///
    /// Descends into a subtree, steps off a leaf, stays at `End`.
    pub async fn advance(&mut self) -> Result<()> {
        match &self.at {
            CursorPosition::End => Ok(()),
            CursorPosition::Leaf { .. } => self.step_over().await,
            CursorPosition::Subtree { mst } => {
                let mst = mst.clone();
                self.step_into(mst).await
            }
        }
    }

    /// Step past the subtree under the cursor without entering it
    ///
    /// On a leaf this is the same as `advance()`.
    pub async fn skip_subtree(&mut self) -> Result<()> {
        self.step_over().await
    }

    fn step_over<'a>(
        &'a mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some((_, slots, index)) = self.trail.last_mut() else {
                self.at = CursorPosition::End;
                return Ok(());
            };

            *index += 1;
            match slots.get(*index) {
                Some(NodeEntry::Leaf { key, value }) => {
                    self.at = CursorPosition::Leaf {
                        key: key.clone(),
                        cid: *value,
                    };
                    Ok(())
                }
                Some(NodeEntry::Child(child)) => {
                    self.at = CursorPosition::Subtree { mst: child.clone() };
                    Ok(())
                }
                None => {
                    // This level is exhausted; resume in the parent
                    self.trail.pop();
                    self.step_over().await
                }
            }
        })
    }

    async fn step_into(&mut self, mst: Mst<S>) -> Result<()> {
        let slots = mst.node_entries().await?;

        let Some(first) = slots.first() else {
            // Nothing inside (only legal for an empty root)
            return self.step_over().await;
        };

        self.at = match first {
            NodeEntry::Leaf { key, value } => CursorPosition::Leaf {
                key: key.clone(),
                cid: *value,
            },
            NodeEntry::Child(child) => CursorPosition::Subtree { mst: child.clone() },
        };
        self.trail.push((mst, slots, 0));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBlockStore;
    use crate::{DAG_CBOR_CID_CODEC, SHA2_256_MH_CODE};
    use std::sync::Arc;

    fn test_cid(n: u8) -> IpldCid {
        let data = vec![n; 32];
        let mh = multihash::Multihash::wrap(SHA2_256_MH_CODE, &data).unwrap();
        IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    #[tokio::test]
    async fn test_cursor_empty_tree() {
        let storage = Arc::new(MemoryBlockStore::new());
        let tree = Mst::new(storage);

        let mut cursor = MstCursor::new(tree);

        assert!(matches!(cursor.current(), CursorPosition::Subtree { .. }));

        cursor.advance().await.unwrap();
        assert!(cursor.is_end());
    }

    #[tokio::test]
    async fn test_cursor_single_leaf() {
        let storage = Arc::new(MemoryBlockStore::new());
        let tree = Mst::new(storage);
        let tree = tree.add("coll/key1", test_cid(1)).await.unwrap();

        let mut cursor = MstCursor::new(tree);

        assert!(matches!(cursor.current(), CursorPosition::Subtree { .. }));

        cursor.advance().await.unwrap();
        assert_eq!(cursor.key(), Some("coll/key1"));

        cursor.advance().await.unwrap();
        assert!(cursor.is_end());
    }

    #[tokio::test]
    async fn test_cursor_visits_leaves_in_order() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut tree = Mst::new(storage);
        for key in ["coll/c", "coll/a", "coll/b"] {
            tree = tree.add(key, test_cid(1)).await.unwrap();
        }

        let mut cursor = MstCursor::new(tree);
        cursor.advance().await.unwrap();

        let mut keys = Vec::new();
        while !cursor.is_end() {
            if let Some(key) = cursor.key() {
                keys.push(key.to_string());
            }
            cursor.advance().await.unwrap();
        }

        assert_eq!(keys, vec!["coll/a", "coll/b", "coll/c"]);
    }

    #[tokio::test]
    async fn test_cursor_skip_subtree() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut tree = Mst::new(storage);

        for i in 0..32u8 {
            tree = tree
                .add(&format!("coll/key{:03}", i), test_cid(i))
                .await
                .unwrap();
        }

        let mut cursor = MstCursor::new(tree);
        cursor.advance().await.unwrap();

        // Skipping every subtree still terminates, visiting only the
        // root node's direct leaves
        let mut direct_leaves = 0;
        while !cursor.is_end() {
            match cursor.current() {
                CursorPosition::Leaf { .. } => {
                    direct_leaves += 1;
                    cursor.advance().await.unwrap();
                }
                CursorPosition::Subtree { .. } => {
                    cursor.skip_subtree().await.unwrap();
                }
                CursorPosition::End => break,
            }
        }

        assert!(direct_leaves <= 32);
    }
}
