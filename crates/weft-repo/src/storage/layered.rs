//! Layered block storage
//!
//! A two-layer store that reads from a writable overlay first, then falls
//! back to a read-only base. All writes go to the overlay, so validation and
//! speculative loads never pollute the base repository storage.

use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Layered block storage with a writable overlay and read-only base
///
/// Reads check the writable layer first, then fall back to the base layer.
/// All writes go to the writable layer only.
///
/// # Use Case
///
/// Commit event validation needs to:
/// 1. Load previous MST state from existing storage (base layer)
/// 2. Materialise the blocks carried in the event (writable layer)
/// 3. Leave the base storage untouched whether validation passes or fails
///
/// Without layering, validation would have to copy all previous MST blocks
/// into temporary storage first.
#[derive(Clone)]
pub struct LayeredBlockStore<W: BlockStore, B: BlockStore> {
    writable: W,
    base: std::sync::Arc<B>,
}

impl<W: BlockStore, B: BlockStore> LayeredBlockStore<W, B> {
    /// Create a new layered storage
    ///
    /// - `writable`: top layer receiving all writes
    /// - `base`: bottom layer for fallback reads (read-only, Arc-wrapped)
    pub fn new(writable: W, base: std::sync::Arc<B>) -> Self {
        Self { writable, base }
    }

    /// Get reference to the writable layer
    pub fn writable(&self) -> &W {
        &self.writable
    }

    /// Get reference to the base layer
    pub fn base(&self) -> &std::sync::Arc<B> {
        &self.base
    }
}

impl<W: BlockStore + Sync + 'static, B: BlockStore + Sync + 'static> BlockStore
    for LayeredBlockStore<W, B>
{
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        if let Some(data) = self.writable.get(cid).await? {
            return Ok(Some(data));
        }
        self.base.get(cid).await
    }

    async fn put(&self, cid: &IpldCid, data: &[u8]) -> Result<()> {
        self.writable.put(cid, data).await
    }

    async fn put_block(&self, data: &[u8]) -> Result<IpldCid> {
        self.writable.put_block(data).await
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        if self.writable.has(cid).await? {
            return Ok(true);
        }
        self.base.has(cid).await
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        self.writable.put_many(blocks).await
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(self.get(cid).await?);
        }
        Ok(results)
    }

    async fn delete(&self, cid: &IpldCid) -> Result<()> {
        // Base layer is read-only; only the overlay is touched
        self.writable.delete(cid).await
    }

    async fn apply_commit(&self, commit: crate::repo::CommitData) -> Result<()> {
        self.writable.apply_commit(commit).await
    }
}
