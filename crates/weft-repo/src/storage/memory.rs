//! Heap-backed block storage

use crate::codec;
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Block store living entirely in process memory
///
/// The usual choice for tests, scratch trees, and event-validation
/// overlays. Payloads are held as `Bytes`, so handing one out is a
/// refcount bump, and every clone of the store views the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<HashMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Fresh, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with already-keyed blocks
    ///
    /// No hashing happens here; the caller vouches for the CIDs. Blocks
    /// from untrusted input belong in [`BlockStore::put`] instead.
    pub fn new_from_blocks(blocks: BTreeMap<IpldCid, Bytes>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(blocks.into_iter().collect())),
        }
    }

    /// Number of blocks held
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Whether the store holds nothing
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Drop every block
    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    fn checked(cid: &IpldCid, data: &[u8]) -> Result<()> {
        let actual = codec::derive_cid(data)?;
        match actual == *cid {
            true => Ok(()),
            false => Err(RepoError::corrupt_block(cid, actual)),
        }
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.inner.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, cid: &IpldCid, data: &[u8]) -> Result<()> {
        Self::checked(cid, data)?;
        self.inner
            .write()
            .unwrap()
            .insert(*cid, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn put_block(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = codec::derive_cid(data)?;
        self.inner
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.inner.read().unwrap().contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        for (cid, data) in blocks {
            Self::checked(&cid, &data)?;
            self.inner.write().unwrap().insert(cid, data);
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let inner = self.inner.read().unwrap();
        Ok(cids.iter().map(|cid| inner.get(cid).cloned()).collect())
    }

    async fn delete(&self, cid: &IpldCid) -> Result<()> {
        self.inner.write().unwrap().remove(cid);
        Ok(())
    }

    async fn apply_commit(&self, commit: crate::repo::CommitData) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.extend(commit.blocks);
        for cid in &commit.deleted_cids {
            inner.remove(cid);
        }
        Ok(())
    }
}
