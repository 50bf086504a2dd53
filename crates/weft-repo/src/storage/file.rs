//! CAR file-backed block storage

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use cid::Cid as IpldCid;

use crate::codec;
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;

/// CAR file-backed block storage
///
/// Loads the entire CAR file into memory on construction, writes back on
/// `flush`. For very large repositories, use database-backed storage
/// instead. Primarily useful for testing and simple file-based persistence.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    path: PathBuf,
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
    roots: Arc<RwLock<Vec<IpldCid>>>,
    dirty: Arc<RwLock<bool>>,
}

impl FileBlockStore {
    /// Load from existing CAR file
    ///
    /// Every contained block is hash-checked during the read.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let roots = crate::car::read_car_header(&path).await?;
        let blocks = crate::car::read_car(&path).await?;

        Ok(Self {
            path,
            blocks: Arc::new(RwLock::new(blocks)),
            roots: Arc::new(RwLock::new(roots)),
            dirty: Arc::new(RwLock::new(false)),
        })
    }

    /// Create new CAR file storage (empty)
    ///
    /// The file is not created until the first `flush`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
            roots: Arc::new(RwLock::new(Vec::new())),
            dirty: Arc::new(RwLock::new(false)),
        }
    }

    /// Get the CAR file roots
    ///
    /// In a repository CAR file, roots hold the head commit CID.
    pub fn roots(&self) -> Vec<IpldCid> {
        self.roots.read().unwrap().clone()
    }

    /// Set the CAR file roots (for writing)
    ///
    /// Marks the storage dirty; call `flush` to persist.
    pub fn set_roots(&self, new_roots: Vec<IpldCid>) {
        *self.roots.write().unwrap() = new_roots;
        *self.dirty.write().unwrap() = true;
    }

    /// Write blocks back to the CAR file if dirty
    pub async fn flush(&self) -> Result<()> {
        if !*self.dirty.read().unwrap() {
            return Ok(());
        }

        let blocks = self.blocks.read().unwrap().clone();
        let roots = self.roots.read().unwrap().clone();
        crate::car::write_car(&self.path, roots, blocks).await?;

        *self.dirty.write().unwrap() = false;
        Ok(())
    }

    /// Check if store has unflushed changes
    pub fn is_dirty(&self) -> bool {
        *self.dirty.read().unwrap()
    }

    /// Get the path to the CAR file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, cid: &IpldCid, data: &[u8]) -> Result<()> {
        let actual = codec::derive_cid(data)?;
        if actual != *cid {
            return Err(RepoError::corrupt_block(cid, actual));
        }
        self.blocks
            .write()
            .unwrap()
            .insert(*cid, Bytes::copy_from_slice(data));
        *self.dirty.write().unwrap() = true;
        Ok(())
    }

    async fn put_block(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = codec::derive_cid(data)?;
        self.blocks
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        *self.dirty.write().unwrap() = true;
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        for (cid, data) in blocks {
            let actual = codec::derive_cid(&data)?;
            if actual != cid {
                return Err(RepoError::corrupt_block(cid, actual));
            }
            self.blocks.write().unwrap().insert(cid, data);
            *self.dirty.write().unwrap() = true;
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap();
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(store.get(cid).cloned());
        }
        Ok(results)
    }

    async fn delete(&self, cid: &IpldCid) -> Result<()> {
        // Removing an absent block is a no-op and must not dirty the file
        if self.blocks.write().unwrap().remove(cid).is_some() {
            *self.dirty.write().unwrap() = true;
        }
        Ok(())
    }

    async fn apply_commit(&self, commit: crate::repo::CommitData) -> Result<()> {
        {
            let mut store = self.blocks.write().unwrap();
            for (cid, data) in commit.blocks {
                store.insert(cid, data);
            }
            for cid in commit.deleted_cids {
                store.remove(&cid);
            }
        }
        self.set_roots(vec![commit.cid]);
        Ok(())
    }
}
