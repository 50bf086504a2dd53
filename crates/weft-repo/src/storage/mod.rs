//! Block storage abstraction for MST nodes, commits, and records

use crate::{error::Result, repo::CommitData};
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Async content-addressed block storage
///
/// Stores an unordered mapping from CID to byte-slice with one invariant:
/// the stored bytes hash back to the claimed CID. `put` and `put_many`
/// enforce this, failing `CorruptBlock` on mismatch. Writes are durable
/// before the call returns; batches are atomic per block, not per batch.
///
/// Implementations might use:
/// - In-memory BTreeMap ([`MemoryBlockStore`])
/// - CAR file ([`FileBlockStore`])
/// - A writable overlay over a read-only base ([`LayeredBlockStore`])
/// - SQLite/RocksDB or remote storage (user-provided)
///
/// Clone is required so the MST can share storage references across tree
/// operations. Implementations must be safe for concurrent `put`/`get`: the
/// block store is the only mutable resource shared between repositories.
///
/// # WASM Compatibility
///
/// The trait uses `trait_variant` to conditionally require `Send` only on
/// non-WASM targets, allowing use in browser environments.
///
/// # Example
///
/// ```rust,ignore
/// use weft_repo::storage::{BlockStore, MemoryBlockStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MemoryBlockStore::new();
///
/// // Store a block, deriving its CID
/// let cid = storage.put_block(b"hello world").await?;
///
/// // Retrieve it
/// if let Some(retrieved) = storage.get(&cid).await? {
///     assert_eq!(&retrieved[..], b"hello world");
/// }
/// # Ok(())
/// # }
/// ```
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Put a block under a caller-claimed CID
    ///
    /// Fails `CorruptBlock` if the bytes don't hash back to `cid`.
    /// Idempotent: re-putting the same CID with equal bytes succeeds.
    async fn put(&self, cid: &IpldCid, data: &[u8]) -> Result<()>;

    /// Put a block, deriving and returning its CID
    ///
    /// The CID is computed from the data (sha2-256, dag-cbor codec), so the
    /// stored mapping is content-addressed by construction.
    async fn put_block(&self, data: &[u8]) -> Result<IpldCid>;

    /// Check if a block exists without retrieving it
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Put many blocks at once (optimization for batch writes)
    ///
    /// Each block is hash-checked like `put`. A failure mid-batch leaves the
    /// blocks written so far persisted; unreachable leftovers are harmless.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Get multiple blocks at once (optimization for batch reads)
    ///
    /// Returns a vec of the same length as the input, with `None` for
    /// missing blocks.
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;

    /// Remove a block
    ///
    /// Callers are responsible for guaranteeing the block is unreachable
    /// from any retained commit before calling. Removing an absent block
    /// succeeds.
    async fn delete(&self, cid: &IpldCid) -> Result<()>;

    /// Apply a commit (write new blocks, then delete garbage)
    ///
    /// Persists all blocks from `commit.blocks` and removes the blocks in
    /// `commit.deleted_cids`. Writes happen before deletes; implementations
    /// with transactional backends should make the whole step atomic.
    async fn apply_commit(&self, commit: CommitData) -> Result<()>;
}

pub mod file;
pub mod layered;
pub mod memory;

pub use file::FileBlockStore;
pub use layered::LayeredBlockStore;
pub use memory::MemoryBlockStore;
