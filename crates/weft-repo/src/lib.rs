//! Merkle Search Tree repository engine
//!
//! This crate provides the data structure core of a federated personal data
//! server repository:
//!
//! - **MST (Merkle Search Tree)**: a deterministic, content-addressed,
//!   order-independent key/value index. Two peers holding the same mapping
//!   produce byte-identical root CIDs regardless of insertion order.
//! - **Commits**: signed, chained commit objects anchoring an MST root as the
//!   repository head.
//! - **Storage**: pluggable content-addressed block storage with in-memory,
//!   CAR-file-backed, and layered implementations.
//! - **CAR I/O**: repository export/import in CAR (Content Addressable
//!   aRchive) format.
//! - **Events**: commit event descriptions for downstream firehose consumers,
//!   with inductive validation.
//!
//! # Design Philosophy
//!
//! - Immutable MST operations for referential transparency: every mutation
//!   yields a logically new tree; untouched subtrees are shared by handle.
//! - Canonical DAG-CBOR everywhere: the on-disk format is byte-exact and
//!   interchangeable with other implementations of the same protocol.
//! - Single writer per repository, any number of concurrent readers.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_repo::{Mst, MemoryBlockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryBlockStore::new());
//! let mst = Mst::new(storage);
//!
//! let cid = /* CID of a stored record */;
//! let mst = mst.add("app.bsky.feed.post/3jzfcijpj2z2a", cid).await?;
//!
//! if let Some(value) = mst.get("app.bsky.feed.post/3jzfcijpj2z2a").await? {
//!     println!("found: {}", value);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) utilities
pub mod car;
/// Canonical encoding and CID derivation
pub mod codec;
/// Commit structures and signature verification
pub mod commit;
pub mod error;
/// Commit event descriptions for downstream consumers
pub mod event;
/// Merkle Search Tree implementation
pub mod mst;
/// High-level repository operations
pub mod repo;
/// Block storage abstraction
pub mod storage;

pub use commit::{Commit, SigningKey};
pub use error::{RepoError, RepoErrorKind, Result};
pub use event::{CommitEvent, RepoOp, WriteAction};
pub use mst::{Mst, MstDiff};
pub use repo::{CommitData, RecordWrite, Repository};
pub use storage::{BlockStore, FileBlockStore, LayeredBlockStore, MemoryBlockStore};

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR_CID_CODEC: u64 = 0x71;

/// SHA2-256 multihash code (0x12)
pub const SHA2_256_MH_CODE: u64 = 0x12;

/// Expected fanout per MST layer.
///
/// Layers are assigned from two-bit groups of leading zeros in each key's
/// SHA-256 hash, giving an expected branching factor of 4. Informational
/// only; changing the grouping would break interop.
pub const MST_FANOUT: usize = 4;
