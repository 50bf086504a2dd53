//! High-level repository operations
//!
//! A [`Repository`] owns the per-account state `{did, head commit, MST}` and
//! serializes all mutation through [`Repository::apply_writes`], which is
//! all-or-nothing with respect to the head pointer: a batch either lands as
//! one signed commit or leaves the repository exactly as it was. Reads run
//! against the eagerly built record index and never block on writes to
//! other repositories.

use crate::commit::{Commit, SigningKey};
use crate::error::{RepoError, Result};
use crate::event::{RepoOp, WriteAction};
use crate::mst::Mst;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::sync::Arc;
use weft_common::{Did, Tid, Ticker};

/// Commit data for repository updates
///
/// A signed commit plus everything needed to persist it, separating commit
/// assembly from application so the head pointer only moves once the whole
/// batch is ready.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Commit CID
    pub cid: IpldCid,

    /// New revision TID
    pub rev: Tid,

    /// Previous revision TID (None for the initial commit)
    pub since: Option<Tid>,

    /// Previous commit CID (None for the initial commit)
    pub prev: Option<IpldCid>,

    /// New MST root CID
    pub data: IpldCid,

    /// Previous MST root CID (None for the initial commit)
    pub prev_data: Option<IpldCid>,

    /// New blocks to persist (MST nodes + record data + commit block)
    pub blocks: BTreeMap<IpldCid, Bytes>,

    /// Blocks for the outbound event bundle
    ///
    /// Subset sufficient for consumers to validate the transition: the
    /// commit block, new record data, and the MST nodes along every changed
    /// key's path in both the old and new tree.
    pub relevant_blocks: BTreeMap<IpldCid, Bytes>,

    /// Record CIDs no longer referenced by the new tree
    pub deleted_cids: Vec<IpldCid>,
}

/// A single record write in an [`Repository::apply_writes`] batch
///
/// Creates and updates carry the record payload; the repository encodes it
/// canonically and stores it before touching the tree. `swap` fields request
/// optimistic-concurrency: the write only applies if the record's current
/// CID equals the expectation, failing `InvalidSwap` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Create a new record (fails `AlreadyExists` if the key is present)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record payload
        record: Ipld,
    },

    /// Replace an existing record's value
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record payload
        record: Ipld,
        /// Expected current CID, checked when present
        swap: Option<IpldCid>,
    },

    /// Remove a record
    ///
    /// Deleting an absent key with no `swap` expectation is a no-op.
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID, checked when present
        swap: Option<IpldCid>,
    },
}

impl RecordWrite {
    /// The key this write targets
    pub fn key(&self) -> &SmolStr {
        match self {
            RecordWrite::Create { key, .. }
            | RecordWrite::Update { key, .. }
            | RecordWrite::Delete { key, .. } => key,
        }
    }
}

/// High-level repository operations
///
/// # Example
///
/// ```rust,ignore
/// use weft_repo::{Repository, RecordWrite, MemoryBlockStore};
/// use weft_common::Did;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Arc::new(MemoryBlockStore::new());
/// let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
///
/// let mut repo = Repository::initialize(storage, Did::raw("did:plc:example"), &key).await?;
///
/// let writes = vec![RecordWrite::Create {
///     key: "app.bsky.feed.post/3jzfcijpj2z2a".into(),
///     record: /* Ipld payload */,
/// }];
/// let (ops, _commit) = repo.apply_writes(&writes, None, &key).await?;
///
/// repo.export_car("repo.car").await?;
/// # Ok(())
/// # }
/// ```
pub struct Repository<S: BlockStore> {
    storage: Arc<S>,
    mst: Mst<S>,
    commit: Commit,
    commit_cid: IpldCid,
    /// Eager key → record CID index backing O(1) get/has
    records: BTreeMap<SmolStr, IpldCid>,
    ticker: Ticker,
}

impl<S: BlockStore + Sync + 'static> Repository<S> {
    /// Create a new repository with an empty tree and initial commit
    ///
    /// Persists the canonical empty root node and a signed commit with
    /// `prev = null`, then points the head at it.
    pub async fn initialize<K>(storage: Arc<S>, did: Did, signing_key: &K) -> Result<Self>
    where
        K: SigningKey,
    {
        let mst = Mst::new(storage.clone());
        let (data, mut blocks) = mst.collect_blocks().await?;

        let mut ticker = Ticker::new();
        let rev = ticker.next(None);
        let commit = Commit::new_unsigned(did, data, rev.clone(), None).sign(signing_key)?;

        let commit_cbor = commit.to_cbor()?;
        let commit_cid = crate::codec::derive_cid(&commit_cbor)?;
        blocks.insert(commit_cid, Bytes::from(commit_cbor));

        let commit_data = CommitData {
            cid: commit_cid,
            rev,
            since: None,
            prev: None,
            data,
            prev_data: None,
            blocks: blocks.clone(),
            relevant_blocks: blocks,
            deleted_cids: Vec::new(),
        };
        storage.apply_commit(commit_data).await?;

        tracing::debug!(did = %commit.did(), commit = %commit_cid, "initialized repository");

        Ok(Self {
            storage,
            mst,
            commit,
            commit_cid,
            records: BTreeMap::new(),
            ticker,
        })
    }

    /// Load a repository from its head commit CID
    ///
    /// Verifies the tree's ordering and layer invariants during the walk
    /// (failing `MalformedTree`) and builds the record index that backs
    /// constant-time `get_record`/`has_record`.
    pub async fn load(storage: Arc<S>, commit_cid: &IpldCid) -> Result<Self> {
        let commit_bytes = storage.get(commit_cid).await?.ok_or_else(|| {
            RepoError::not_initialized(commit_cid)
                .with_help("the head commit block must be present in storage before loading")
        })?;

        let commit = Commit::from_cbor(&commit_bytes)?;
        let mst = Mst::load_verified(storage.clone(), *commit.data()).await?;

        let mut records = BTreeMap::new();
        for (key, cid) in mst.leaves().await? {
            records.insert(key, cid);
        }

        tracing::debug!(
            did = %commit.did(),
            commit = %commit_cid,
            records = records.len(),
            "loaded repository"
        );

        Ok(Self {
            storage,
            mst,
            commit,
            commit_cid: *commit_cid,
            records,
            ticker: Ticker::new(),
        })
    }

    /// Apply an atomic batch of writes as one signed commit
    ///
    /// Encodes and stores each record payload, mutates the tree, signs a new
    /// commit chaining to the current head, and advances the head pointer in
    /// a single storage step. On any failure the head is unchanged and the
    /// repository state is untouched; already-written blocks are unreachable
    /// and harmless.
    ///
    /// `swap_head`, when given, must equal the current head commit CID or
    /// the batch fails `InvalidSwap` before any work.
    ///
    /// Returns the op-order event descriptions and the applied commit data.
    pub async fn apply_writes<K>(
        &mut self,
        writes: &[RecordWrite],
        swap_head: Option<IpldCid>,
        signing_key: &K,
    ) -> Result<(Vec<RepoOp>, CommitData)>
    where
        K: SigningKey,
    {
        if let Some(expected) = swap_head {
            if expected != self.commit_cid {
                return Err(RepoError::invalid_swap(format!(
                    "head is {}, caller expected {}",
                    self.commit_cid, expected
                )));
            }
        }

        // Step 1: apply writes to a scratch tree, storing record payloads
        // and collecting the op descriptions in op-order
        let mut updated_tree = self.mst.clone();
        let mut leaf_blocks = BTreeMap::new();
        let mut ops = Vec::with_capacity(writes.len());

        for write in writes {
            match write {
                RecordWrite::Create { key, record } => {
                    if updated_tree.get(key.as_str()).await?.is_some() {
                        return Err(RepoError::already_exists("record", key));
                    }

                    let cbor = crate::codec::encode(record)?;
                    let cid = self.storage.put_block(&cbor).await?;
                    leaf_blocks.insert(cid, Bytes::from(cbor));

                    updated_tree = updated_tree.add(key.as_str(), cid).await?;
                    ops.push(RepoOp {
                        action: WriteAction::Create,
                        path: key.clone(),
                        cid: Some(cid),
                        prev: None,
                    });
                }

                RecordWrite::Update { key, record, swap } => {
                    let current = updated_tree
                        .get(key.as_str())
                        .await?
                        .ok_or_else(|| RepoError::not_found("record", key.as_str()))?;

                    if let Some(expected) = swap {
                        if expected != &current {
                            return Err(RepoError::invalid_swap(format!(
                                "update of {}: record is {}, caller expected {}",
                                key, current, expected
                            )));
                        }
                    }

                    let cbor = crate::codec::encode(record)?;
                    let cid = self.storage.put_block(&cbor).await?;
                    leaf_blocks.insert(cid, Bytes::from(cbor));

                    updated_tree = updated_tree.add(key.as_str(), cid).await?;
                    ops.push(RepoOp {
                        action: WriteAction::Update,
                        path: key.clone(),
                        cid: Some(cid),
                        prev: Some(current),
                    });
                }

                RecordWrite::Delete { key, swap } => {
                    let current = updated_tree.get(key.as_str()).await?;

                    match (current, swap) {
                        (Some(current), Some(expected)) if expected != &current => {
                            return Err(RepoError::invalid_swap(format!(
                                "delete of {}: record is {}, caller expected {}",
                                key, current, expected
                            )));
                        }
                        (Some(current), _) => {
                            updated_tree = updated_tree.delete(key.as_str()).await?;
                            ops.push(RepoOp {
                                action: WriteAction::Delete,
                                path: key.clone(),
                                cid: None,
                                prev: Some(current),
                            });
                        }
                        (None, Some(expected)) => {
                            return Err(RepoError::invalid_swap(format!(
                                "delete of {}: record is absent, caller expected {}",
                                key, expected
                            )));
                        }
                        // Deleting an absent record without an expectation
                        // is a no-op
                        (None, None) => {}
                    }
                }
            }
        }

        // Step 2: new root and diff against the current tree
        let data = updated_tree.root().await?;
        let prev_data = *self.commit.data();
        let diff = self.mst.diff(&updated_tree).await?;

        // Step 3: block collections. `blocks` persists everything new;
        // `relevant_blocks` is the event bundle - record data plus the node
        // path of every changed key in both trees, minus nodes the new tree
        // dropped.
        let mut blocks = diff.new_mst_blocks;
        blocks.extend(leaf_blocks.clone());

        let mut relevant_blocks = BTreeMap::new();
        relevant_blocks.extend(leaf_blocks);
        for write in writes {
            let key = write.key();
            updated_tree
                .path_blocks(key.as_str(), &mut relevant_blocks)
                .await?;
            self.mst
                .path_blocks(key.as_str(), &mut relevant_blocks)
                .await?;
        }

        let removed_set: std::collections::HashSet<_> =
            diff.removed_mst_blocks.iter().copied().collect();
        relevant_blocks.retain(|cid, _| !removed_set.contains(cid));

        let deleted_cids = diff.removed_cids;

        // Step 4: sign the commit chaining to the current head
        let rev = self.ticker.next(Some(self.commit.rev()));
        let commit = Commit::new_unsigned(
            self.commit.did().clone(),
            data,
            rev.clone(),
            Some(self.commit_cid),
        )
        .sign(signing_key)?;

        let commit_cbor = commit.to_cbor()?;
        let commit_cid = crate::codec::derive_cid(&commit_cbor)?;
        let commit_bytes = Bytes::from(commit_cbor);

        blocks.insert(commit_cid, commit_bytes.clone());
        relevant_blocks.insert(commit_cid, commit_bytes);

        let commit_data = CommitData {
            cid: commit_cid,
            rev,
            since: Some(self.commit.rev().clone()),
            prev: Some(self.commit_cid),
            data,
            prev_data: Some(prev_data),
            blocks,
            relevant_blocks,
            deleted_cids,
        };

        // Step 5: the single atomic step - persist blocks and advance the
        // head. Failure here leaves self untouched.
        self.storage.apply_commit(commit_data.clone()).await?;

        tracing::debug!(
            did = %commit.did(),
            commit = %commit_cid,
            rev = %commit_data.rev,
            ops = ops.len(),
            "applied writes"
        );

        // Step 6: update in-memory state to the new head
        self.mst = updated_tree;
        self.commit = commit;
        self.commit_cid = commit_cid;
        for op in &ops {
            match op.action {
                WriteAction::Create | WriteAction::Update => {
                    if let Some(cid) = op.cid {
                        self.records.insert(op.path.clone(), cid);
                    }
                }
                WriteAction::Delete => {
                    self.records.remove(&op.path);
                }
            }
        }

        Ok((ops, commit_data))
    }

    /// Get a record's CID by key
    ///
    /// Served from the eager index in O(1); the tree itself is not touched.
    pub fn get_record(&self, key: &str) -> Option<IpldCid> {
        self.records.get(key).copied()
    }

    /// Check whether a record exists
    pub fn has_record(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Number of records in the repository
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Iterate records in ascending key order
    pub fn records(&self) -> impl Iterator<Item = (&SmolStr, &IpldCid)> {
        self.records.iter()
    }

    /// Verify the head commit's signature against a compressed SEC1 key
    pub fn verify_signature(&self, public_key: &[u8]) -> Result<()> {
        self.commit.verify(public_key)?;
        Ok(())
    }

    /// Export the repository to a CAR file rooted at the head commit
    pub async fn export_car(&self, path: impl AsRef<Path>) -> Result<()> {
        tracing::debug!(did = %self.commit.did(), commit = %self.commit_cid, "exporting CAR");
        crate::car::export_repo_car(path, self.commit_cid, &self.mst).await
    }

    /// Get the underlying MST
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Get reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get the current head commit
    pub fn head(&self) -> &Commit {
        &self.commit
    }

    /// Get the current head commit CID
    pub fn head_cid(&self) -> &IpldCid {
        &self.commit_cid
    }

    /// Get the current revision
    pub fn rev(&self) -> &Tid {
        self.commit.rev()
    }

    /// Get the current MST root CID
    pub fn root(&self) -> &IpldCid {
        self.commit.data()
    }

    /// Get the repository DID
    pub fn did(&self) -> &Did {
        self.commit.did()
    }
}

impl<S: BlockStore> Display for Repository<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use crate::mst::tree::short_cid;

        writeln!(f, "Repository {{")?;
        writeln!(f, "  DID: {}", self.commit.did())?;
        writeln!(f, "  Commit: {}", short_cid(&self.commit_cid))?;
        writeln!(f, "  Rev: {}", self.commit.rev())?;
        writeln!(f, "  Data: {}", short_cid(self.commit.data()))?;
        writeln!(f, "  Records: {}", self.records.len())?;
        write!(f, "}}")
    }
}
