//! Commit event descriptions for downstream consumers
//!
//! After a batch of writes lands, the repository emits a description of the
//! commit for the firehose: the signed commit CID, the op list in op-order,
//! and a CAR bundle holding every block a consumer needs to check the commit
//! against the previous repository state. Sequence numbers are assigned
//! externally by the stream, not here.

use crate::car::{parse_car_bytes, write_car_bytes};
use crate::commit::Commit;
use crate::error::{RepoError, Result};
use crate::mst::Mst;
use crate::repo::CommitData;
use crate::storage::{BlockStore, LayeredBlockStore, MemoryBlockStore};
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;
use std::sync::Arc;
use weft_common::{Did, Tid};

/// The kind of mutation a write performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    /// A record was created
    Create,
    /// A record's value was replaced
    Update,
    /// A record was removed
    Delete,
}

impl WriteAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }
}

/// A single repository operation (mutation of one record)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoOp {
    /// What happened
    pub action: WriteAction,

    /// Record path, `collection/rkey`
    pub path: SmolStr,

    /// For creates and updates, the new record CID; None for deletes
    pub cid: Option<IpldCid>,

    /// For updates and deletes, the previous record CID; None for creates
    pub prev: Option<IpldCid>,
}

/// Commit event description
///
/// One entry in the repository's outbound event stream. `blocks` is a CAR
/// bundle rooted at the commit CID, carrying the commit block, the MST nodes
/// along every changed path, and the new record blocks - enough for a
/// consumer holding the previous root to validate the transition without
/// any other state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    /// Stream sequence number, assigned externally by the consumer side
    pub seq: i64,

    /// The repository this event comes from
    pub did: Did,

    /// CID of the commit block (first root of the CAR bundle)
    pub commit: IpldCid,

    /// The rev of the emitted commit
    pub rev: Tid,

    /// The rev of the previous commit, None for the initial commit
    pub since: Option<Tid>,

    /// Operations in this commit, in op-order
    pub ops: Vec<RepoOp>,

    /// CAR bundle with the commit, changed MST nodes, and new records
    #[serde(with = "crate::codec::cbor_bytes")]
    pub blocks: Bytes,
}

impl CommitEvent {
    /// Assemble an event from applied commit data
    ///
    /// `seq` is a placeholder until the stream assigns the real number.
    pub async fn from_commit_data(
        did: Did,
        seq: i64,
        ops: Vec<RepoOp>,
        commit_data: &CommitData,
    ) -> Result<Self> {
        let blocks_car =
            write_car_bytes(commit_data.cid, commit_data.relevant_blocks.clone()).await?;

        Ok(Self {
            seq,
            did,
            commit: commit_data.cid,
            rev: commit_data.rev.clone(),
            since: commit_data.since.clone(),
            ops,
            blocks: blocks_car.into(),
        })
    }

    /// Validate this event against the previous repository state
    ///
    /// Replays the commit from the blocks carried in the event:
    ///
    /// 1. Parse the CAR bundle into a temporary overlay over `base` storage,
    ///    hash-checking every block.
    /// 2. Read the commit block, check the DID, and verify the signature
    ///    against `public_key` (compressed SEC1 secp256k1).
    /// 3. Diff the previous tree (rooted at `prev_root`, empty when None)
    ///    against the claimed new tree and re-apply the operations.
    /// 4. Confirm the recomputed root equals `commit.data`, failing
    ///    `CidMismatch` otherwise.
    ///
    /// Returns the new MST root CID on success. The base storage is never
    /// written to.
    pub async fn validate<S: BlockStore + Sync + 'static>(
        &self,
        prev_root: Option<IpldCid>,
        base: Arc<S>,
        public_key: &[u8],
    ) -> Result<IpldCid> {
        let parsed = parse_car_bytes(&self.blocks).await?;
        if parsed.root != self.commit {
            return Err(RepoError::cid_mismatch(format!(
                "event names commit {}, CAR bundle is rooted at {}",
                self.commit, parsed.root
            )));
        }

        let temp_storage = MemoryBlockStore::new_from_blocks(parsed.blocks);
        let layered = Arc::new(LayeredBlockStore::new(temp_storage.clone(), base));

        let commit_bytes = temp_storage
            .get(&self.commit)
            .await?
            .ok_or_else(|| RepoError::not_found("commit block", &self.commit))?;
        let commit = Commit::from_cbor(&commit_bytes)?;

        if commit.did() != &self.did {
            return Err(RepoError::new(crate::error::RepoErrorKind::Signature, None)
                .with_context(format!(
                    "DID mismatch: commit has {}, event has {}",
                    commit.did(),
                    self.did
                ))
                .with_help("the commit must be signed by the repository the event claims"));
        }

        commit.verify(public_key)?;

        let prev_mst = match prev_root {
            Some(root) => Mst::load(layered.clone(), root, None),
            None => Mst::new(layered.clone()),
        };

        let expected_root = *commit.data();
        let new_mst = Mst::load(layered, expected_root, None);

        // Derive verified ops from the actual trees rather than trusting the
        // event's op list, then replay them
        let diff = prev_mst.diff(&new_mst).await?;
        let computed_mst = prev_mst.batch(&diff.to_verified_ops()).await?;
        let computed_root = computed_mst.root().await?;

        if computed_root != expected_root {
            return Err(RepoError::cid_mismatch(format!(
                "MST root mismatch: expected {}, got {}",
                expected_root, computed_root
            )));
        }

        Ok(expected_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_names() {
        assert_eq!(WriteAction::Create.as_str(), "create");
        assert_eq!(WriteAction::Update.as_str(), "update");
        assert_eq!(WriteAction::Delete.as_str(), "delete");
    }

    #[test]
    fn action_round_trips_through_cbor() {
        let bytes = serde_ipld_dagcbor::to_vec(&WriteAction::Create).unwrap();
        let back: WriteAction = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(back, WriteAction::Create);
    }
}
