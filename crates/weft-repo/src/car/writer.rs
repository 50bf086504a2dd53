//! CAR file writing utilities

use crate::error::{RepoError, Result};
use crate::mst::tree::Mst;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarWriter;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Write blocks to a CAR file
///
/// Roots should hold the commit CID(s). Blocks are written in sorted CID
/// order (BTreeMap) for determinism.
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<IpldCid>,
    blocks: BTreeMap<IpldCid, Bytes>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;

    let header = iroh_car::CarHeader::new_v1(roots);
    let mut writer = CarWriter::new(header, file);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(RepoError::car)?;
    }

    writer.finish().await.map_err(RepoError::car)?;

    Ok(())
}

/// Write blocks to CAR bytes (in-memory)
///
/// Like [`write_car`] but into a `Vec<u8>`; used for event block bundles.
pub async fn write_car_bytes(root: IpldCid, blocks: BTreeMap<IpldCid, Bytes>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let header = iroh_car::CarHeader::new_v1(vec![root]);
    let mut writer = CarWriter::new(header, &mut buffer);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(RepoError::car)?;
    }

    writer.finish().await.map_err(RepoError::car)?;

    buffer.flush().await.map_err(RepoError::io)?;

    Ok(buffer)
}

/// Export a full repository (commit + MST + records) to a CAR file
///
/// Streams blocks straight from storage:
/// - The commit block first (it is also the lone root)
/// - Every MST node block
/// - Every record block
pub async fn export_repo_car<S: BlockStore + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;

    let header = iroh_car::CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, file);

    let storage = mst.storage();
    let commit_data = storage
        .get(&commit_cid)
        .await?
        .ok_or_else(|| RepoError::not_found("commit", &commit_cid))?;

    writer
        .write(commit_cid, &commit_data)
        .await
        .map_err(RepoError::car)?;

    mst.stream_to_car(&mut writer).await?;

    writer.finish().await.map_err(RepoError::car)?;

    Ok(())
}
