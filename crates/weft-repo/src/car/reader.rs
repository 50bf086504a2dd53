//! CAR file reading utilities

use crate::codec;
use crate::error::{RepoError, Result};
use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarReader;
use n0_future::stream::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use tokio::fs::File;

/// Parsed CAR data
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// The first root CID from the CAR header
    pub root: IpldCid,
    /// All blocks in the CAR, keyed by CID
    pub blocks: BTreeMap<IpldCid, Bytes>,
}

/// Check a block read from a CAR against its claimed CID
fn check_block(cid: &IpldCid, data: &[u8]) -> Result<()> {
    if !codec::verify_cid(cid, data)? {
        return Err(
            RepoError::corrupt_block(cid, codec::derive_cid(data)?)
                .with_context("CAR block failed hash check".to_string()),
        );
    }
    Ok(())
}

/// Read an entire CAR file into memory
///
/// Returns CID → block data in sorted order. Every block is hash-checked;
/// a mismatch fails `CorruptBlock`. For large files consider
/// [`stream_car`] instead.
pub async fn read_car(path: impl AsRef<Path>) -> Result<BTreeMap<IpldCid, Bytes>> {
    let file = File::open(path).await.map_err(RepoError::io)?;

    let reader = CarReader::new(file).await.map_err(RepoError::car)?;

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(RepoError::car_parse)?;
        check_block(&cid, &data)?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(blocks)
}

/// Read a CAR file header (roots only)
///
/// Useful for checking roots without loading all blocks.
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<Vec<IpldCid>> {
    let file = File::open(path).await.map_err(RepoError::io)?;

    let reader = CarReader::new(file).await.map_err(RepoError::car)?;

    Ok(reader.header().roots().to_vec())
}

/// Parse in-memory CAR bytes into root and block map
///
/// For CAR data arriving in memory (commit event bundles). Returns the
/// first root CID and all blocks, each hash-checked.
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    let reader = CarReader::new(data).await.map_err(RepoError::car_parse)?;

    let roots = reader.header().roots();
    let root = roots
        .first()
        .copied()
        .ok_or_else(|| RepoError::car_parse(std::io::Error::other("CAR has no roots")))?;

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(RepoError::car_parse)?;
        check_block(&cid, &data)?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(ParsedCar { root, blocks })
}

/// Stream CAR blocks without loading the entire file into memory
pub async fn stream_car(path: impl AsRef<Path>) -> Result<CarBlockStream> {
    let file = File::open(path).await.map_err(RepoError::io)?;

    let reader = CarReader::new(file).await.map_err(RepoError::car)?;

    let roots = reader.header().roots().to_vec();
    let stream = Box::pin(reader.stream());

    Ok(CarBlockStream { stream, roots })
}

/// Streaming CAR block reader
pub struct CarBlockStream {
    stream: Pin<
        Box<dyn Stream<Item = std::result::Result<(IpldCid, Vec<u8>), iroh_car::Error>> + Send>,
    >,
    roots: Vec<IpldCid>,
}

impl CarBlockStream {
    /// Get the next block, hash-checked
    ///
    /// Returns `None` when the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<(IpldCid, Bytes)>> {
        match self.stream.next().await {
            Some(result) => {
                let (cid, data) = result.map_err(RepoError::car_parse)?;
                check_block(&cid, &data)?;
                Ok(Some((cid, Bytes::from(data))))
            }
            None => Ok(None),
        }
    }

    /// Get the CAR roots
    pub fn roots(&self) -> &[IpldCid] {
        &self.roots
    }
}
