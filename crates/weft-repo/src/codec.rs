//! Canonical encoding and CID derivation
//!
//! All node, commit, and record payloads are encoded as canonical DAG-CBOR:
//! map keys in sorted order, minimal-width integers, explicit nulls for
//! absent optional fields, no floats. Two in-memory values denoting the same
//! abstract object always encode to identical bytes, which is what makes
//! content addressing deterministic across implementations.

use crate::error::{MstError, RepoError, Result};
use crate::{DAG_CBOR_CID_CODEC, SHA2_256_MH_CODE};
use cid::Cid as IpldCid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

/// Compute the CID of already-encoded DAG-CBOR bytes
///
/// CIDv1, dag-cbor codec (0x71), sha2-256 multihash (0x12).
pub fn derive_cid(data: &[u8]) -> Result<IpldCid> {
    let hash = Sha256::digest(data);
    let mh = multihash::Multihash::<64>::wrap(SHA2_256_MH_CODE, hash.as_slice())
        .map_err(|e| MstError::InvalidNode(e.to_string()))?;
    Ok(IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh))
}

/// Serialize a value to canonical DAG-CBOR
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(RepoError::serialization)
}

/// Deserialize a value from DAG-CBOR bytes
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(data).map_err(RepoError::serialization)
}

/// Serialize a value and compute its CID in one step
pub fn encode_with_cid<T: Serialize>(value: &T) -> Result<(IpldCid, Vec<u8>)> {
    let bytes = encode(value)?;
    let cid = derive_cid(&bytes)?;
    Ok((cid, bytes))
}

/// Check that `data` hashes back to `cid`
///
/// Only sha2-256 CIDs can be produced here, so a CID with any other
/// multihash never verifies.
pub fn verify_cid(cid: &IpldCid, data: &[u8]) -> Result<bool> {
    Ok(derive_cid(data)? == *cid)
}

/// Serde adapter keeping `bytes::Bytes` fields as CBOR byte strings
///
/// Without it, serde walks `Bytes` as a sequence and the encoder emits an
/// array of small integers (major type 4); the wire format requires a real
/// byte string (major type 2). Use with `#[serde(with = "...")]`.
pub(crate) mod cbor_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(field: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(field.as_ref())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(de)?;
        Ok(Bytes::from(buf.into_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn cid_is_deterministic() {
        let a = derive_cid(b"hello world").unwrap();
        let b = derive_cid(b"hello world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, derive_cid(b"hello worlds").unwrap());
    }

    #[test]
    fn cid_shape() {
        let cid = derive_cid(b"payload").unwrap();
        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), DAG_CBOR_CID_CODEC);
        assert_eq!(cid.hash().code(), SHA2_256_MH_CODE);
    }

    #[test]
    fn encode_sorts_map_keys() {
        // Maps with the same contents encode identically regardless of
        // insertion order, because DAG-CBOR sorts keys
        let mut forward = BTreeMap::new();
        forward.insert("alpha", 1u64);
        forward.insert("beta", 2u64);

        let mut reverse = BTreeMap::new();
        reverse.insert("beta", 2u64);
        reverse.insert("alpha", 1u64);

        assert_eq!(encode(&forward).unwrap(), encode(&reverse).unwrap());
    }

    #[test]
    fn verify_cid_detects_tampering() {
        let data = b"original bytes";
        let cid = derive_cid(data).unwrap();
        assert!(verify_cid(&cid, data).unwrap());
        assert!(!verify_cid(&cid, b"tampered bytes").unwrap());
    }

    #[test]
    fn decode_round_trip() {
        let mut value = BTreeMap::new();
        value.insert("k".to_string(), 42u64);

        let bytes = encode(&value).unwrap();
        let back: BTreeMap<String, u64> = decode(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
