//! Commit structures and signature verification
//!
//! A commit anchors an MST root into the signed, chained repository head.
//! The signature scheme is fixed by the protocol to ECDSA over secp256k1;
//! the commit layer consumes it through the [`SigningKey`] capability so the
//! tree itself stays agnostic.

use crate::codec;
use crate::error::{CommitError, Result};
use bytes::Bytes;
use cid::Cid as IpldCid;
use weft_common::{Did, Tid};

/// The only commit version this implementation reads or writes
pub const COMMIT_VERSION: i64 = 3;

/// Repository commit object
///
/// A signed record `{did, version, data, rev, prev, sig}` stored as a block
/// and identified by its CID. `data` is the MST root; `prev` chains commits
/// into a total order whose `rev` values strictly increase.
///
/// The signature covers the canonical encoding of the commit with `sig`
/// absent; the stored block is the same map re-encoded with `sig` present.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Commit version (always 3)
    pub version: i64,

    /// MST root CID
    pub data: IpldCid,

    /// Revision TID, strictly increasing along the chain
    pub rev: Tid,

    /// Previous commit CID (None for the initial commit)
    pub prev: Option<IpldCid>,

    /// Signature bytes (empty while unsigned)
    #[serde(with = "crate::codec::cbor_bytes")]
    pub sig: Bytes,
}

/// Unsigned commit map, identical to [`Commit`] minus the `sig` field
///
/// Signing over a `Commit` with an empty `sig` would still include the field
/// in the encoding; the protocol signs the map without it.
#[derive(serde::Serialize)]
struct UnsignedCommit<'a> {
    did: &'a Did,
    version: i64,
    data: &'a IpldCid,
    rev: &'a Tid,
    prev: &'a Option<IpldCid>,
}

impl Commit {
    /// Create new unsigned commit (version 3, empty sig)
    pub fn new_unsigned(did: Did, data: IpldCid, rev: Tid, prev: Option<IpldCid>) -> Self {
        Self {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig: Bytes::new(),
        }
    }

    /// Sign this commit with a key
    pub fn sign(mut self, key: &impl SigningKey) -> Result<Self> {
        let unsigned = self.unsigned_bytes()?;
        self.sig = key.sign_bytes(&unsigned)?;
        Ok(self)
    }

    /// Get the repository DID
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Get the MST root CID
    pub fn data(&self) -> &IpldCid {
        &self.data
    }

    /// Get the revision TID
    pub fn rev(&self) -> &Tid {
        &self.rev
    }

    /// Get the previous commit CID
    pub fn prev(&self) -> Option<&IpldCid> {
        self.prev.as_ref()
    }

    /// Get the signature bytes
    pub fn sig(&self) -> &Bytes {
        &self.sig
    }

    /// Canonical encoding of the commit without its signature field
    fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = UnsignedCommit {
            did: &self.did,
            version: self.version,
            data: &self.data,
            rev: &self.rev,
            prev: &self.prev,
        };
        codec::encode(&unsigned)
    }

    /// Serialize to canonical DAG-CBOR
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    /// Deserialize from DAG-CBOR
    ///
    /// Rejects any version other than 3.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let commit: Commit = codec::decode(data)?;
        if commit.version != COMMIT_VERSION {
            return Err(CommitError::InvalidVersion(commit.version).into());
        }
        Ok(commit)
    }

    /// Compute the CID of this commit
    pub fn to_cid(&self) -> Result<IpldCid> {
        let cbor = self.to_cbor()?;
        codec::derive_cid(&cbor)
    }

    /// Verify the signature against a compressed SEC1 secp256k1 public key
    pub fn verify(&self, public_key: &[u8]) -> std::result::Result<(), CommitError> {
        use k256::ecdsa::signature::Verifier;
        use k256::ecdsa::{Signature, VerifyingKey};

        let unsigned = self
            .unsigned_bytes()
            .map_err(|e| CommitError::Serialization(Box::new(e)))?;

        let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CommitError::InvalidPublicKey(e.to_string()))?;
        let sig = Signature::from_slice(self.sig.as_ref())
            .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;

        verifying_key
            .verify(&unsigned, &sig)
            .map_err(|_| CommitError::SignatureVerificationFailed)?;

        Ok(())
    }
}

/// Capability trait for commit signing
///
/// The repository layer only needs `sign(bytes) -> bytes` plus the matching
/// public key; key management lives with the caller.
pub trait SigningKey {
    /// Sign the given data and return the signature bytes
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// Get the compressed SEC1 public key bytes
    fn public_key(&self) -> Vec<u8>;
}

impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = Signer::sign(self, data);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DAG_CBOR_CID_CODEC, SHA2_256_MH_CODE};
    use weft_common::Ticker;

    fn test_cid(n: u8) -> IpldCid {
        let data = vec![n; 32];
        let mh = multihash::Multihash::wrap(SHA2_256_MH_CODE, &data).unwrap();
        IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    fn test_key() -> k256::ecdsa::SigningKey {
        k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)
    }

    #[test]
    fn sign_and_verify() {
        let key = test_key();
        let rev = Ticker::new().next(None);
        let commit = Commit::new_unsigned(Did::raw("did:plc:test"), test_cid(1), rev, None)
            .sign(&key)
            .unwrap();

        commit.verify(&key.public_key()).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = test_key();
        let other = test_key();
        let rev = Ticker::new().next(None);
        let commit = Commit::new_unsigned(Did::raw("did:plc:test"), test_cid(1), rev, None)
            .sign(&key)
            .unwrap();

        assert!(commit.verify(&other.public_key()).is_err());
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let key = test_key();
        let rev = Ticker::new().next(None);
        let mut commit = Commit::new_unsigned(Did::raw("did:plc:test"), test_cid(1), rev, None)
            .sign(&key)
            .unwrap();

        commit.data = test_cid(2);
        assert!(commit.verify(&key.public_key()).is_err());
    }

    #[test]
    fn cbor_round_trip() {
        let key = test_key();
        let rev = Ticker::new().next(None);
        let commit = Commit::new_unsigned(
            Did::raw("did:plc:test"),
            test_cid(1),
            rev,
            Some(test_cid(9)),
        )
        .sign(&key)
        .unwrap();

        let cbor = commit.to_cbor().unwrap();
        let decoded = Commit::from_cbor(&cbor).unwrap();

        assert_eq!(decoded, commit);
        assert_eq!(decoded.to_cid().unwrap(), commit.to_cid().unwrap());
    }

    #[test]
    fn from_cbor_rejects_other_versions() {
        let key = test_key();
        let rev = Ticker::new().next(None);
        let mut commit = Commit::new_unsigned(Did::raw("did:plc:test"), test_cid(1), rev, None)
            .sign(&key)
            .unwrap();
        commit.version = 2;

        let cbor = codec::encode(&commit).unwrap();
        assert!(Commit::from_cbor(&cbor).is_err());
    }

    #[test]
    fn signature_covers_sig_free_encoding() {
        // Signing twice over the same content yields a verifiable commit
        // both times even though the second signing starts from a commit
        // that already has a signature attached
        let key = test_key();
        let rev = Ticker::new().next(None);
        let commit = Commit::new_unsigned(Did::raw("did:plc:test"), test_cid(1), rev, None)
            .sign(&key)
            .unwrap();

        let resigned = commit.clone().sign(&key).unwrap();
        resigned.verify(&key.public_key()).unwrap();
    }
}
