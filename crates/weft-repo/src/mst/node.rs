//! Node representations: the in-memory slot list and the wire structs

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use crate::{mst::Mst, storage::BlockStore};

/// One slot in a node's in-memory entry list
///
/// Tree operations work on a `Vec<NodeEntry>` per node, child pointers
/// interleaved between leaves in key order. A well-formed list never puts
/// two `Child` slots back to back; the mutation helpers in `tree.rs`
/// preserve that by fusing or splitting boundary children as they go.
#[derive(Clone, Debug)]
pub enum NodeEntry<S: BlockStore> {
    /// Handle on a node one layer down, read from storage on demand
    Child(Mst<S>),

    /// A stored key and the CID of its record
    Leaf {
        /// Full key; prefix compression exists only on the wire
        key: SmolStr,
        /// Record CID
        value: IpldCid,
    },
}

impl<S: BlockStore> NodeEntry<S> {
    /// The key, when this slot is a leaf
    pub fn key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key),
            NodeEntry::Child(_) => None,
        }
    }
}

// Wire structs. Conversion to and from the flat slot list lives in util.rs:
// a leading Child becomes `left`, every Leaf becomes one element of
// `entries`, and a Child directly after a leaf becomes that element's
// `subtree` pointer.

/// Serialized node, the unit stored under a CID
///
/// Field names are the single letters of the cross-implementation format.
/// Both `Option` fields encode as an explicit CBOR null when absent;
/// dropping the field instead would change the bytes, and with them the
/// CID, on every conforming peer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Subtree holding every key that sorts below the first entry
    #[serde(rename = "l")]
    pub left: Option<IpldCid>,

    /// Leaves in ascending key order, prefix-compressed
    #[serde(rename = "e")]
    pub entries: Vec<EntryData>,
}

/// Serialized leaf entry
///
/// `prefix` counts the bytes this key shares with the previous key in the
/// same node (zero for the first entry); `suffix` carries the rest. Full
/// keys are reassembled during decode.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntryData {
    /// Key bytes after the shared prefix
    ///
    /// A CBOR byte string, not an integer array.
    #[serde(rename = "k", with = "crate::codec::cbor_bytes")]
    pub suffix: Bytes,

    /// Length of the prefix shared with the previous entry's key
    #[serde(rename = "p")]
    pub prefix: u8,

    /// Node one layer down holding the keys between this entry and the next
    #[serde(rename = "t")]
    pub subtree: Option<IpldCid>,

    /// Record CID
    #[serde(rename = "v")]
    pub value: IpldCid,
}
