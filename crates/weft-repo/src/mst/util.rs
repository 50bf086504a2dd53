//! Key rules, layer assignment, and wire conversion

use super::node::{EntryData, NodeData, NodeEntry};
use crate::codec;
use crate::error::{MstError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Serialize a slot list and derive the node's CID, storing nothing
pub async fn node_cid<S: BlockStore + Sync + 'static>(slots: &[NodeEntry<S>]) -> Result<IpldCid> {
    let wire = encode_entries(slots).await?;
    let (cid, _) = codec::encode_with_cid(&wire)?;
    Ok(cid)
}

/// CID of the empty node `{l: null, e: []}`
///
/// The root of every repository that holds no records.
pub fn empty_node_cid() -> Result<IpldCid> {
    let (cid, _) = codec::encode_with_cid(&NodeData {
        left: None,
        entries: Vec::new(),
    })?;
    Ok(cid)
}

/// Layer of a key: `floor(leading_zero_bits(sha256(key)) / 2)`
///
/// Grouping the zero bits in pairs yields an expected branching factor of
/// four. An all-zero digest saturates at layer 128. Peers must agree on
/// this function bit for bit or their trees stop being comparable.
pub fn layer_for_key(key: &str) -> usize {
    leading_zero_bits(&Sha256::digest(key.as_bytes())) / 2
}

/// Zero bits before the first set bit, over the whole digest
fn leading_zero_bits(digest: &[u8]) -> usize {
    match digest.iter().position(|b| *b != 0) {
        Some(i) => i * 8 + digest[i].leading_zeros() as usize,
        None => digest.len() * 8,
    }
}

/// Check a key against the `collection/rkey` rules
///
/// Non-empty UTF-8, exactly one `/` with text on both sides, no control
/// characters, at most [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }
    if key.chars().any(char::is_control) {
        return Err(MstError::ControlChars {
            key: key.to_string(),
        }
        .into());
    }

    match key.split_once('/') {
        Some((collection, rkey))
            if !collection.is_empty() && !rkey.is_empty() && !rkey.contains('/') =>
        {
            Ok(())
        }
        _ => Err(MstError::BadKeyShape {
            key: key.to_string(),
        }
        .into()),
    }
}

/// Bytes shared at the start of two keys
pub fn shared_prefix(a: &str, b: &str) -> usize {
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Flatten a slot list into the wire layout
///
/// A leading child becomes the `left` pointer; each leaf is emitted with
/// the longest prefix shared with its predecessor, and a child right after
/// it becomes its `subtree` pointer. Resolving child CIDs here is what
/// forces dirty descendants to serialize bottom-up.
pub fn encode_entries<'a, S: BlockStore + Sync + 'static>(
    slots: &'a [NodeEntry<S>],
) -> Pin<Box<dyn Future<Output = Result<NodeData>> + Send + 'a>> {
    Box::pin(async move {
        let mut iter = slots.iter().peekable();

        let left = match iter.peek() {
            Some(NodeEntry::Child(child)) => {
                let cid = child.root().await?;
                iter.next();
                Some(cid)
            }
            _ => None,
        };

        let mut entries = Vec::new();
        let mut prev = "";
        while let Some(slot) = iter.next() {
            let NodeEntry::Leaf { key, value } = slot else {
                return Err(
                    MstError::InvalidNode("child pointer without a preceding leaf".into()).into(),
                );
            };

            let shared = shared_prefix(prev, key.as_str());
            let subtree = match iter.peek() {
                Some(NodeEntry::Child(child)) => {
                    let cid = child.root().await?;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };

            entries.push(EntryData {
                suffix: Bytes::copy_from_slice(&key.as_bytes()[shared..]),
                prefix: u8::try_from(shared).map_err(|_| {
                    MstError::InvalidNode(format!(
                        "shared prefix of {shared} bytes does not fit the wire format"
                    ))
                })?,
                subtree,
                value: *value,
            });
            prev = key.as_str();
        }

        Ok(NodeData { left, entries })
    })
}

/// Rebuild a slot list from decoded wire data
///
/// Each full key is spliced together from its predecessor's prefix and the
/// stored suffix, and must come out as valid UTF-8. Children stay lazy;
/// only their CIDs are known here.
pub fn decode_entries<S: BlockStore + Sync + 'static>(
    storage: Arc<S>,
    wire: &NodeData,
    layer: Option<usize>,
) -> Result<Vec<NodeEntry<S>>> {
    use crate::mst::Mst;

    let below = layer.map(|l| l.saturating_sub(1));
    let mut slots = Vec::with_capacity(wire.entries.len() * 2 + 1);

    if let Some(cid) = wire.left {
        slots.push(NodeEntry::Child(Mst::load(storage.clone(), cid, below)));
    }

    let mut key_buf: Vec<u8> = Vec::new();
    for entry in &wire.entries {
        let keep = entry.prefix as usize;
        if keep > key_buf.len() {
            return Err(MstError::InvalidNode(format!(
                "entry reuses {keep} bytes of a {}-byte predecessor",
                key_buf.len()
            ))
            .into());
        }

        key_buf.truncate(keep);
        key_buf.extend_from_slice(&entry.suffix);
        let key = std::str::from_utf8(&key_buf)
            .map_err(|e| MstError::InvalidNode(format!("key is not UTF-8: {e}")))?;

        slots.push(NodeEntry::Leaf {
            key: SmolStr::new(key),
            value: entry.value,
        });

        if let Some(cid) = entry.subtree {
            slots.push(NodeEntry::Child(Mst::load(storage.clone(), cid, below)));
        }
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_keys() {
        assert!(validate_key("app.bsky.feed.post/abc123").is_ok());
        assert!(validate_key("foo.bar/test-key_2024").is_ok());
        assert!(validate_key("c/a").is_ok());
        // Non-ASCII is fine as long as nothing is a control character
        assert!(validate_key("coll/ключ").is_ok());
    }

    #[test]
    fn rejects_bad_shapes() {
        for key in ["", "noSlash", "a/b/c", "/rkey", "coll/"] {
            assert!(validate_key(key).is_err(), "should reject {key:?}");
        }
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_key("coll/rkey\x00").is_err());
        assert!(validate_key("coll/r\nkey").is_err());
        assert!(validate_key("coll/r\tkey").is_err());
    }

    #[test]
    fn length_boundary_sits_at_1024() {
        let at_limit = format!("c/{}", "a".repeat(MAX_KEY_LEN - 2));
        assert_eq!(at_limit.len(), MAX_KEY_LEN);
        assert!(validate_key(&at_limit).is_ok());

        let over = format!("c/{}", "a".repeat(MAX_KEY_LEN - 1));
        assert!(validate_key(&over).is_err());
    }

    #[test]
    fn shared_prefix_counts_bytes() {
        assert_eq!(shared_prefix("hello", "help"), 3);
        assert_eq!(shared_prefix("abc", "abc"), 3);
        assert_eq!(shared_prefix("abc", "def"), 0);
        assert_eq!(shared_prefix("", "test"), 0);
    }

    #[test]
    fn layer_is_a_pure_function_of_the_key() {
        let layer = layer_for_key("app.bsky.feed.post/test");
        assert!(layer <= 128);
        assert_eq!(layer, layer_for_key("app.bsky.feed.post/test"));
    }

    #[test]
    fn zero_bit_counting() {
        // 3 zero bytes then 0b00000001
        assert_eq!(leading_zero_bits(&[0, 0, 0, 1]), 31);
        assert_eq!(leading_zero_bits(&[0xFF, 0, 0]), 0);
        assert_eq!(leading_zero_bits(&[0, 0x80]), 8);
        assert_eq!(leading_zero_bits(&[0, 0x01]), 15);
        // Every bit of an all-zero digest counts
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn empty_node_cid_is_a_constant() {
        assert_eq!(empty_node_cid().unwrap(), empty_node_cid().unwrap());
    }
}
