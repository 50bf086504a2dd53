//! Merkle Search Tree implementation
//!
//! The tree's shape is fully determined by the SHA-256 hash of each key:
//! every key has an immutable layer (`floor(leading_zero_bits / 2)`), nodes
//! hold entries of a single layer, and subtree pointers descend exactly one
//! layer. Two trees holding the same key/value mapping therefore serialize
//! to byte-identical root CIDs regardless of how they were built.

pub mod cursor;
pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use cursor::{CursorPosition, MstCursor};
pub use diff::MstDiff;
pub use node::{EntryData, NodeData, NodeEntry};
pub use tree::{Mst, VerifiedWriteOp};
