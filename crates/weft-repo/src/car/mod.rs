//! CAR (Content Addressable aRchive) file I/O
//!
//! CAR is the varint-framed container used for repository export/import and
//! event block bundles: a varint-prefixed header naming the root CIDs,
//! followed by `(varint length)(cid bytes)(block bytes)` records. Every
//! block read back in is hash-checked against its claimed CID.
//!
//! # Examples
//!
//! Reading a CAR file:
//! ```ignore
//! use weft_repo::car::read_car;
//!
//! let blocks = read_car("repo.car").await?;
//! ```
//!
//! Writing a CAR file:
//! ```ignore
//! use weft_repo::car::write_car;
//!
//! write_car("repo.car", vec![commit_cid], blocks).await?;
//! ```

pub mod reader;
pub mod writer;

pub use reader::{ParsedCar, parse_car_bytes, read_car, read_car_header, stream_car};
pub use writer::{export_repo_car, write_car, write_car_bytes};
