//! Error types for repository operations

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
///
/// Three broad classes: caller errors (`InvalidKey`, `InvalidSwap`,
/// `AlreadyExists`), integrity errors (`MalformedTree`, `CorruptBlock`,
/// `CidMismatch`, `Signature`), and transient errors (`Io`). Absence of a
/// key or block is expressed as `Option::None` by read operations;
/// `NotFound` only appears where a required resource is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Key violates the `collection/rkey` format rules
    InvalidKey,
    /// Optimistic-concurrency precondition failed (expected CID didn't match)
    InvalidSwap,
    /// Create-only write targeted an existing record
    AlreadyExists,
    /// Tree structure violates MST invariants
    MalformedTree,
    /// Stored bytes don't hash to their claimed CID
    CorruptBlock,
    /// Recomputed CID doesn't match the expected CID
    CidMismatch,
    /// Signing or signature verification failed
    Signature,
    /// Serialization/deserialization failed
    Serialization,
    /// Repository has no head commit yet
    NotInitialized,
    /// Required resource not found
    NotFound,
    /// CAR file operation failed
    Car,
    /// I/O error (transient, retriable)
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    // Constructors for different error kinds

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("keys are `collection/rkey`: exactly one '/', both halves non-empty, no control characters, max 1024 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create an invalid swap error (optimistic-concurrency failure)
    pub fn invalid_swap(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidSwap, None)
            .with_context(msg.into())
            .with_help("re-read the current state and retry the write with fresh expectations")
    }

    /// Create an already exists error
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::AlreadyExists, None)
            .with_context(format!("{} already exists: {}", resource, id))
    }

    /// Create a malformed tree error
    pub fn malformed_tree(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::MalformedTree, Some(msg.into().into()))
            .with_help("MST nodes must keep entries sorted and layer-consistent")
    }

    /// Create a corrupt block error
    pub fn corrupt_block(claimed: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::CorruptBlock, None)
            .with_context(format!("claimed {}, bytes hash to {}", claimed, actual))
    }

    /// Create a CID mismatch error
    pub fn cid_mismatch(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::CidMismatch, Some(msg.into().into()))
    }

    /// Create a signature error
    pub fn signature(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Signature, Some(Box::new(source)))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a not initialized error
    pub fn not_initialized(did: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotInitialized, None)
            .with_context(format!("repository has no head commit: {}", did))
    }

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }

    /// Create a CAR file error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create a CAR parse error (alias for car)
    pub fn car_parse(source: impl Error + Send + Sync + 'static) -> Self {
        Self::car(source).with_context("failed to parse CAR data".to_string())
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Key must be `collection/rkey` with exactly one slash
    #[error("Key must contain exactly one '/' with non-empty halves: {key}")]
    BadKeyShape {
        /// The invalid key
        key: String,
    },

    /// Key contains a control character
    #[error("Key contains control characters: {key:?}")]
    ControlChars {
        /// The invalid key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::BadKeyShape { key } => RepoError::invalid_key(key),
            MstError::ControlChars { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::malformed_tree(msg),
            MstError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(i64),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid public key bytes
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::new(RepoErrorKind::Serialization, None)
                    .with_context(format!("unsupported commit version {}", v))
            }
            CommitError::InvalidSignature(msg) => {
                RepoError::new(RepoErrorKind::Signature, Some(msg.into()))
                    .with_context("invalid signature format".to_string())
            }
            CommitError::SignatureVerificationFailed => {
                RepoError::new(RepoErrorKind::Signature, None)
                    .with_context("signature verification failed".to_string())
            }
            CommitError::InvalidPublicKey(msg) => {
                RepoError::new(RepoErrorKind::Signature, Some(msg.into()))
                    .with_context("invalid public key".to_string())
            }
            CommitError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_accessor() {
        let err = RepoError::invalid_key("bad key");
        assert_eq!(err.kind(), &RepoErrorKind::InvalidKey);
    }

    #[test]
    fn display_includes_context() {
        let err = RepoError::not_found("commit", "bafyexample");
        let msg = err.to_string();
        assert!(msg.contains("NotFound"));
        assert!(msg.contains("bafyexample"));
    }

    #[test]
    fn mst_error_conversion() {
        let err: RepoError = MstError::EmptyKey.into();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidKey);

        let err: RepoError = MstError::InvalidNode("unsorted".into()).into();
        assert_eq!(err.kind(), &RepoErrorKind::MalformedTree);
    }

    #[test]
    fn commit_error_conversion() {
        let err: RepoError = CommitError::SignatureVerificationFailed.into();
        assert_eq!(err.kind(), &RepoErrorKind::Signature);
    }
}
