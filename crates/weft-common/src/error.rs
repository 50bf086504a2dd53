//! Parse errors for protocol string types

use smol_str::SmolStr;
use std::fmt;

/// Error produced when a string fails validation against a protocol syntax
///
/// `spec` names the syntax that was being parsed ("did", "tid"), `source` is
/// the offending input, and `kind` says what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub struct StrError {
    /// Which syntax the input was validated against
    pub spec: SmolStr,
    /// The input that failed to parse
    #[source_code]
    pub source_str: String,
    /// What went wrong
    pub kind: StrErrorKind,
}

/// Categories of string validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrErrorKind {
    /// Input exceeds the maximum length
    TooLong {
        /// Maximum allowed length in bytes
        max: usize,
        /// Actual length in bytes
        actual: usize,
    },
    /// Input is shorter than the minimum length
    TooShort {
        /// Minimum required length in bytes
        min: usize,
        /// Actual length in bytes
        actual: usize,
    },
    /// Input did not match the syntax pattern
    Pattern {
        /// Short description of the expectation
        message: SmolStr,
    },
}

impl StrError {
    /// Input exceeded the maximum length for the syntax
    pub fn too_long(spec: &'static str, source: &str, max: usize) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source_str: source.to_string(),
            kind: StrErrorKind::TooLong {
                max,
                actual: source.len(),
            },
        }
    }

    /// Input fell short of the minimum length for the syntax
    pub fn too_short(spec: &'static str, source: &str, min: usize) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source_str: source.to_string(),
            kind: StrErrorKind::TooShort {
                min,
                actual: source.len(),
            },
        }
    }

    /// Input did not match the syntax pattern
    pub fn pattern(spec: &'static str, source: &str, message: &'static str) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source_str: source.to_string(),
            kind: StrErrorKind::Pattern {
                message: SmolStr::new_static(message),
            },
        }
    }
}

impl fmt::Display for StrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StrErrorKind::TooLong { max, actual } => {
                write!(
                    f,
                    "invalid {}: {} bytes (max {}): {:?}",
                    self.spec, actual, max, self.source_str
                )
            }
            StrErrorKind::TooShort { min, actual } => {
                write!(
                    f,
                    "invalid {}: {} bytes (min {}): {:?}",
                    self.spec, actual, min, self.source_str
                )
            }
            StrErrorKind::Pattern { message } => {
                write!(f, "invalid {}: {}: {:?}", self.spec, message, self.source_str)
            }
        }
    }
}
