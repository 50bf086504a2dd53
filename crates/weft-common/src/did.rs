//! Decentralised identifiers

use crate::error::StrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

/// Syntax for DID validation.
///
/// Allows `%` inside the method-specific identifier but forbids a trailing
/// `:` or `%`. Well-formedness of percent-encoding is not checked; reference
/// implementations treat that as a best practice rather than a hard rule.
static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

const MAX_DID_LEN: usize = 2048;

/// A decentralised identifier naming a repository's account
///
/// The repository engine treats DIDs as opaque beyond syntax: they appear in
/// commits and event descriptions but are never resolved here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

impl Did {
    /// Parse a DID from the given string
    pub fn new(did: impl AsRef<str>) -> Result<Self, StrError> {
        let did = did.as_ref();
        if did.len() > MAX_DID_LEN {
            Err(StrError::too_long("did", did, MAX_DID_LEN))
        } else if !DID_REGEX.is_match(did) {
            Err(StrError::pattern("did", did, "didn't match did syntax"))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// Infallible constructor for when you *know* the string is a valid DID.
    ///
    /// Panics on invalid input. Use for literals and values already validated
    /// elsewhere; go through `Did::new` for anything external.
    pub fn raw(did: impl AsRef<str>) -> Self {
        match Self::new(did) {
            Ok(did) => did,
            Err(e) => panic!("{e}"),
        }
    }

    /// Returns the DID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DID method ("plc" in `did:plc:abc`)
    pub fn method(&self) -> &str {
        // Both separators exist by construction
        let rest = &self.0[4..];
        &rest[..rest.find(':').unwrap_or(rest.len())]
    }
}

impl FromStr for Did {
    type Err = StrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: &str = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
