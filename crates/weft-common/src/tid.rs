//! Timestamp identifiers (TIDs) and their monotonic generator

use crate::error::StrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::{SmolStr, SmolStrBuilder};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::SystemTime;

/// Sortable base-32 alphabet used by TIDs
const S32_CHARS: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Mask for the 53-bit microsecond component
const MICROS_MASK: u64 = 0x001F_FFFF_FFFF_FFFF;

/// Mask for the 10-bit clock-sequence component
const CLOCK_ID_MASK: u64 = 0x03FF;

static TID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$").unwrap()
});

fn s32_encode(mut value: u64) -> SmolStr {
    let mut out = [0u8; 13];
    for slot in out.iter_mut().rev() {
        *slot = S32_CHARS[(value & 0x1F) as usize];
        value >>= 5;
    }
    let mut builder = SmolStrBuilder::new();
    for byte in out {
        builder.push(byte as char);
    }
    builder.finish()
}

fn s32_decode(s: &str) -> u64 {
    let mut value: u64 = 0;
    for c in s.bytes() {
        let digit = S32_CHARS.iter().position(|&x| x == c).unwrap_or(0);
        value = (value << 5) | digit as u64;
    }
    value
}

/// Timestamp identifier used for commit revisions
///
/// A TID is 13 characters of sortable base-32 (`234567abcdefghijklmnopqrstuvwxyz`)
/// encoding a 63-bit value: 53 bits of microseconds since the UNIX epoch
/// followed by a 10-bit clock sequence. Lexicographic order on TID strings
/// therefore matches chronological order.
///
/// Generate fresh TIDs through [`Ticker`], which guarantees strict
/// monotonicity within a process.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parse a TID from the given string
    pub fn new(tid: impl AsRef<str>) -> Result<Self, StrError> {
        let tid = tid.as_ref();
        if tid.len() != 13 {
            if tid.len() > 13 {
                Err(StrError::too_long("tid", tid, 13))
            } else {
                Err(StrError::too_short("tid", tid, 13))
            }
        } else if !TID_REGEX.is_match(tid) {
            Err(StrError::pattern("tid", tid, "didn't match tid syntax"))
        } else {
            Ok(Self(SmolStr::new_inline(tid)))
        }
    }

    /// Infallible constructor for when you *know* the string is a valid TID.
    ///
    /// Panics on invalid input.
    pub fn raw(tid: impl AsRef<str>) -> Self {
        match Self::new(tid) {
            Ok(tid) => tid,
            Err(e) => panic!("{e}"),
        }
    }

    /// Build a TID from a microsecond timestamp and clock sequence
    ///
    /// Both components are masked to their field widths (53 and 10 bits).
    pub fn from_parts(micros: u64, clock_id: u32) -> Self {
        let value = ((micros & MICROS_MASK) << 10) | (clock_id as u64 & CLOCK_ID_MASK);
        Self(s32_encode(value))
    }

    /// Extract the microsecond timestamp component
    pub fn timestamp_micros(&self) -> u64 {
        s32_decode(&self.0) >> 10
    }

    /// Whether this TID sorts strictly after `other`
    pub fn newer_than(&self, other: &Tid) -> bool {
        self.0 > other.0
    }

    /// Returns the TID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Tid {
    type Err = StrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: &str = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Tid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// Strictly monotonic TID generator
///
/// Each `Ticker` carries a random 10-bit clock id and the last timestamp it
/// handed out. When the wall clock stalls or steps backwards the timestamp is
/// forced forward (`now = max(now, last + 1)`), so two calls never produce
/// equal or out-of-order TIDs.
pub struct Ticker {
    last_micros: u64,
    clock_id: u32,
}

impl Ticker {
    /// Create a TID generator with a random clock id
    pub fn new() -> Self {
        Self {
            last_micros: 0,
            clock_id: rand::random::<u32>() & CLOCK_ID_MASK as u32,
        }
    }

    /// Generate the next TID, strictly newer than `prev` when given
    pub fn next(&mut self, prev: Option<&Tid>) -> Tid {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
            & MICROS_MASK;

        self.last_micros = if now > self.last_micros {
            now
        } else {
            self.last_micros + 1
        };

        let tid = Tid::from_parts(self.last_micros, self.clock_id);
        match prev {
            Some(prev) if !tid.newer_than(prev) => {
                self.last_micros = prev.timestamp_micros() + 1;
                Tid::from_parts(self.last_micros, self.clock_id)
            }
            _ => tid,
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
