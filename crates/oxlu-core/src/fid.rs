//! File identifiers.
//!
//! A [`Fid`] names one filesystem object for its whole lifetime and is the only
//! key shared by the proxy, storage and lock layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Globally unique, fixed-size object identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Fid {
    /// Sequence the object id was allocated from.
    pub seq: u64,
    /// Object id within the sequence.
    pub oid: u32,
    /// Version, zero for regular objects.
    pub ver: u32,
}

impl Fid {
    /// The all-zero fid, never assigned to an object.
    pub const ZERO: Fid = Fid::new(0, 0, 0);

    pub const fn new(seq: u64, oid: u32, ver: u32) -> Self {
        Self { seq, oid, ver }
    }

    /// Whether this is the all-zero fid.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// A fid is sane when it belongs to an allocated sequence.
    pub fn is_sane(&self) -> bool {
        self.seq != 0
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}]", self.seq, self.oid, self.ver)
    }
}

/// Error parsing a fid from its `[0xSEQ:0xOID:0xVER]` form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid fid '{input}'")]
pub struct FidParseError {
    input: String,
}

impl FromStr for Fid {
    type Err = FidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || FidParseError {
            input: s.to_string(),
        };
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(err)?;

        let mut parts = inner.split(':');
        let mut next_hex = || -> Result<u64, FidParseError> {
            let part = parts.next().ok_or_else(err)?;
            let digits = part.strip_prefix("0x").unwrap_or(part);
            u64::from_str_radix(digits, 16).map_err(|_| err())
        };

        let seq = next_hex()?;
        let oid = u32::try_from(next_hex()?).map_err(|_| err())?;
        let ver = u32::try_from(next_hex()?).map_err(|_| err())?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self { seq, oid, ver })
    }
}
