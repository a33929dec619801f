//! Watermarks: opaque, strictly monotonic, lexicographically sortable
//! positions in the change stream.
//!
//! A watermark is just a string, but callers must never construct one by
//! hand from arbitrary text — [`Watermark::from_lsn`] is the only supported
//! way to derive one from upstream state, so that ordering stays consistent
//! with commit order regardless of how the underlying LSN is formatted.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the change stream. Comparison is bytewise ASCII order,
/// which is why watermarks are zero-padded, fixed-width hex rather than
/// decimal: `"0a" < "0b" < "10"` needs to hold without parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// The watermark that precedes all real watermarks. Used as the
    /// sentinel "no prior commit" value (e.g. a fresh replica's
    /// `replicaVersion`, or `replicationState.lastWatermark` before the
    /// first commit has ever landed).
    pub const ZERO: &'static str = "00000000000000000000";

    /// Wrap an already-formatted watermark string. Only used at the
    /// storage/wire boundary (reading a row back out of the changeLog,
    /// decoding a subscribe query string) where the value is known to have
    /// been produced by [`Watermark::from_lsn`] or `ZERO` in the first
    /// place.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive a watermark from a Postgres LSN (`XLogRecPtr`), a 64-bit
    /// integer conventionally printed as two hex halves separated by `/`
    /// (e.g. `16/B374D848`). We repack it as 20 zero-padded lowercase hex
    /// digits (covering the full `u64` range) so that bytewise ASCII
    /// ordering on the packed form matches numeric ordering on the LSN,
    /// which the upstream's own `%X/%X` form does not guarantee (a short
    /// hex group sorts before a long one even when numerically larger).
    pub fn from_lsn(lsn: u64) -> Self {
        Self(format!("{lsn:020x}"))
    }

    /// The zero/sentinel watermark.
    pub fn zero() -> Self {
        Self(Self::ZERO.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse this watermark back into the LSN it was derived from, for
    /// constructing `START_REPLICATION SLOT ... LOGICAL <lsn>` commands.
    pub fn to_lsn(&self) -> Option<u64> {
        u64::from_str_radix(&self.0, 16).ok()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        // Explicit bytewise comparison rather than relying on `String`'s
        // `Ord` impl matching forever — this is the invariant §3 demands,
        // so it gets to be load-bearing and explicit.
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl From<Watermark> for String {
    fn from(w: Watermark) -> Self {
        w.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_bytewise_not_numeric_on_raw_strings() {
        // Demonstrates why from_lsn zero-pads: unpadded "a" < "b" < "10"
        // would break once hex digit count varies.
        let a = Watermark::from_raw("09");
        let b = Watermark::from_raw("0a");
        let c = Watermark::from_raw("0b");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn from_lsn_preserves_numeric_order() {
        let small = Watermark::from_lsn(10);
        let big = Watermark::from_lsn(0xFFFF_FFFF);
        assert!(small < big);
        assert_eq!(big.to_lsn(), Some(0xFFFF_FFFF));
    }

    #[test]
    fn zero_sorts_before_everything() {
        let zero = Watermark::zero();
        let any = Watermark::from_lsn(1);
        assert!(zero < any);
    }

    #[test]
    fn roundtrips_through_serde() {
        let w = Watermark::from_lsn(42);
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, "\"000000000000002a\"");
        let back: Watermark = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }
}
