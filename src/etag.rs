use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque version token assigned by the store to every document and
/// attachment write, and to every tombstone.
///
/// Ordering is byte-wise over the big-endian encoding, which for a 128-bit
/// value is identical to numeric ordering. `Etag::ZERO` is the least
/// element; a peer that has never received anything from us reports it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Etag(u128);

impl Etag {
    pub const ZERO: Etag = Etag(0);

    pub fn from_u128(value: u128) -> Self {
        Etag(value)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Big-endian bytes; the attachment wire format carries etags as raw
    /// bytes rather than hex strings.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// The next etag in sequence. Only the store allocates etags; this
    /// exists for the in-memory store's counter.
    pub fn incremented(self) -> Etag {
        Etag(self.0.saturating_add(1))
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Etag({self})")
    }
}

impl FromStr for Etag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 32 {
            return Err(format!("invalid etag '{s}': expected up to 32 hex digits"));
        }
        u128::from_str_radix(s, 16)
            .map(Etag)
            .map_err(|e| format!("invalid etag '{s}': {e}"))
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_byte_wise_comparison() {
        let a = Etag::from_u128(1);
        let b = Etag::from_u128(0x1_0000_0000);
        let c = Etag::from_u128(u128::MAX);
        assert!(Etag::ZERO < a && a < b && b < c);
        assert_eq!(a.to_bytes().cmp(&b.to_bytes()), a.cmp(&b));
        assert_eq!(b.to_bytes().cmp(&c.to_bytes()), b.cmp(&c));
    }

    #[test]
    fn zero_is_least_and_empty() {
        assert!(Etag::ZERO.is_zero());
        assert!(Etag::ZERO < Etag::from_u128(1));
    }

    #[test]
    fn parses_own_display_output() {
        let etag = Etag::from_u128(0xdead_beef);
        let parsed: Etag = etag.to_string().parse().unwrap();
        assert_eq!(parsed, etag);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Etag>().is_err());
        assert!("xyz".parse::<Etag>().is_err());
        assert!("0".repeat(33).parse::<Etag>().is_err());
    }
}
