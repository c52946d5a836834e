//! PostgreSQL write-ahead log positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LoadBalancingError;

/// A position in the primary's write-ahead log.
///
/// Written and parsed in the `pg_lsn` text form (`16/B374D848`), and ordered
/// so that a later position compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalLocation(u64);

impl WalLocation {
    /// Creates a location from its 64-bit byte offset.
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the 64-bit byte offset.
    pub const fn offset(&self) -> u64 {
        self.0
    }

    /// Returns how many bytes `self` is behind `other`, or zero.
    pub fn bytes_behind(&self, other: &WalLocation) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl fmt::Display for WalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for WalLocation {
    type Err = LoadBalancingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LoadBalancingError::InvalidLocation {
            value: s.to_string(),
        };

        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(invalid());
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Self((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl Serialize for WalLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WalLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let loc: WalLocation = "16/B374D848".parse().unwrap();
        assert_eq!(loc.offset(), (0x16 << 32) | 0xB374_D848);
        assert_eq!(loc.to_string(), "16/B374D848");

        let zero: WalLocation = "0/0".parse().unwrap();
        assert_eq!(zero.offset(), 0);
        assert_eq!(zero.to_string(), "0/0");
    }

    #[test]
    fn test_lowercase_hex_is_accepted() {
        let loc: WalLocation = "a/ff".parse().unwrap();
        assert_eq!(loc.to_string(), "A/FF");
    }

    #[test]
    fn test_ordering_across_segments() {
        let a: WalLocation = "0/FFFFFFFF".parse().unwrap();
        let b: WalLocation = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.bytes_behind(&b), 1);
        assert_eq!(b.bytes_behind(&a), 0);
    }

    #[test]
    fn test_invalid_locations() {
        for value in ["", "16", "/1", "1/", "xyz/1", "1/2/3", "123456789/0"] {
            let err = value.parse::<WalLocation>().unwrap_err();
            assert!(matches!(err, LoadBalancingError::InvalidLocation { .. }), "{value}");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let loc: WalLocation = "2/10".parse().unwrap();
        let json = serde_json::to_string(&loc).unwrap();
        assert_eq!(json, "\"2/10\"");
        let back: WalLocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }
}
