//! Log sequence positions
//!
//! A position is assigned by the primary to every committed change and
//! advertised by each replica as the point up to which it has applied the
//! write stream. Positions are only ever compared.
//!
//! The text form matches Postgres `pg_lsn`: two hex halves split by a slash
//! (`16/B374D848`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A totally ordered log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    /// The beginning of the log
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Position `n` records further along the log (saturating).
    pub fn advance(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// Has a node at `self` applied everything up to `required`?
    pub fn is_caught_up_to(self, required: Lsn) -> bool {
        self >= required
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::Other(format!("invalid log position: {:?}", s));

        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(invalid());
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;

        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Lsn(raw)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_pg_lsn() {
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
        assert_eq!(Lsn::new(0x16_B374_D848).to_string(), "16/B374D848");
    }

    #[test]
    fn test_parse() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x16_B374_D848);
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
        assert_eq!(" 0/1A ".parse::<Lsn>().unwrap(), Lsn::new(0x1A));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "16", "/", "16/", "/B3", "xyz/1", "1/2/3", "123456789/0"] {
            assert!(bad.parse::<Lsn>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_ordering_across_halves() {
        let low: Lsn = "0/FFFFFFFF".parse().unwrap();
        let high: Lsn = "1/0".parse().unwrap();
        assert!(low < high);
        assert!(high.is_caught_up_to(low));
        assert!(high.is_caught_up_to(high));
        assert!(!low.is_caught_up_to(high));
    }

    #[test]
    fn test_serde_as_string() {
        let lsn = Lsn::new(0x2_0000_0010);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"2/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
