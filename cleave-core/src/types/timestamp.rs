//! Wall-clock timestamps with a deterministic tie-break offset.
//!
//! The normalised form is a fixed-width decimal-seconds string
//! (`0000001234.567890`); the internal form appends `_<offset hex>` when the
//! offset is non-zero. Two records carrying the same wall-clock value are
//! ordered by offset, which lets conflict resolution bump a loser without
//! moving it forward in real time.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const USECS_PER_SEC: i64 = 1_000_000;

/// A microsecond-resolution timestamp plus tie-break offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    usecs: i64,
    offset: u64,
}

impl Timestamp {
    pub fn new(usecs: i64, offset: u64) -> Self {
        Self { usecs, offset }
    }

    /// Current wall-clock time with zero offset.
    pub fn now() -> Self {
        let usecs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { usecs, offset: 0 }
    }

    pub fn from_usecs(usecs: i64) -> Self {
        Self { usecs, offset: 0 }
    }

    pub fn usecs(&self) -> i64 {
        self.usecs
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn with_offset(&self, offset: u64) -> Self {
        Self { usecs: self.usecs, offset }
    }

    /// One tick (microsecond) earlier, offset cleared.
    pub fn prev_tick(&self) -> Self {
        Self { usecs: self.usecs - 1, offset: 0 }
    }

    /// One tick (microsecond) later, offset cleared.
    pub fn next_tick(&self) -> Self {
        Self { usecs: self.usecs + 1, offset: 0 }
    }

    /// Normalised decimal-seconds form, offset ignored.
    pub fn normal(&self) -> String {
        let secs = self.usecs.div_euclid(USECS_PER_SEC);
        let frac = self.usecs.rem_euclid(USECS_PER_SEC);
        format!("{:010}.{:06}", secs, frac)
    }

    /// Internal form: normalised string plus `_<offset hex>` when offset > 0.
    pub fn internal(&self) -> String {
        if self.offset == 0 {
            self.normal()
        } else {
            format!("{}_{:016x}", self.normal(), self.offset)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.internal())
    }
}

/// Parse failure for a timestamp string.
#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp: {value}")]
pub struct ParseTimestampError {
    pub value: String,
}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimestampError { value: s.to_string() };
        let (clock, offset) = match s.split_once('_') {
            Some((clock, off)) => {
                let offset = u64::from_str_radix(off, 16).map_err(|_| err())?;
                (clock, offset)
            }
            None => (s, 0),
        };
        let (secs, frac) = match clock.split_once('.') {
            Some((secs, frac)) => {
                // Fractions are at most microsecond resolution; right-pad short ones.
                if frac.len() > 6 || frac.is_empty() {
                    return Err(err());
                }
                let scale = 10_i64.pow(6 - frac.len() as u32);
                let frac: i64 = frac.parse().map_err(|_| err())?;
                (secs, frac * scale)
            }
            None => (clock, 0),
        };
        let secs: i64 = secs.parse().map_err(|_| err())?;
        Ok(Self { usecs: secs * USECS_PER_SEC + frac, offset })
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.internal())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
