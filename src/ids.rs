//! Identifiers and versions for patch log entries.

use std::{fmt, str::FromStr};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a patch.
///
/// Ids are compared by value. [`PatchId::NIL`] is reserved to mean
/// "no entry" (for example the head of an empty log) and is never assigned
/// to a real patch by [`PatchId::random`].
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchId([u8; 16]);

impl PatchId {
    /// The reserved "no entry" sentinel (all zero bytes).
    pub const NIL: PatchId = PatchId([0u8; 16]);

    /// Create a fresh random [`PatchId`], using the passed in randomness.
    pub fn random<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        PatchId(bytes)
    }

    /// Create a [`PatchId`] from a byte array.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PatchId(bytes)
    }

    /// Get the byte representation of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this is the reserved [`PatchId::NIL`] sentinel.
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchId({})", hex::encode(self.0))
    }
}

impl FromStr for PatchId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidId)?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| InvalidId)?;
        Ok(PatchId(bytes))
    }
}

/// The string is not the external form of a [`PatchId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid patch id, expected 32 hex characters")]
pub struct InvalidId;

/// Version of an entry in a patch log.
///
/// Versions are assigned by the log on append: the first committed patch
/// gets [`Version::FIRST`], and each successful append increments by
/// exactly one. Versions are never reused and never skipped.
///
/// Two reserved values exist outside the assignable range:
/// [`Version::UNSET`] (no version assigned) and [`Version::INIT`] (log
/// created but empty).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(i64);

impl Version {
    /// No version assigned.
    pub const UNSET: Version = Version(-1);
    /// The log exists but holds no patches.
    pub const INIT: Version = Version(0);
    /// The version of the first committed patch.
    pub const FIRST: Version = Version(1);

    /// Create a version from its numeric value.
    ///
    /// `-1` and `0` map to the [`Version::UNSET`] and [`Version::INIT`]
    /// sentinels; anything below returns `None`.
    pub fn new(value: i64) -> Option<Version> {
        (value >= Self::UNSET.0).then_some(Version(value))
    }

    /// The numeric value of this version.
    pub fn value(self) -> i64 {
        self.0
    }

    /// Whether this is an assignable version rather than a sentinel.
    pub fn is_valid(self) -> bool {
        self.0 >= Self::FIRST.0
    }

    /// The version after this one. [`Version::INIT`] increments to
    /// [`Version::FIRST`].
    ///
    /// # Panics
    ///
    /// Panics on [`Version::UNSET`]; incrementing an unset version is a
    /// logic error in the caller.
    pub fn inc(self) -> Version {
        assert!(
            self != Self::UNSET,
            "attempt to increment the unset version"
        );
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::UNSET => write!(f, "unset"),
            Version::INIT => write!(f, "init"),
            Version(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(Version::UNSET),
            "init" => Ok(Version::INIT),
            _ => {
                let value: i64 = s.parse().map_err(|_| InvalidVersion)?;
                Version::new(value).ok_or(InvalidVersion)
            }
        }
    }
}

/// The string is not the external form of a [`Version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid version")]
pub struct InvalidVersion;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let mut rng = rand::thread_rng();
        let id = PatchId::random(&mut rng);
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<PatchId>().unwrap(), id);
        assert!("not hex".parse::<PatchId>().is_err());
        assert!("abcd".parse::<PatchId>().is_err());
    }

    #[test]
    fn test_id_nil() {
        assert!(PatchId::NIL.is_nil());
        assert!(PatchId::default().is_nil());
        let mut rng = rand::thread_rng();
        assert!(!PatchId::random(&mut rng).is_nil());
    }

    #[test]
    fn test_version_sentinels() {
        assert!(!Version::UNSET.is_valid());
        assert!(!Version::INIT.is_valid());
        assert!(Version::FIRST.is_valid());
        assert_eq!(Version::INIT.inc(), Version::FIRST);
        assert_eq!(Version::FIRST.inc(), Version::new(2).unwrap());
        assert!(Version::UNSET < Version::INIT);
        assert!(Version::INIT < Version::FIRST);
    }

    #[test]
    #[should_panic]
    fn test_version_inc_unset() {
        let _ = Version::UNSET.inc();
    }

    #[test]
    fn test_version_display_parse() {
        assert_eq!(Version::UNSET.to_string(), "unset");
        assert_eq!(Version::INIT.to_string(), "init");
        assert_eq!(Version::new(7).unwrap().to_string(), "7");
        assert_eq!("unset".parse::<Version>().unwrap(), Version::UNSET);
        assert_eq!("init".parse::<Version>().unwrap(), Version::INIT);
        assert_eq!("7".parse::<Version>().unwrap(), Version::new(7).unwrap());
        assert!("-5".parse::<Version>().is_err());
        assert!("seven".parse::<Version>().is_err());
    }
}
