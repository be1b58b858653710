//! Asset version numbers
//!
//! Assets carry a strict three-part semantic version (`MAJOR.MINOR.PATCH`).
//! Versions only move forward: an accepted push bumps the patch component,
//! an explicit publish may jump to any greater version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::SyncError;

/// Version every new asset starts at
pub const INITIAL_VERSION: &str = "1.0.0";

/// A version string that is not exactly `MAJOR.MINOR.PATCH`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version format: {0:?}")]
pub struct InvalidVersion(pub String);

impl From<InvalidVersion> for SyncError {
    fn from(err: InvalidVersion) -> Self {
        SyncError::InvalidVersion(err.0)
    }
}

/// Semantic version with numeric components only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Create a new version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Next patch release (`2.3.9` -> `2.3.10`). `None` once the patch
    /// component is exhausted.
    pub fn bump_patch(&self) -> Option<Self> {
        Some(Self {
            patch: self.patch.checked_add(1)?,
            ..*self
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_string());

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            // u64::from_str accepts a leading '+', semver does not
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

/// Parse `current` and return its patch bump as a string.
pub fn bump_patch(current: &str) -> Result<String, InvalidVersion> {
    current
        .parse::<Version>()?
        .bump_patch()
        .map(|next| next.to_string())
        .ok_or_else(|| InvalidVersion(current.to_string()))
}
