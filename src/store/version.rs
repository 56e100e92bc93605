//! Content-hash version tokens.
//!
//! A token is the SHA-256 of a file's bytes, so any byte-level change to the file, made
//! through the service or behind its back, produces a different token.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::catalog::types::Category;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CAS check. Must run while the category lock is held and before anything is mutated.
pub fn check(category: Category, expected: &VersionToken, current: &VersionToken) -> Result<()> {
    if expected != current {
        tracing::warn!(
            "Rejecting write to {}: caller saw {}, file is at {}",
            category,
            expected,
            current
        );
        return Err(Error::StaleVersion {
            category,
            expected: expected.clone(),
            current: current.clone(),
        });
    }
    Ok(())
}
