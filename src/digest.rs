//! Content-addressed blob digests.
//!
//! A [`ContentDigest`] is the `algorithm:hex` identifier a registry uses to
//! name an immutable byte sequence (e.g. `sha256:4f53cd…`). The newtype
//! validates the shape on construction so every digest flowing through the
//! library is well-formed; invalid input fails with `INVALID_DIGEST`.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{Result, StargzError};

/// A validated `algorithm:hex` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Parse and validate a digest string.
    ///
    /// Accepts `sha256` (64 hex digits) and `sha512` (128 hex digits).
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let (algorithm, encoded) = s.split_once(':').ok_or_else(|| invalid(s))?;

        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(invalid(s)),
        };

        if encoded.len() != expected_len || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid(s));
        }

        Ok(ContentDigest(s.to_string()))
    }

    /// Compute the sha256 digest of an in-memory byte sequence.
    pub fn from_bytes(data: &[u8]) -> Self {
        ContentDigest(format!("sha256:{:x}", Sha256::digest(data)))
    }

    /// The algorithm part (e.g. `sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The hex-encoded part after the colon.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or("")
    }

    /// Full `algorithm:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated form for log output (`sha256:` plus 12 hex digits).
    pub fn short(&self) -> &str {
        let end = self.0.len().min(self.algorithm().len() + 1 + 12);
        &self.0[..end]
    }
}

fn invalid(s: &str) -> StargzError {
    StargzError::InvalidDigest {
        digest: s.to_string(),
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentDigest {
    type Err = StargzError;

    fn from_str(s: &str) -> Result<Self> {
        ContentDigest::parse(s)
    }
}

impl AsRef<str> for ContentDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
