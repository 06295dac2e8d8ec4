//! Image reference parsing.
//!
//! References use the `{host}[:{port}]/{repo}[:{tag}]` form, e.g.
//! `ghcr.io/stargz-containers/node:13.13.0-esgz`. The repository may contain
//! `/`; the tag is the last colon-separated component after the final `/`,
//! so registry ports are never mistaken for tags. A missing tag defaults to
//! `latest`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StargzError};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, possibly with a port (e.g. `localhost:5000`).
    pub registry: String,
    /// Repository path within the registry (may contain `/`).
    pub repository: String,
    /// Tag, defaulting to `latest` when absent.
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string.
    pub fn parse(s: &str) -> Result<Self> {
        let (registry, rest) = s.split_once('/').ok_or_else(|| invalid(s))?;
        if registry.is_empty() || rest.is_empty() {
            return Err(invalid(s));
        }

        // A trailing @digest never participates in tag detection.
        let rest = rest.split_once('@').map(|(head, _)| head).unwrap_or(rest);

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.is_empty() => (repo, tag),
            Some(_) => return Err(invalid(s)),
            None => (rest, "latest"),
        };

        if repository.is_empty() {
            return Err(invalid(s));
        }

        Ok(ImageReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

fn invalid(s: &str) -> StargzError {
    StargzError::InvalidImageRef {
        reference: s.to_string(),
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = StargzError;

    fn from_str(s: &str) -> Result<Self> {
        ImageReference::parse(s)
    }
}
