//! Fully-qualified container image references.
//!
//! The controller never builds or pushes images; it only needs to carry a
//! reference around, compare it, and derive a default workload name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference: {0}")]
    Invalid(String),
    #[error("unsupported digest algorithm in {0} (expected sha256)")]
    UnsupportedDigest(String),
}

/// Tag or content digest pinning an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImageVersion {
    Tag(String),
    /// `sha256:<64 hex chars>`.
    Digest(String),
}

/// registry/name:tag or registry/name@sha256:digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub version: ImageVersion,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageRefError::Empty);
        }
        if reference.contains(char::is_whitespace) {
            return Err(ImageRefError::Invalid(reference.to_string()));
        }

        let (path, version) = if let Some((path, digest)) = reference.split_once('@') {
            (path, ImageVersion::Digest(parse_digest(digest)?))
        } else {
            // A ':' after the last '/' separates the tag; earlier ones are registry ports.
            let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
            match reference[last_slash..].rsplit_once(':') {
                Some((_, tag)) if tag.is_empty() => {
                    return Err(ImageRefError::Invalid(reference.to_string()));
                }
                Some((name, tag)) => (
                    &reference[..last_slash + name.len()],
                    ImageVersion::Tag(tag.to_string()),
                ),
                None => (reference, ImageVersion::Tag("latest".to_string())),
            }
        };

        let (registry, repository) = match path.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, path.to_string()),
        };

        if repository.is_empty()
            || repository.starts_with('/')
            || repository.ends_with('/')
            || repository.contains("//")
        {
            return Err(ImageRefError::Invalid(reference.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            version,
        })
    }

    /// Last path segment of the repository, used as the default workload name.
    pub fn name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.version {
            ImageVersion::Tag(t) => Some(t),
            ImageVersion::Digest(_) => None,
        }
    }

    /// Same repository and registry, different version.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            version: ImageVersion::Tag(tag.to_string()),
        }
    }
}

fn parse_digest(digest: &str) -> Result<String, ImageRefError> {
    let Some(hex_part) = digest.strip_prefix("sha256:") else {
        return Err(ImageRefError::UnsupportedDigest(digest.to_string()));
    };
    match hex::decode(hex_part) {
        Ok(bytes) if bytes.len() == 32 => Ok(digest.to_ascii_lowercase()),
        _ => Err(ImageRefError::Invalid(digest.to_string())),
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        match &self.version {
            ImageVersion::Tag(tag) => write!(f, ":{tag}"),
            ImageVersion::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

impl FromStr for ImageRef {
    type Err = ImageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ImageRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}
