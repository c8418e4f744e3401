//! Container image references
//!
//! Parses `name[:tag]` and `scheme://name[:tag]` strings into a name, tag and
//! optional registry scheme.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KilnError, Result};

/// Tag used when a reference does not carry one
pub const DEFAULT_TAG: &str = "latest";

/// Scheme used for remote references that do not name one
pub const DEFAULT_SCHEME: &str = "docker";

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    name: String,
    tag: String,
    scheme: Option<String>,
}

impl ImageReference {
    /// Parses a local reference
    ///
    /// # Arguments
    /// * `reference` - `name` or `name:tag`
    /// * `tag` - Explicit tag; must not be combined with a tag inside `reference`
    pub fn parse(reference: &str, tag: Option<&str>) -> Result<Self> {
        let (name, tag) = split_tag(reference, tag)?;
        Ok(Self {
            name,
            tag,
            scheme: None,
        })
    }

    /// Parses a remote reference, stripping a leading `scheme://`
    pub fn parse_remote(reference: &str, tag: Option<&str>) -> Result<Self> {
        let (scheme, rest) = match reference.split_once("://") {
            Some((scheme, rest)) => {
                if !is_valid_scheme(scheme) {
                    return Err(KilnError::invalid_reference(
                        reference,
                        format!("unrecognized scheme '{}'", scheme),
                    ));
                }
                (scheme.to_string(), rest)
            }
            None => (DEFAULT_SCHEME.to_string(), reference),
        };

        let (name, tag) = split_tag(rest, tag)?;
        Ok(Self {
            name,
            tag,
            scheme: Some(scheme),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Registry scheme, present only for remote references
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// `name:tag`, as understood by the primary container runtime
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    /// `scheme://name:tag`, as understood by the alternate runtime
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME),
            self.name,
            self.tag
        )
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Splits `name[:tag]`, honouring registry ports (`host:5000/repo`)
fn split_tag(reference: &str, explicit_tag: Option<&str>) -> Result<(String, String)> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(KilnError::invalid_reference(reference, "empty reference"));
    }
    if reference.chars().any(char::is_whitespace) {
        return Err(KilnError::invalid_reference(
            reference,
            "reference contains whitespace",
        ));
    }

    if reference.contains('@') {
        return Err(KilnError::invalid_reference(
            reference,
            "digest references are not supported",
        ));
    }

    let (name, tag) = match explicit_tag {
        Some(_) if reference.contains(':') => {
            return Err(KilnError::invalid_reference(
                reference,
                "tag given both inline and as a separate argument",
            ));
        }
        Some(tag) => (reference, tag),
        // A colon followed by a path segment is a registry port, not a tag
        None => match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (reference, DEFAULT_TAG),
        },
    };

    if name.is_empty() {
        return Err(KilnError::invalid_reference(reference, "empty image name"));
    }
    if tag.is_empty() {
        return Err(KilnError::invalid_reference(reference, "empty tag"));
    }

    Ok((name.to_string(), tag.to_string()))
}

fn is_valid_scheme(scheme: &str) -> bool {
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
