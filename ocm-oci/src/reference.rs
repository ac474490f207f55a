//! Loose OCI reference parsing.
//!
//! Accepts `<registry>/<repository>[:tag][@digest]` with an optional
//! registry (CTF-backed stores resolve against the synthetic host
//! `ctf.ocm.software`) and, unlike strict parsers, keeps the tag when a
//! digest is also present.

use std::fmt;

use crate::{COMPONENT_DESCRIPTOR_PREFIX, CTF_REGISTRY, Error, Result};

/// Maximum length of an OCI tag.
const MAX_TAG_LEN: usize = 128;

/// A parsed loose OCI reference.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct OciReference {
    /// Registry hostname; `None` resolves against [`CTF_REGISTRY`].
    pub registry: Option<String>,
    /// Repository path, e.g. `component-descriptors/ocm.software/app`.
    pub repository: String,
    /// Tag, preserved even when a digest is present.
    pub tag: Option<String>,
    /// Content digest, `<algo>:<hex>`.
    pub digest: Option<String>,
}

impl OciReference {
    /// Parses a loose reference string.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidReference("empty reference".into()));
        }

        // Split off @digest first; the digest itself contains a ':'.
        let (name, digest) = match trimmed.split_once('@') {
            Some((n, d)) => {
                if !is_digest(d) {
                    return Err(Error::InvalidDigest(d.to_owned()));
                }
                (n, Some(d.to_owned()))
            }
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag.
        let (name, tag) = match name.rsplit_once(':') {
            Some((head, t)) if !t.contains('/') => {
                if !is_valid_tag(t) {
                    return Err(Error::InvalidReference(format!("invalid tag {t:?}")));
                }
                (head, Some(t.to_owned()))
            }
            _ => (name, None),
        };

        // The first segment is a registry if it looks like a hostname.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry(first) => {
                (Some(first.to_owned()), rest.to_owned())
            }
            _ => (None, name.to_owned()),
        };

        if repository.is_empty() || !is_valid_repository(&repository) {
            return Err(Error::InvalidReference(format!(
                "invalid repository {repository:?}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Builds the component-version reference
    /// `component-descriptors/<component>:<version>`.
    pub fn component_version(component: &str, version: &str) -> Result<Self> {
        Self::parse(&format!(
            "{COMPONENT_DESCRIPTOR_PREFIX}/{component}:{version}"
        ))
    }

    /// Registry to contact, substituting the synthetic CTF host.
    pub fn registry_or_default(&self) -> &str {
        self.registry.as_deref().unwrap_or(CTF_REGISTRY)
    }

    /// Tag or digest used to resolve the reference, digest preferred.
    pub fn version_part(&self) -> Option<&str> {
        self.digest.as_deref().or(self.tag.as_deref())
    }
}

impl fmt::Display for OciReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref registry) = self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Returns `true` for strings of the form `<algo>:<hex>`.
pub fn is_digest(s: &str) -> bool {
    match s.split_once(':') {
        Some((algo, hex)) => {
            !algo.is_empty()
                && algo
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && !hex.is_empty()
                && hex
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

/// Enforces the OCI tag grammar `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn is_valid_tag(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    s.len() <= MAX_TAG_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Enforces the distribution-spec repository form: slash-separated
/// segments of lowercase alphanumerics joined by `.`, `_`, or `-`.
pub fn is_valid_repository(s: &str) -> bool {
    !s.is_empty()
        && s.split('/').all(|segment| {
            !segment.is_empty()
                && segment.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && segment.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        })
}

/// Returns `true` if the first path segment names a registry host.
fn is_registry(s: &str) -> bool {
    (s.contains('.') || s.contains(':') || s == "localhost") && !s.contains('_')
        && s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_reference() {
        let r = OciReference::parse("ghcr.io/acme/app:v1").unwrap();
        assert_eq!(r.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(r.repository, "acme/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn parse_without_registry() {
        let r = OciReference::parse("component-descriptors/ocm.software/app:v1.0.0").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.registry_or_default(), CTF_REGISTRY);
        assert_eq!(r.repository, "component-descriptors/ocm.software/app");
        assert_eq!(r.tag.as_deref(), Some("v1.0.0"));
    }

    #[test]
    fn tag_preserved_with_digest() {
        let r = OciReference::parse(
            "ghcr.io/acme/app:v1@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        )
        .unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert!(r.digest.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(r.to_string(), format!("ghcr.io/acme/app:v1@{}", r.digest.as_deref().unwrap()));
    }

    #[test]
    fn localhost_with_port() {
        let r = OciReference::parse("localhost:5000/test:v1").unwrap();
        assert_eq!(r.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(r.repository, "test");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn invalid_tags_rejected() {
        assert!(OciReference::parse("repo:.bad").is_err());
        assert!(OciReference::parse("repo:-bad").is_err());
        assert!(OciReference::parse(&format!("repo:{}", "a".repeat(129))).is_err());
        assert!(is_valid_tag(&"a".repeat(128)));
        assert!(is_valid_tag("_tag"));
        assert!(is_valid_tag("v1.0.0-rc.1"));
    }

    #[test]
    fn invalid_repository_rejected() {
        assert!(OciReference::parse("UPPER/case:v1").is_err());
        assert!(OciReference::parse("bad-/segment:v1").is_err());
        assert!(is_valid_repository("a/b/c"));
        assert!(is_valid_repository("component-descriptors/ocm.software/app"));
    }

    #[test]
    fn malformed_digest_rejected() {
        assert!(OciReference::parse("repo@nocolon").is_err());
        assert!(OciReference::parse("repo@sha256:UPPER").is_err());
    }

    #[test]
    fn component_version_convention() {
        let r = OciReference::component_version("ocm.software/app", "v1.0.0").unwrap();
        assert_eq!(r.repository, "component-descriptors/ocm.software/app");
        assert_eq!(r.tag.as_deref(), Some("v1.0.0"));
    }
}
