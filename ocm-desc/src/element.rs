//! Element metadata shared by resources, sources, and references.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Label, Result, TypedSpec};

/// Identity key reserved for the element name.
pub const IDENTITY_NAME: &str = "name";
/// Identity key reserved for the element version.
pub const IDENTITY_VERSION: &str = "version";

/// The identity of an element or component version.
///
/// An identity is the union of `{name, version}` and the element's
/// `extraIdentity` map. The sorted-map representation makes identities
/// directly usable as lookup keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(BTreeMap<String, String>);

impl Identity {
    /// Builds an identity from a name and version pair.
    pub fn new(name: &str, version: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(IDENTITY_NAME.to_owned(), name.to_owned());
        map.insert(IDENTITY_VERSION.to_owned(), version.to_owned());
        Self(map)
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the `name` entry, if present.
    pub fn name(&self) -> Option<&str> {
        self.get(IDENTITY_NAME)
    }

    /// Returns the `version` entry, if present.
    pub fn version(&self) -> Option<&str> {
        self.get(IDENTITY_VERSION)
    }

    /// Inserts an additional identity attribute.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_owned(), value.to_owned());
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Metadata common to every resource, source, and reference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMeta {
    /// Element name, unique together with version and extra identity.
    pub name: String,
    /// Element version; empty until defaulted to the component version.
    #[serde(default)]
    pub version: String,
    /// Arbitrary labels attached to the element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    /// Additional identity attributes; must not contain the key `name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_identity: BTreeMap<String, String>,
}

impl ElementMeta {
    /// Creates metadata with just a name and version.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: version.to_owned(),
            ..Self::default()
        }
    }

    /// Returns the full identity of the element.
    pub fn identity(&self) -> Identity {
        let mut id = Identity::new(&self.name, &self.version);
        for (k, v) in &self.extra_identity {
            id.insert(k, v);
        }
        id
    }

    /// Checks the structural rules for element metadata.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("element name must not be empty".into()));
        }
        if self.extra_identity.contains_key(IDENTITY_NAME) {
            return Err(Error::Validation(format!(
                "extraIdentity of {:?} must not contain the key {IDENTITY_NAME:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// How a resource relates to the component shipping it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ResourceRelation {
    /// The artifact is delivered inside the component.
    Local,
    /// The artifact is a pointer to a third-party location.
    External,
}

/// Digest of an artifact or normalized descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSpec {
    /// Hash algorithm, e.g. `SHA-256`.
    pub hash_algorithm: String,
    /// Normalization applied before hashing, e.g. `jsonNormalisation/v4alpha1`.
    pub normalisation_algorithm: String,
    /// Lower-hex digest value.
    pub value: String,
}

/// Selector tying a resource to the sources it was built from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Identity attributes matched against source identities.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub identity_selector: BTreeMap<String, String>,
    /// Labels describing the relationship.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// A deliverable artifact of a component version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Common element metadata.
    #[serde(flatten)]
    pub meta: ElementMeta,
    /// Artifact type, e.g. `ociImage` or `blob`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Relation of the artifact to the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<ResourceRelation>,
    /// Sources this resource was produced from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_refs: Vec<SourceRef>,
    /// Content digest of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
    /// Artifact size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// RFC 3339 creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
    /// Where the artifact lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<TypedSpec>,
}

impl Resource {
    /// Creates a resource with the given metadata and type.
    pub fn new(meta: ElementMeta, resource_type: &str) -> Self {
        Self {
            meta,
            resource_type: resource_type.to_owned(),
            relation: None,
            source_refs: Vec::new(),
            digest: None,
            size: None,
            creation_time: None,
            access: None,
        }
    }
}

/// An input that produced one or more resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Common element metadata.
    #[serde(flatten)]
    pub meta: ElementMeta,
    /// Source type, e.g. `git`.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Where the source lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<TypedSpec>,
}

impl Source {
    /// Creates a source with the given metadata and type.
    pub fn new(meta: ElementMeta, source_type: &str) -> Self {
        Self {
            meta,
            source_type: source_type.to_owned(),
            access: None,
        }
    }
}

/// A pointer to another component version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Common element metadata.
    #[serde(flatten)]
    pub meta: ElementMeta,
    /// Name of the referenced component.
    pub component: String,
    /// Canonical normalized digest of the referenced descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
}

impl Reference {
    /// Creates a reference to `component` with the given metadata.
    pub fn new(meta: ElementMeta, component: &str) -> Self {
        Self {
            meta,
            component: component.to_owned(),
            digest: None,
        }
    }

    /// Identity of the component version this reference points at.
    pub fn component_identity(&self) -> Identity {
        Identity::new(&self.component, &self.meta.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_union() {
        let mut meta = ElementMeta::new("img", "v1");
        meta.extra_identity.insert("arch".into(), "amd64".into());
        let id = meta.identity();
        assert_eq!(id.get("name"), Some("img"));
        assert_eq!(id.get("version"), Some("v1"));
        assert_eq!(id.get("arch"), Some("amd64"));
        assert_eq!(id.to_string(), "arch=amd64,name=img,version=v1");
    }

    #[test]
    fn extra_identity_rejects_name_key() {
        let mut meta = ElementMeta::new("img", "v1");
        meta.extra_identity.insert("name".into(), "other".into());
        assert!(meta.validate().is_err());
    }

    #[test]
    fn empty_name_rejected() {
        assert!(ElementMeta::new("", "v1").validate().is_err());
    }

    #[test]
    fn meta_roundtrip_json() {
        let mut meta = ElementMeta::new("img", "v1");
        meta.extra_identity.insert("os".into(), "linux".into());
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("extraIdentity"));
        let back: ElementMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
