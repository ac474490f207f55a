//! The component descriptor record.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::element::{Identity, Reference, Resource, Source};
use crate::{Error, Result};

/// Descriptor schema version emitted and accepted by this toolchain.
pub const SCHEMA_VERSION_V2: &str = "v2";

/// A label with a raw value and signing relevance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Raw JSON/YAML value.
    pub value: serde_json::Value,
    /// Optional format version of the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether the label participates in signing-relevant normalization.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub signing: bool,
}

impl Label {
    /// Creates a non-signing label with the given value.
    pub fn new(name: &str, value: serde_json::Value) -> Self {
        Self {
            name: name.to_owned(),
            value,
            version: None,
            signing: false,
        }
    }
}

/// The entity shipping a component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Provider name.
    pub name: String,
    /// Labels attached to the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl Provider {
    /// Creates a provider with just a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            labels: Vec::new(),
        }
    }
}

/// The component half of a descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Component name, a lowercase DNS-style path.
    pub name: String,
    /// Component version.
    pub version: String,
    /// Shipping entity.
    pub provider: Provider,
    /// RFC 3339 creation timestamp; excluded from normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,
    /// Labels attached to the component version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    /// Deliverable artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// Inputs the artifacts were produced from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    /// Pointers to other component versions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
    /// Repositories this descriptor passed through; excluded from
    /// normalization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repository_contexts: Vec<serde_json::Value>,
}

/// The canonical record of a component version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescriptor {
    /// Descriptor schema version, `v2`.
    pub schema_version: String,
    /// The described component version.
    pub component: Component,
}

impl ComponentDescriptor {
    /// Creates an empty descriptor for `name`:`version`.
    pub fn new(name: &str, version: &str, provider: Provider) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V2.to_owned(),
            component: Component {
                name: name.to_owned(),
                version: version.to_owned(),
                provider,
                creation_time: None,
                labels: Vec::new(),
                resources: Vec::new(),
                sources: Vec::new(),
                references: Vec::new(),
                repository_contexts: Vec::new(),
            },
        }
    }

    /// Identity of the described component version.
    pub fn identity(&self) -> Identity {
        Identity::new(&self.component.name, &self.component.version)
    }

    /// Checks schema version, element rules, and identity uniqueness.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION_V2 {
            return Err(Error::SchemaVersion(self.schema_version.clone()));
        }
        if self.component.name.is_empty() || self.component.version.is_empty() {
            return Err(Error::Validation(
                "component name and version must not be empty".into(),
            ));
        }

        ensure_unique(
            "resource",
            &self.component.name,
            self.component.resources.iter().map(|r| {
                r.meta.validate()?;
                Ok(r.meta.identity())
            }),
        )?;
        ensure_unique(
            "source",
            &self.component.name,
            self.component.sources.iter().map(|s| {
                s.meta.validate()?;
                Ok(s.meta.identity())
            }),
        )?;
        ensure_unique(
            "reference",
            &self.component.name,
            self.component.references.iter().map(|r| {
                r.meta.validate()?;
                Ok(r.meta.identity())
            }),
        )?;
        Ok(())
    }

    /// Finds a resource by its full identity.
    pub fn resource(&self, identity: &Identity) -> Option<&Resource> {
        self.component
            .resources
            .iter()
            .find(|r| &r.meta.identity() == identity)
    }

    /// Finds a source by its full identity.
    pub fn source(&self, identity: &Identity) -> Option<&Source> {
        self.component
            .sources
            .iter()
            .find(|s| &s.meta.identity() == identity)
    }

    /// Serializes to compact JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let desc: Self = serde_json::from_slice(data)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    /// Deserializes from YAML.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let desc: Self = serde_yaml::from_slice(data)?;
        desc.validate()?;
        Ok(desc)
    }
}

/// Fails with [`Error::DuplicateIdentity`] if any identity repeats.
fn ensure_unique(
    kind: &'static str,
    component: &str,
    identities: impl Iterator<Item = Result<Identity>>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for identity in identities {
        let identity = identity?;
        if !seen.insert(identity.clone()) {
            return Err(Error::DuplicateIdentity {
                kind,
                identity: identity.to_string(),
                component: component.to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementMeta, Reference};
    use crate::{OciImageAccess, Resource};

    fn sample() -> ComponentDescriptor {
        let mut desc = ComponentDescriptor::new("ocm.software/app", "v1.0.0", Provider::named("acme"));
        let mut res = Resource::new(ElementMeta::new("image", "v1.0.0"), "ociImage");
        res.access = Some(OciImageAccess::spec("ghcr.io/acme/app:v1").unwrap());
        desc.component.resources.push(res);
        desc.component
            .references
            .push(Reference::new(ElementMeta::new("base", "v0.1.0"), "ocm.software/base"));
        desc
    }

    #[test]
    fn json_roundtrip() {
        let desc = sample();
        let json = desc.to_json().unwrap();
        let back = ComponentDescriptor::from_json(&json).unwrap();
        assert_eq!(desc, back);
    }

    #[test]
    fn yaml_roundtrip() {
        let desc = sample();
        let yaml = desc.to_yaml().unwrap();
        let back = ComponentDescriptor::from_yaml(&yaml).unwrap();
        assert_eq!(desc, back);
    }

    #[test]
    fn duplicate_resource_identity_rejected() {
        let mut desc = sample();
        let dup = desc.component.resources[0].clone();
        desc.component.resources.push(dup);
        let err = desc.validate().unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { kind: "resource", .. }));
    }

    #[test]
    fn distinct_extra_identity_allowed() {
        let mut desc = sample();
        let mut second = desc.component.resources[0].clone();
        second.meta.extra_identity.insert("arch".into(), "arm64".into());
        desc.component.resources.push(second);
        desc.validate().unwrap();
    }

    #[test]
    fn wrong_schema_version_rejected() {
        let mut desc = sample();
        desc.schema_version = "v3".into();
        assert!(matches!(desc.validate(), Err(Error::SchemaVersion(_))));
    }
}
