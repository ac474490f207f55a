//! The constructor document: a declarative list of components to build.

use std::collections::HashSet;

use ocm_desc::{
    ElementMeta, Identity, Label, Provider, Reference, ResourceRelation, SourceRef, TypedSpec,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether an external access is copied into the target or kept remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CopyPolicy {
    /// Download the artifact and re-store it as a colocated local blob.
    #[serde(rename = "byValue")]
    ByValue,
    /// Keep the access as a remote pointer.
    #[serde(rename = "byReference")]
    ByReference,
}

/// A resource to be constructed.
///
/// Exactly one of `access` and `input` must be present: an access points at
/// an existing artifact, an input is a recipe producing one during
/// construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Common element metadata.
    #[serde(flatten)]
    pub meta: ElementMeta,
    /// Artifact type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Relation of the artifact to the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<ResourceRelation>,
    /// Sources this resource was produced from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_refs: Vec<SourceRef>,
    /// Where an existing artifact lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<TypedSpec>,
    /// How to produce the artifact during construction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<TypedSpec>,
    /// Copy behavior for external accesses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_policy: Option<CopyPolicy>,
}

/// A source to be constructed; the simpler sibling of [`ResourceSpec`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Common element metadata.
    #[serde(flatten)]
    pub meta: ElementMeta,
    /// Source type.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Where an existing input lives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<TypedSpec>,
    /// How to produce the input during construction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<TypedSpec>,
}

/// One component of a constructor document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructorComponent {
    /// Component name.
    pub name: String,
    /// Component version.
    pub version: String,
    /// Shipping entity.
    pub provider: Provider,
    /// Labels attached to the component version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    /// Resources to construct.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
    /// Sources to construct.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSpec>,
    /// References to other component versions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl ConstructorComponent {
    /// Identity of the component version being constructed.
    pub fn identity(&self) -> Identity {
        Identity::new(&self.name, &self.version)
    }
}

/// A constructor document: the list of components to build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Constructor {
    /// Components to build, in declaration order.
    #[serde(default)]
    pub components: Vec<ConstructorComponent>,
}

impl Constructor {
    /// Decodes a constructor from YAML and validates it.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let constructor: Self = serde_yaml::from_slice(data)?;
        constructor.validate()?;
        Ok(constructor)
    }

    /// Decodes a constructor from JSON and validates it.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let constructor: Self = serde_json::from_slice(data)?;
        constructor.validate()?;
        Ok(constructor)
    }

    /// Checks the structural rules of the document.
    pub fn validate(&self) -> Result<()> {
        let mut component_identities = HashSet::new();
        for component in &self.components {
            if component.name.is_empty() || component.version.is_empty() {
                return Err(Error::Validation(
                    "component name and version must not be empty".into(),
                ));
            }
            if !component_identities.insert(component.identity()) {
                return Err(Error::Validation(format!(
                    "duplicate component {}:{} in constructor",
                    component.name, component.version
                )));
            }
            validate_component(component)?;
        }
        Ok(())
    }
}

fn validate_component(component: &ConstructorComponent) -> Result<()> {
    let mut identities = HashSet::new();
    for resource in &component.resources {
        resource.meta.validate()?;
        match (&resource.access, &resource.input) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(format!(
                    "resource {:?} of {} has both access and input",
                    resource.meta.name, component.name
                )));
            }
            (None, None) => {
                return Err(Error::Validation(format!(
                    "resource {:?} of {} has neither access nor input",
                    resource.meta.name, component.name
                )));
            }
            _ => {}
        }
        if resource.input.is_some() && resource.copy_policy == Some(CopyPolicy::ByReference) {
            return Err(Error::Validation(format!(
                "resource {:?} of {} combines an input with copyPolicy byReference",
                resource.meta.name, component.name
            )));
        }
        if !identities.insert(resource.meta.identity()) {
            return Err(Error::Validation(format!(
                "duplicate resource identity {} in {}",
                resource.meta.identity(),
                component.name
            )));
        }
    }

    identities.clear();
    for source in &component.sources {
        source.meta.validate()?;
        match (&source.access, &source.input) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(format!(
                    "source {:?} of {} has both access and input",
                    source.meta.name, component.name
                )));
            }
            (None, None) => {
                return Err(Error::Validation(format!(
                    "source {:?} of {} has neither access nor input",
                    source.meta.name, component.name
                )));
            }
            _ => {}
        }
        if !identities.insert(source.meta.identity()) {
            return Err(Error::Validation(format!(
                "duplicate source identity {} in {}",
                source.meta.identity(),
                component.name
            )));
        }
    }

    identities.clear();
    for reference in &component.references {
        reference.meta.validate()?;
        if reference.component.is_empty() {
            return Err(Error::Validation(format!(
                "reference {:?} of {} names no component",
                reference.meta.name, component.name
            )));
        }
        if !identities.insert(reference.meta.identity()) {
            return Err(Error::Validation(format!(
                "duplicate reference identity {} in {}",
                reference.meta.identity(),
                component.name
            )));
        }
    }
    Ok(())
}
