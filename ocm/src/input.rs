//! Pluggable input methods.
//!
//! An input method turns a typed input specification into either raw blob
//! data (uploaded as a colocated local blob) or a fully processed element.
//! Methods are looked up by the input `type` discriminator in an
//! [`InputMethodRegistry`] built by explicit registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ocm_desc::{Identity, Resource, Source};
use ocm_oci::Blob;
use serde::Deserialize;

use crate::constructor::{ResourceSpec, SourceSpec};
use crate::{Error, Result};

/// Input type reading a file from the local filesystem.
pub const INPUT_TYPE_FILE: &str = "file";
/// Input type embedding literal text.
pub const INPUT_TYPE_UTF8: &str = "utf8";

/// Credential attributes handed to an input method.
pub type Credentials = BTreeMap<String, String>;

/// Resolves credentials for a consumer identity.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Returns credentials for `identity`; `Ok(None)` means no credentials
    /// are configured, and processing proceeds without them.
    async fn resolve(&self, identity: &Identity) -> Result<Option<Credentials>>;
}

/// Outcome of running an input method.
#[derive(Debug)]
#[non_exhaustive]
pub enum InputResult<T> {
    /// Raw data to upload as a local blob.
    Blob(Blob),
    /// A fully processed element with its access already set.
    Processed(Box<T>),
}

/// Produces resource payloads from typed input specifications.
#[async_trait]
pub trait ResourceInputMethod: Send + Sync {
    /// Identity under which the method consumes credentials, if any.
    fn credential_identity(&self, _resource: &ResourceSpec) -> Option<Identity> {
        None
    }

    /// Runs the method against a resource specification.
    async fn process_resource(
        &self,
        resource: &ResourceSpec,
        credentials: Option<&Credentials>,
    ) -> Result<InputResult<Resource>>;
}

/// Produces source payloads from typed input specifications.
#[async_trait]
pub trait SourceInputMethod: Send + Sync {
    /// Identity under which the method consumes credentials, if any.
    fn credential_identity(&self, _source: &SourceSpec) -> Option<Identity> {
        None
    }

    /// Runs the method against a source specification.
    async fn process_source(
        &self,
        source: &SourceSpec,
        credentials: Option<&Credentials>,
    ) -> Result<InputResult<Source>>;
}

/// Registry mapping input type discriminators to methods.
#[derive(Default)]
pub struct InputMethodRegistry {
    resources: HashMap<String, Arc<dyn ResourceInputMethod>>,
    sources: HashMap<String, Arc<dyn SourceInputMethod>>,
}

impl std::fmt::Debug for InputMethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMethodRegistry")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InputMethodRegistry {
    /// Registry with the built-in `file` and `utf8` methods registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        let file = Arc::new(FileInput);
        let utf8 = Arc::new(Utf8Input);
        registry.register_resource_method(INPUT_TYPE_FILE, Arc::clone(&file) as _);
        registry.register_resource_method(INPUT_TYPE_UTF8, Arc::clone(&utf8) as _);
        registry.register_source_method(INPUT_TYPE_FILE, file as _);
        registry.register_source_method(INPUT_TYPE_UTF8, utf8 as _);
        registry
    }

    /// Registers a resource input method under a type base name.
    pub fn register_resource_method(
        &mut self,
        input_type: &str,
        method: Arc<dyn ResourceInputMethod>,
    ) {
        self.resources.insert(input_type.to_owned(), method);
    }

    /// Registers a source input method under a type base name.
    pub fn register_source_method(&mut self, input_type: &str, method: Arc<dyn SourceInputMethod>) {
        self.sources.insert(input_type.to_owned(), method);
    }

    /// Looks up the resource method for an input discriminator.
    pub fn resource_method(&self, input_type: &str) -> Result<Arc<dyn ResourceInputMethod>> {
        self.resources
            .get(base_type(input_type))
            .cloned()
            .ok_or_else(|| Error::UnknownInputType(input_type.to_owned()))
    }

    /// Looks up the source method for an input discriminator.
    pub fn source_method(&self, input_type: &str) -> Result<Arc<dyn SourceInputMethod>> {
        self.sources
            .get(base_type(input_type))
            .cloned()
            .ok_or_else(|| Error::UnknownInputType(input_type.to_owned()))
    }
}

fn base_type(input_type: &str) -> &str {
    input_type.split('/').next().unwrap_or(input_type)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInputSpec {
    path: String,
    #[serde(default)]
    media_type: Option<String>,
}

/// Built-in `file` input: reads a file into a blob.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileInput;

impl FileInput {
    async fn read(&self, spec: &ocm_desc::TypedSpec) -> Result<Blob> {
        let spec: FileInputSpec = spec.decode()?;
        let data = tokio::fs::read(&spec.path).await?;
        tracing::debug!(path = %spec.path, size = data.len(), "read file input");
        Ok(Blob::new(data, spec.media_type))
    }
}

#[async_trait]
impl ResourceInputMethod for FileInput {
    async fn process_resource(
        &self,
        resource: &ResourceSpec,
        _credentials: Option<&Credentials>,
    ) -> Result<InputResult<Resource>> {
        let input = resource
            .input
            .as_ref()
            .ok_or_else(|| Error::Validation("file input method needs an input".into()))?;
        Ok(InputResult::Blob(self.read(input).await?))
    }
}

#[async_trait]
impl SourceInputMethod for FileInput {
    async fn process_source(
        &self,
        source: &SourceSpec,
        _credentials: Option<&Credentials>,
    ) -> Result<InputResult<Source>> {
        let input = source
            .input
            .as_ref()
            .ok_or_else(|| Error::Validation("file input method needs an input".into()))?;
        Ok(InputResult::Blob(self.read(input).await?))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Utf8InputSpec {
    text: String,
    #[serde(default)]
    media_type: Option<String>,
}

/// Built-in `utf8` input: embeds literal text as a blob.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Input;

impl Utf8Input {
    fn blob(spec: &ocm_desc::TypedSpec) -> Result<Blob> {
        let spec: Utf8InputSpec = spec.decode()?;
        Ok(Blob::new(spec.text.into_bytes(), spec.media_type))
    }
}

#[async_trait]
impl ResourceInputMethod for Utf8Input {
    async fn process_resource(
        &self,
        resource: &ResourceSpec,
        _credentials: Option<&Credentials>,
    ) -> Result<InputResult<Resource>> {
        let input = resource
            .input
            .as_ref()
            .ok_or_else(|| Error::Validation("utf8 input method needs an input".into()))?;
        Ok(InputResult::Blob(Self::blob(input)?))
    }
}

#[async_trait]
impl SourceInputMethod for Utf8Input {
    async fn process_source(
        &self,
        source: &SourceSpec,
        _credentials: Option<&Credentials>,
    ) -> Result<InputResult<Source>> {
        let input = source
            .input
            .as_ref()
            .ok_or_else(|| Error::Validation("utf8 input method needs an input".into()))?;
        Ok(InputResult::Blob(Self::blob(input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocm_desc::{ElementMeta, TypedSpec};

    fn resource_with_input(input: TypedSpec) -> ResourceSpec {
        ResourceSpec {
            meta: ElementMeta::new("r", "v1"),
            resource_type: "blob".into(),
            relation: None,
            source_refs: Vec::new(),
            access: None,
            input: Some(input),
            copy_policy: None,
        }
    }

    #[tokio::test]
    async fn utf8_input_produces_blob() {
        let spec: TypedSpec =
            serde_json::from_str(r#"{"type":"utf8","text":"hello","mediaType":"text/plain"}"#)
                .unwrap();
        let registry = InputMethodRegistry::with_defaults();
        let method = registry.resource_method("utf8").unwrap();
        let result = method
            .process_resource(&resource_with_input(spec), None)
            .await
            .unwrap();
        match result {
            InputResult::Blob(blob) => {
                assert_eq!(blob.data(), b"hello");
                assert_eq!(blob.media_type(), Some("text/plain"));
            }
            InputResult::Processed(_) => panic!("expected a blob"),
        }
    }

    #[tokio::test]
    async fn file_input_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"file content").await.unwrap();

        let spec: TypedSpec = serde_json::from_str(&format!(
            r#"{{"type":"file/v1","path":{:?}}}"#,
            path.to_str().unwrap()
        ))
        .unwrap();
        let registry = InputMethodRegistry::with_defaults();
        // Versioned discriminators resolve to their base method.
        let method = registry.resource_method("file/v1").unwrap();
        let result = method
            .process_resource(&resource_with_input(spec), None)
            .await
            .unwrap();
        match result {
            InputResult::Blob(blob) => assert_eq!(blob.data(), b"file content"),
            InputResult::Processed(_) => panic!("expected a blob"),
        }
    }

    #[test]
    fn unknown_input_type_is_an_error() {
        let registry = InputMethodRegistry::with_defaults();
        assert!(matches!(
            registry.resource_method("helm"),
            Err(Error::UnknownInputType(_))
        ));
    }
}
