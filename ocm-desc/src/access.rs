//! Typed access and input specifications.
//!
//! Accesses, inputs, and repository contexts are deeply polymorphic: each
//! carries a `type` discriminator of the form `name` or `name/version`.
//! [`TypedSpec`] keeps the body as raw JSON so unknown types round-trip
//! untouched; [`AccessSchemes`] maps known discriminators to typed views.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Access type for artifacts stored in an OCI registry.
pub const ACCESS_TYPE_OCI_IMAGE: &str = "ociImage";
/// Access type for blobs colocated with their component version.
pub const ACCESS_TYPE_LOCAL_BLOB: &str = "localBlob";

/// A typed specification with an opaque body.
///
/// The `type` field discriminates; all remaining fields are preserved
/// verbatim, so a spec of an unknown type survives decode → encode without
/// loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedSpec {
    /// Discriminator, `name` or `name/version`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining fields, untouched.
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl TypedSpec {
    /// Builds a spec of the given kind from any serializable body.
    pub fn encode<T: Serialize>(kind: &str, body: &T) -> Result<Self> {
        match serde_json::to_value(body)? {
            serde_json::Value::Object(data) => Ok(Self {
                kind: kind.to_owned(),
                data,
            }),
            other => Err(Error::Validation(format!(
                "typed spec body must be an object, got {other}"
            ))),
        }
    }

    /// Decodes the body into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.data.clone(),
        ))?)
    }

    /// Returns `true` if the discriminator names `kind`, ignoring a
    /// trailing `/version` suffix.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind || self.kind.split('/').next() == Some(kind)
    }

    /// Returns the string stored under `field`, if present.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(serde_json::Value::as_str)
    }
}

/// Access to an artifact stored as an OCI image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageAccess {
    /// Image reference, `<registry>/<repository>[:tag][@digest]`.
    pub image_reference: String,
}

impl OciImageAccess {
    /// Wraps an image reference into a typed spec.
    pub fn spec(image_reference: &str) -> Result<TypedSpec> {
        TypedSpec::encode(
            ACCESS_TYPE_OCI_IMAGE,
            &Self {
                image_reference: image_reference.to_owned(),
            },
        )
    }
}

/// Access to a blob stored next to its component version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBlobAccess {
    /// Media type of the blob content.
    pub media_type: String,
    /// Digest of the blob inside the component's repository.
    pub local_reference: String,
    /// Optional globally resolvable access to the same content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_access: Option<TypedSpec>,
}

impl LocalBlobAccess {
    /// Converts the access into its typed-spec form.
    pub fn into_spec(self) -> Result<TypedSpec> {
        TypedSpec::encode(ACCESS_TYPE_LOCAL_BLOB, &self)
    }
}

/// A decoded access specification.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum AccessKind {
    /// An OCI image reference.
    OciImage(OciImageAccess),
    /// A colocated blob.
    LocalBlob(LocalBlobAccess),
    /// Any type without a registered decoder, kept raw.
    Raw(TypedSpec),
}

type Decoder = fn(&TypedSpec) -> Result<AccessKind>;

/// Registry mapping access discriminators to decoders.
///
/// Built by explicit registration; there are no import-time side effects.
#[derive(Debug, Default)]
pub struct AccessSchemes {
    decoders: HashMap<String, Decoder>,
}

impl AccessSchemes {
    /// Returns a registry with the built-in access types registered.
    pub fn with_defaults() -> Self {
        let mut schemes = Self::default();
        schemes.register(ACCESS_TYPE_OCI_IMAGE, |spec| {
            Ok(AccessKind::OciImage(spec.decode()?))
        });
        schemes.register(ACCESS_TYPE_LOCAL_BLOB, |spec| {
            Ok(AccessKind::LocalBlob(spec.decode()?))
        });
        schemes
    }

    /// Registers a decoder for a discriminator base name.
    pub fn register(&mut self, kind: &str, decode: Decoder) {
        self.decoders.insert(kind.to_owned(), decode);
    }

    /// Decodes a spec, falling back to [`AccessKind::Raw`] for unknown types.
    pub fn decode(&self, spec: &TypedSpec) -> Result<AccessKind> {
        let base = spec.kind.split('/').next().unwrap_or(&spec.kind);
        match self.decoders.get(base) {
            Some(decode) => decode(spec),
            None => Ok(AccessKind::Raw(spec.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_roundtrips_untouched() {
        let json = r#"{"type":"s3/v1","bucket":"b","key":"k","region":"eu"}"#;
        let spec: TypedSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, "s3/v1");
        let back = serde_json::to_value(&spec).unwrap();
        let orig: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(back, orig);
    }

    #[test]
    fn typed_views_decode() {
        let spec = OciImageAccess::spec("ghcr.io/acme/app:v1").unwrap();
        assert!(spec.is(ACCESS_TYPE_OCI_IMAGE));
        let access: OciImageAccess = spec.decode().unwrap();
        assert_eq!(access.image_reference, "ghcr.io/acme/app:v1");
    }

    #[test]
    fn versioned_discriminator_matches_base() {
        let mut spec = OciImageAccess::spec("r/x:v1").unwrap();
        spec.kind = "ociImage/v1".into();
        assert!(spec.is(ACCESS_TYPE_OCI_IMAGE));
    }

    #[test]
    fn schemes_decode_known_and_raw() {
        let schemes = AccessSchemes::with_defaults();
        let known = schemes
            .decode(&OciImageAccess::spec("r/x:v1").unwrap())
            .unwrap();
        assert!(matches!(known, AccessKind::OciImage(_)));

        let raw: TypedSpec =
            serde_json::from_str(r#"{"type":"helm/v1","chart":"c"}"#).unwrap();
        assert!(matches!(schemes.decode(&raw).unwrap(), AccessKind::Raw(_)));
    }

    #[test]
    fn local_blob_spec_fields() {
        let spec = LocalBlobAccess {
            media_type: "application/octet-stream".into(),
            local_reference: "sha256:abc".into(),
            global_access: None,
        }
        .into_spec()
        .unwrap();
        assert_eq!(spec.get_str("localReference"), Some("sha256:abc"));
        assert_eq!(spec.get_str("mediaType"), Some("application/octet-stream"));
    }
}
