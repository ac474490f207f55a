//! Canonical descriptor normalization (`jsonNormalisation/v4alpha1`).
//!
//! The canonical form is the descriptor serialized as compact JSON with
//! object keys sorted, after removing everything that may legitimately
//! differ between two equivalent copies of the same component version:
//! creation timestamps, repository contexts, and labels not flagged as
//! signing-relevant. Reference digests are SHA-256 over these bytes.

use sha2::{Digest as _, Sha256};

use crate::{ComponentDescriptor, DigestSpec, Label, Result};

/// Hash algorithm name recorded in digest specs.
pub const HASH_ALGORITHM_SHA256: &str = "SHA-256";
/// Normalization algorithm implemented by this module.
pub const NORMALISATION_V4ALPHA1: &str = "jsonNormalisation/v4alpha1";
/// Normalization name for plain content digests of blobs.
pub const GENERIC_BLOB_DIGEST_V1: &str = "genericBlobDigest/v1";

/// Returns the canonical byte form of a descriptor.
pub fn canonical_bytes_v4alpha1(desc: &ComponentDescriptor) -> Result<Vec<u8>> {
    let mut desc = desc.clone();
    desc.component.creation_time = None;
    desc.component.repository_contexts.clear();
    retain_signing(&mut desc.component.labels);
    retain_signing(&mut desc.component.provider.labels);
    for resource in &mut desc.component.resources {
        resource.creation_time = None;
        retain_signing(&mut resource.meta.labels);
    }
    for source in &mut desc.component.sources {
        retain_signing(&mut source.meta.labels);
    }
    for reference in &mut desc.component.references {
        retain_signing(&mut reference.meta.labels);
    }

    // serde_json's default map is ordered, so Value round-tripping yields
    // sorted object keys.
    let value = serde_json::to_value(&desc)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Computes the canonical normalized digest of a descriptor.
pub fn digest_v4alpha1(desc: &ComponentDescriptor) -> Result<DigestSpec> {
    let bytes = canonical_bytes_v4alpha1(desc)?;
    Ok(DigestSpec {
        hash_algorithm: HASH_ALGORITHM_SHA256.to_owned(),
        normalisation_algorithm: NORMALISATION_V4ALPHA1.to_owned(),
        value: sha256_hex(&bytes),
    })
}

/// Lower-hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256:<hex>` content digest of a byte slice.
pub fn content_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(data))
}

fn retain_signing(labels: &mut Vec<Label>) {
    labels.retain(|l| l.signing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Provider;

    #[test]
    fn volatile_fields_do_not_affect_digest() {
        let mut a = ComponentDescriptor::new("ocm.software/app", "v1", Provider::named("acme"));
        let mut b = a.clone();
        a.component.creation_time = Some("2026-01-01T00:00:00Z".into());
        b.component.creation_time = Some("2026-06-01T12:00:00Z".into());
        b.component
            .repository_contexts
            .push(serde_json::json!({"type": "ociRegistry", "baseUrl": "ghcr.io"}));

        assert_eq!(
            digest_v4alpha1(&a).unwrap().value,
            digest_v4alpha1(&b).unwrap().value
        );
    }

    #[test]
    fn non_signing_labels_excluded() {
        let mut a = ComponentDescriptor::new("ocm.software/app", "v1", Provider::named("acme"));
        let mut b = a.clone();
        a.component
            .labels
            .push(Label::new("build-host", serde_json::json!("ci-7")));

        assert_eq!(
            digest_v4alpha1(&a).unwrap().value,
            digest_v4alpha1(&b).unwrap().value
        );

        let mut signing = Label::new("release", serde_json::json!(true));
        signing.signing = true;
        b.component.labels.push(signing);
        assert_ne!(
            digest_v4alpha1(&a).unwrap().value,
            digest_v4alpha1(&b).unwrap().value
        );
    }

    #[test]
    fn digest_spec_shape() {
        let desc = ComponentDescriptor::new("ocm.software/app", "v1", Provider::named("acme"));
        let digest = digest_v4alpha1(&desc).unwrap();
        assert_eq!(digest.hash_algorithm, HASH_ALGORITHM_SHA256);
        assert_eq!(digest.normalisation_algorithm, NORMALISATION_V4ALPHA1);
        assert_eq!(digest.value.len(), 64);
    }

    #[test]
    fn known_content_digest() {
        assert_eq!(
            content_digest(b"test"),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
