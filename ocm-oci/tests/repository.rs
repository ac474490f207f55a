//! Component repository round-trips over a directory CTF.

use std::sync::Arc;

use ocm_ctf::AccessMode;
use ocm_desc::{
    ComponentDescriptor, ElementMeta, Identity, LocalBlobAccess, OciImageAccess, Provider,
    Resource, ResourceRelation,
};
use ocm_oci::{
    Blob, ComponentRepository as _, CtfArchive, ListingPolicy, MEDIA_TYPE_ARTIFACT_SET,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_OCTET_STREAM, OciComponentRepository,
    OciImageManifest, OciResourceRepository, OciStore as _, ResourceRepository as _,
};

async fn repository(dir: &std::path::Path) -> (Arc<CtfArchive>, OciComponentRepository) {
    let archive = CtfArchive::open(dir.join("ctf"), AccessMode::ReadWrite)
        .await
        .unwrap();
    let repo = OciComponentRepository::new(Arc::new(Arc::clone(&archive)));
    (archive, repo)
}

fn descriptor(name: &str, version: &str) -> ComponentDescriptor {
    ComponentDescriptor::new(name, version, Provider::named("acme"))
}

#[tokio::test]
async fn add_then_get_component_version() {
    let dir = tempfile::tempdir().unwrap();
    let (_archive, repo) = repository(dir.path()).await;

    let mut desc = descriptor("ocm.software/app", "v1.0.0");
    let mut res = Resource::new(ElementMeta::new("image", "v1.0.0"), "ociImage");
    res.relation = Some(ResourceRelation::External);
    res.access = Some(OciImageAccess::spec("ghcr.io/acme/app:v1").unwrap());
    desc.component.resources.push(res);

    repo.add_component_version(&desc).await.unwrap();
    assert!(repo
        .has_component_version("ocm.software/app", "v1.0.0")
        .await
        .unwrap());

    let back = repo
        .get_component_version("ocm.software/app", "v1.0.0")
        .await
        .unwrap();
    assert_eq!(back, desc);

    assert!(!repo
        .has_component_version("ocm.software/app", "v9.9.9")
        .await
        .unwrap());
}

#[tokio::test]
async fn local_resource_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (_archive, repo) = repository(dir.path()).await;

    let resource = Resource::new(ElementMeta::new("config", "v1.0.0"), "blob");
    let blob = Blob::new(b"test data".to_vec(), None);
    let stored = repo
        .add_local_resource("ocm.software/app", "v1.0.0", &resource, blob)
        .await
        .unwrap();

    let access = stored.access.as_ref().unwrap();
    let local: LocalBlobAccess = access.decode().unwrap();
    assert_eq!(local.media_type, MEDIA_TYPE_OCTET_STREAM);
    assert_eq!(
        local.local_reference,
        "sha256:916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
    );
    assert_eq!(stored.size, Some(9));

    let mut desc = descriptor("ocm.software/app", "v1.0.0");
    desc.component.resources.push(stored.clone());
    repo.add_component_version(&desc).await.unwrap();

    let (found, data) = repo
        .get_local_resource(
            "ocm.software/app",
            "v1.0.0",
            &Identity::new("config", "v1.0.0"),
        )
        .await
        .unwrap();
    assert_eq!(found, stored);
    assert_eq!(data, b"test data");
}

#[tokio::test]
async fn version_listing_referrers_and_tags_agree() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, repo) = repository(dir.path()).await;

    for version in ["v1.0.0", "v0.2.0", "v2.0.0-rc.1", "v2.0.0"] {
        repo.add_component_version(&descriptor("ocm.software/app", version))
            .await
            .unwrap();
    }
    // Another component in the same archive does not leak in.
    repo.add_component_version(&descriptor("ocm.software/other", "v5.0.0"))
        .await
        .unwrap();

    let by_referrers = repo
        .list_component_versions("ocm.software/app")
        .await
        .unwrap();
    assert_eq!(by_referrers, vec!["v2.0.0", "v2.0.0-rc.1", "v1.0.0", "v0.2.0"]);

    let tag_repo = OciComponentRepository::new(Arc::new(archive))
        .with_listing_policy(ListingPolicy::TagOnly);
    let by_tags = tag_repo
        .list_component_versions("ocm.software/app")
        .await
        .unwrap();
    assert_eq!(by_tags, by_referrers);
}

#[tokio::test]
async fn replace_moves_version_tag() {
    let dir = tempfile::tempdir().unwrap();
    let (_archive, repo) = repository(dir.path()).await;

    let first = descriptor("ocm.software/app", "v1.0.0");
    repo.add_component_version(&first).await.unwrap();

    let mut second = descriptor("ocm.software/app", "v1.0.0");
    second
        .component
        .labels
        .push(ocm_desc::Label::new("rebuilt", serde_json::json!(true)));
    repo.add_component_version(&second).await.unwrap();

    let resolved = repo
        .get_component_version("ocm.software/app", "v1.0.0")
        .await
        .unwrap();
    assert_eq!(resolved, second);
}

/// Seeds a minimal single-layer image under `repository` and returns its
/// manifest digest.
async fn seed_image(archive: &Arc<CtfArchive>, repository: &str, tag: &str) -> String {
    let store = archive.store(repository);

    let layer = Blob::new(b"layer-bytes".to_vec(), Some("application/vnd.oci.image.layer.v1.tar+gzip".into()));
    let config = Blob::new(br#"{"architecture":"amd64"}"#.to_vec(), Some("application/vnd.oci.image.config.v1+json".into()));
    let manifest = OciImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.into()),
        artifact_type: None,
        config: config.descriptor(),
        layers: vec![layer.descriptor()],
        subject: None,
        annotations: None,
    };
    let manifest_blob = Blob::new(
        serde_json::to_vec(&manifest).unwrap(),
        Some(MEDIA_TYPE_IMAGE_MANIFEST.into()),
    );

    store.push(&layer.descriptor(), layer.data().to_vec()).await.unwrap();
    store.push(&config.descriptor(), config.data().to_vec()).await.unwrap();
    store
        .push(&manifest_blob.descriptor(), manifest_blob.data().to_vec())
        .await
        .unwrap();
    store.tag(&manifest_blob.descriptor(), tag).await.unwrap();
    manifest_blob.digest().to_owned()
}

#[tokio::test]
async fn by_value_download_upload_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let archive = CtfArchive::open(dir.path().join("ctf"), AccessMode::ReadWrite)
        .await
        .unwrap();
    let digest = seed_image(&archive, "acme/app", "v1").await;

    let transfer = OciResourceRepository::new(Arc::new(Arc::clone(&archive)));
    let mut resource = Resource::new(ElementMeta::new("image", "v1"), "ociImage");
    resource.access = Some(OciImageAccess::spec("acme/app:v1").unwrap());

    let blob = transfer.download_resource(&resource).await.unwrap();
    assert_eq!(blob.media_type(), Some(MEDIA_TYPE_ARTIFACT_SET));

    // Push the artifact set to a different repository and resolve it there.
    let mut target = Resource::new(ElementMeta::new("image", "v1"), "ociImage");
    target.access = Some(OciImageAccess::spec("mirror/app:v1").unwrap());
    transfer.upload_resource(&target, blob).await.unwrap();

    let mirror = archive.store("mirror/app");
    let resolved = mirror.resolve("v1").await.unwrap();
    assert_eq!(resolved.digest, digest);
}

#[tokio::test]
async fn process_resource_digest_pins_access() {
    let dir = tempfile::tempdir().unwrap();
    let archive = CtfArchive::open(dir.path().join("ctf"), AccessMode::ReadWrite)
        .await
        .unwrap();
    let digest = seed_image(&archive, "acme/app", "v1").await;

    let transfer = OciResourceRepository::new(Arc::new(archive));
    let mut resource = Resource::new(ElementMeta::new("image", "v1"), "ociImage");
    resource.access = Some(OciImageAccess::spec("acme/app:v1").unwrap());

    let processed = transfer.process_resource_digest(resource).await.unwrap();
    let spec = processed.digest.as_ref().unwrap();
    assert_eq!(spec.hash_algorithm, "SHA-256");
    assert_eq!(spec.normalisation_algorithm, "genericBlobDigest/v1");
    assert_eq!(format!("sha256:{}", spec.value), digest);

    let access: OciImageAccess = processed.access.as_ref().unwrap().decode().unwrap();
    assert_eq!(access.image_reference, format!("acme/app:v1@{digest}"));

    // A second pass is a no-op.
    let again = transfer
        .process_resource_digest(processed.clone())
        .await
        .unwrap();
    assert_eq!(again, processed);
}
