//! End-to-end mirror runs over in-memory registries

use docker_image_mirror::image::config::ImageConfig;
use docker_image_mirror::image::manifest::{
    MEDIA_TYPE_MANIFEST_LIST, Manifest, ManifestDescriptor, ManifestList, Platform,
};
use docker_image_mirror::image::resolve::PlatformFilter;
use docker_image_mirror::logging::Logger;
use docker_image_mirror::mirror::mapping::parse_args;
use docker_image_mirror::mirror::{Mirror, MirrorOptions};
use docker_image_mirror::registry::{MemoryRegistries, MemoryRegistry, TagService};
use regex::Regex;
use std::sync::Arc;

fn mirror(registries: &MemoryRegistries, options: MirrorOptions) -> Mirror {
    let providers = Arc::new(registries.clone());
    Mirror::new(providers.clone(), providers, None, options, Logger::new_quiet())
}

fn demo_image(registry: &MemoryRegistry) -> docker_image_mirror::image::Digest {
    registry
        .put_image(
            "demo",
            "latest",
            &ImageConfig::scratch("linux", "amd64"),
            &[b"layer one".to_vec(), b"layer two".to_vec()],
        )
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copies_every_blob_then_the_manifest() {
    let registries = MemoryRegistries::new();
    let source = registries.registry("registry-a.local");
    let target = registries.registry("registry-b.local");
    let digest = demo_image(&source);

    let mappings = parse_args(&["registry-a.local/demo:latest=registry-b.local/demo:stable"]).unwrap();
    let mirror = mirror(&registries, MirrorOptions::default());

    let plan = mirror.plan(&mappings).await.unwrap();
    assert_eq!(plan.stats().blobs, 3);
    assert_eq!(plan.stats().manifests, 1);

    let summary = mirror.run(&mappings).await.unwrap();
    assert_eq!(summary.blobs_copied, 3);
    assert_eq!(summary.manifests, 1);
    assert_eq!(target.upload_count(), 3);

    let tagged = TagService::get(&target.repository("demo"), "stable").await.unwrap();
    assert_eq!(tagged.digest, digest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_uploads_nothing() {
    let registries = MemoryRegistries::new();
    let source = registries.registry("registry-a.local");
    let target = registries.registry("registry-b.local");
    let digest = demo_image(&source);

    let mappings = parse_args(&[
        "registry-a.local/demo:latest=registry-b.local/demo:stable",
        "registry-a.local/demo:latest=registry-b.local/other:stable",
    ])
    .unwrap();
    let mirror = mirror(&registries, MirrorOptions::default());

    mirror.run(&mappings).await.unwrap();
    let uploads = target.upload_count();
    let mounts = target.mount_count();

    let again = mirror.run(&mappings).await.unwrap();
    assert_eq!(target.upload_count(), uploads);
    assert_eq!(target.mount_count(), mounts);
    assert_eq!(again.blobs_copied, 0);
    assert_eq!(again.blobs_mounted, 0);
    assert_eq!(again.blobs_skipped, 6);

    for repository in ["demo", "other"] {
        let tagged = TagService::get(&target.repository(repository), "stable").await.unwrap();
        assert_eq!(tagged.digest, digest);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_without_matching_platforms_is_skipped() {
    let registries = MemoryRegistries::new();
    let source = registries.registry("registry-a.local");
    let target = registries.registry("registry-b.local");

    let child = source
        .put_image("multi", "arm64", &ImageConfig::scratch("linux", "arm64"), &[b"arm layer".to_vec()])
        .unwrap();
    let child_manifest = {
        use docker_image_mirror::registry::ManifestService;
        ManifestService::get(&source.repository("multi"), &child).await.unwrap()
    };
    let list = Manifest::from_list(ManifestList {
        schema_version: 2,
        media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
        manifests: vec![ManifestDescriptor {
            descriptor: child_manifest.descriptor(),
            platform: Platform::new("linux", "arm64"),
        }],
    })
    .unwrap();
    source.put_manifest("multi", &list, Some("latest")).unwrap();

    let options = MirrorOptions {
        filter: PlatformFilter::Pattern(Regex::new("^linux/amd64$").unwrap()),
        ..Default::default()
    };
    let mappings = parse_args(&["registry-a.local/multi:latest=registry-b.local/multi:latest"]).unwrap();
    let mirror = mirror(&registries, options);

    let plan = mirror.plan(&mappings).await.unwrap();
    assert!(plan.is_empty());
    assert!(plan.errors().is_empty());

    let summary = mirror.run(&mappings).await.unwrap();
    assert_eq!(summary.manifests, 0);
    assert_eq!(target.upload_count(), 0);
    assert_eq!(target.manifest_put_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_leaves_the_destination_untouched() {
    let registries = MemoryRegistries::new();
    let source = registries.registry("registry-a.local");
    let target = registries.registry("registry-b.local");
    demo_image(&source);

    let options = MirrorOptions {
        dry_run: true,
        ..Default::default()
    };
    let mappings = parse_args(&["registry-a.local/demo:latest=registry-b.local/demo:stable"]).unwrap();
    let summary = mirror(&registries, options).run(&mappings).await.unwrap();

    assert_eq!(summary.manifests, 1);
    assert_eq!(target.upload_count(), 0);
    assert!(TagService::get(&target.repository("demo"), "stable").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_source_tag_fails_planning() {
    let registries = MemoryRegistries::new();
    demo_image(&registries.registry("registry-a.local"));

    let mappings = parse_args(&["registry-a.local/demo:missing=registry-b.local/demo:stable"]).unwrap();
    assert!(mirror(&registries, MirrorOptions::default()).plan(&mappings).await.is_err());

    let lenient = MirrorOptions {
        skip_missing: true,
        ..Default::default()
    };
    let plan = mirror(&registries, lenient).plan(&mappings).await.unwrap();
    assert!(plan.is_empty());
}
