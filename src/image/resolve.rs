//! Manifest resolution
//!
//! Turns an image reference into concrete manifests: tags are resolved to
//! digests, manifest lists are narrowed by a [`PlatformFilter`], and image
//! configs are recovered from schema2 config blobs or schema1 history.
//! Pushing goes through [`put_manifest_in_compatible_schema`], which falls
//! back to a signed schema1 manifest for registries that reject schema2.

use crate::error::{CODE_MANIFEST_INVALID, RegistryError, Result};
use crate::image::config::{ContainerConfig, History, ImageConfig, RootFs};
use crate::image::digest::{Digest, GZIPPED_EMPTY_LAYER, GZIPPED_EMPTY_LAYER_DIGEST};
use crate::image::manifest::{
    Descriptor, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST_LIST, Manifest,
    ManifestDescriptor, ManifestList, Platform,
};
use crate::image::reference::ImageReference;
use crate::image::schema1;
use crate::registry::{BlobService, Repository};
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;

const DEFAULT_OS: &str = "linux";
const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Selects which images of a manifest list are used
#[derive(Debug, Clone, Default)]
pub enum PlatformFilter {
    /// Keep every image
    All,
    /// Keep images whose `os/arch[/variant]` matches
    Pattern(Regex),
    /// `linux/amd64`, consulted only when a list has more than one image
    #[default]
    Default,
}

impl PlatformFilter {
    /// Build a filter from an optional `--filter-by-os` expression
    pub fn from_pattern(pattern: Option<&str>) -> Result<Self> {
        match pattern {
            None | Some("") => Ok(PlatformFilter::Default),
            Some(".*") => Ok(PlatformFilter::All),
            Some(pattern) => Regex::new(pattern)
                .map(PlatformFilter::Pattern)
                .map_err(|e| RegistryError::Validation(format!("invalid platform filter: {}", e))),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PlatformFilter::All)
    }

    pub fn includes(&self, platform: &Platform, has_multiple: bool) -> bool {
        match self {
            PlatformFilter::All => true,
            PlatformFilter::Pattern(re) => re.is_match(&platform.display_name()),
            PlatformFilter::Default => {
                !has_multiple
                    || (platform.os == DEFAULT_OS && platform.architecture == DEFAULT_ARCHITECTURE)
            }
        }
    }

    fn select<'a>(&self, children: &'a [ManifestDescriptor]) -> Vec<&'a ManifestDescriptor> {
        let has_multiple = children.len() > 1;
        children
            .iter()
            .filter(|child| self.includes(&child.platform, has_multiple))
            .collect()
    }
}

/// Where a resolved manifest was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub manifest: Digest,
    /// The list the manifest was selected from, if any
    pub manifest_list: Option<Digest>,
}

impl Location {
    pub fn is_list(&self) -> bool {
        self.manifest_list.is_some()
    }
}

/// Result of narrowing a manifest for push
#[derive(Debug, Clone)]
pub struct ProcessedManifest {
    /// Child manifests that must exist before `manifest` is pushed
    pub children: Vec<Manifest>,
    pub manifest: Manifest,
    pub digest: Digest,
}

/// Digest named by `reference`, resolving its tag when no digest is given
pub async fn resolve_digest(reference: &ImageReference, repo: &dyn Repository) -> Result<Digest> {
    if let Some(digest) = &reference.digest {
        return Ok(digest.clone());
    }
    let tag = reference.tag.as_deref().unwrap_or("latest");
    Ok(repo.tags().get(tag).await?.digest)
}

/// Resolve `reference` to a single image manifest
pub async fn first_manifest(
    reference: &ImageReference,
    repo: &dyn Repository,
    filter: &PlatformFilter,
) -> Result<(Manifest, Location)> {
    let digest = resolve_digest(reference, repo).await?;
    let manifests = repo.manifests();
    let manifest = manifests.get(&digest).await?;

    let list = match manifest {
        Manifest::List(list) => list,
        other => {
            return Ok((
                other,
                Location {
                    manifest: digest,
                    manifest_list: None,
                },
            ));
        }
    };

    let selected = filter.select(&list.value.manifests);
    match selected.as_slice() {
        [] => Err(RegistryError::AllImagesFiltered(reference.to_string())),
        [child] => {
            tracing::debug!(
                list = %digest,
                child = %child.descriptor.digest,
                platform = %child.platform.display_name(),
                "selected image from manifest list"
            );
            let child_digest = child.descriptor.digest.clone();
            let child_manifest = manifests.get(&child_digest).await?;
            Ok((
                child_manifest,
                Location {
                    manifest: child_digest,
                    manifest_list: Some(digest),
                },
            ))
        }
        many => Err(RegistryError::Validation(format!(
            "{} images in {} match the platform filter ({}), use a narrower filter",
            many.len(),
            reference,
            many.iter()
                .map(|c| c.platform.display_name())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Resolve `reference` to every image it names, without filtering
pub async fn all_manifests(
    reference: &ImageReference,
    repo: &dyn Repository,
) -> Result<(Vec<(Digest, Manifest)>, Location)> {
    let digest = resolve_digest(reference, repo).await?;
    let manifests = repo.manifests();
    let manifest = manifests.get(&digest).await?;

    let list = match manifest {
        Manifest::List(list) => list,
        other => {
            return Ok((
                vec![(digest.clone(), other)],
                Location {
                    manifest: digest,
                    manifest_list: None,
                },
            ));
        }
    };

    let mut children = Vec::with_capacity(list.value.manifests.len());
    for child in &list.value.manifests {
        let child_digest = child.descriptor.digest.clone();
        let child_manifest = manifests.get(&child_digest).await?;
        children.push((child_digest, child_manifest));
    }
    Ok((
        children,
        Location {
            manifest: digest.clone(),
            manifest_list: Some(digest),
        },
    ))
}

/// Narrow `manifest` for push. Returns `None` when every image of a list
/// was filtered out.
pub async fn process_manifest_list(
    digest: &Digest,
    manifest: Manifest,
    repo: &dyn Repository,
    filter: &PlatformFilter,
    keep_list: bool,
) -> Result<Option<ProcessedManifest>> {
    let list = match manifest {
        Manifest::List(list) => list,
        other => {
            return Ok(Some(ProcessedManifest {
                children: Vec::new(),
                manifest: other,
                digest: digest.clone(),
            }));
        }
    };

    let selected: Vec<ManifestDescriptor> = filter
        .select(&list.value.manifests)
        .into_iter()
        .cloned()
        .collect();
    if selected.is_empty() {
        tracing::debug!(%digest, "no image in manifest list matched the filter");
        return Ok(None);
    }

    let manifests = repo.manifests();
    let mut children = Vec::with_capacity(selected.len());
    for child in &selected {
        children.push(manifests.get(&child.descriptor.digest).await?);
    }

    if children.len() == 1 && !keep_list {
        let child_digest = selected[0].descriptor.digest.clone();
        let child = children.remove(0);
        return Ok(Some(ProcessedManifest {
            children: Vec::new(),
            manifest: child,
            digest: child_digest,
        }));
    }

    if selected.len() == list.value.manifests.len() {
        return Ok(Some(ProcessedManifest {
            children,
            digest: digest.clone(),
            manifest: Manifest::List(list),
        }));
    }

    let filtered = Manifest::from_list(ManifestList {
        schema_version: 2,
        media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
        manifests: selected,
    })?;
    let filtered_digest = filtered.digest();
    tracing::debug!(from = %digest, to = %filtered_digest, "rewrote filtered manifest list");
    Ok(Some(ProcessedManifest {
        children,
        manifest: filtered,
        digest: filtered_digest,
    }))
}

#[derive(Deserialize)]
struct CompatSize {
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(default)]
    throwaway: bool,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    author: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    container_config: Option<CompatContainerConfig>,
}

#[derive(Deserialize)]
struct CompatContainerConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

/// Recover the image config and layers (oldest first) behind `manifest`
pub async fn manifest_to_image_config(
    manifest: &Manifest,
    blobs: &dyn BlobService,
) -> Result<(ImageConfig, Vec<Descriptor>)> {
    match manifest {
        Manifest::Schema2(m) => {
            let config_desc = &m.value.config;
            if config_desc.media_type != MEDIA_TYPE_IMAGE_CONFIG {
                return Err(RegistryError::Validation(format!(
                    "config blob {} has unsupported media type {}",
                    config_desc.digest, config_desc.media_type
                )));
            }
            let raw = blobs.get(&config_desc.digest).await?;
            let mut config: ImageConfig = serde_json::from_slice(&raw)?;
            let layers = m.value.layers.clone();
            config.size = layers.iter().map(|l| l.size).sum();
            Ok((config, layers))
        }
        Manifest::Schema1(m) => {
            let history = &m.value.history;
            let top = history.first().ok_or_else(|| {
                RegistryError::Validation("schema1 manifest has no history".to_string())
            })?;
            let mut config: ImageConfig = serde_json::from_str(&top.v1_compatibility)?;
            for key in ["id", "parent", "Size", "throwaway", "container", "container_config"] {
                config.extra.remove(key);
            }
            if config.config.is_none() {
                config.config = Some(ContainerConfig::default());
            }

            let mut layers = Vec::new();
            let mut entries = Vec::new();
            let mut rootfs = RootFs::default();
            // schema1 orders layers youngest first
            for (fs_layer, compat) in m.value.fs_layers.iter().zip(history).rev() {
                let compat: CompatSize = serde_json::from_str(&compat.v1_compatibility)?;
                let created_by = compat
                    .container_config
                    .and_then(|c| c.cmd)
                    .map(|cmd| cmd.join(" "))
                    .unwrap_or_default();
                entries.push(History {
                    created: compat.created,
                    author: compat.author,
                    created_by,
                    comment: compat.comment,
                    empty_layer: compat.throwaway,
                });
                if compat.throwaway {
                    continue;
                }
                layers.push(Descriptor::new(
                    MEDIA_TYPE_LAYER,
                    fs_layer.blob_sum.clone(),
                    compat.size,
                ));
                rootfs.diff_ids.push(String::new());
            }
            config.history = entries;
            config.rootfs = Some(rootfs);
            config.size = layers.iter().map(|l| l.size).sum();
            if config.architecture.is_empty() {
                config.architecture = m.value.architecture.clone();
            }
            Ok((config, layers))
        }
        Manifest::List(_) => Err(RegistryError::Validation(
            "a manifest list has no image config, select a single image".to_string(),
        )),
    }
}

/// Push `manifest` to `to` under `tag`. Registries that reject schema2
/// with `MANIFEST_INVALID` receive a signed schema1 conversion instead,
/// built from `config_json` (or the config blob read from `blobs`).
pub async fn put_manifest_in_compatible_schema(
    manifest: &Manifest,
    tag: &str,
    to: &dyn Repository,
    blobs: &dyn BlobService,
    config_json: Option<Bytes>,
) -> Result<Digest> {
    let tag_ref = (!tag.is_empty()).then_some(tag);
    let err = match to.manifests().put(manifest, tag_ref).await {
        Ok(digest) => return Ok(digest),
        Err(err) => err,
    };
    let Manifest::Schema2(m) = manifest else {
        return Err(err);
    };
    if !err.has_code(CODE_MANIFEST_INVALID) {
        return Err(err);
    }

    tracing::warn!(
        repository = %to.name(),
        %tag,
        "registry rejected schema2 manifest, retrying as schema1"
    );
    let config_json = match config_json {
        Some(raw) => raw,
        None => blobs.get(&m.value.config.digest).await?,
    };
    let converted = schema1::convert(
        &config_json,
        &m.value.layers,
        to.name(),
        if tag.is_empty() { "latest" } else { tag },
    )?;

    if converted.uses_empty_layer {
        let empty = Digest::parse(GZIPPED_EMPTY_LAYER_DIGEST)?;
        let to_blobs = to.blobs();
        match to_blobs.stat(&empty).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                to_blobs
                    .put(MEDIA_TYPE_LAYER, Bytes::from_static(GZIPPED_EMPTY_LAYER))
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }

    let signed = schema1::sign(converted.manifest)?;
    to.manifests().put(&signed, tag_ref).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::History;
    use crate::image::manifest::ManifestDescriptor;
    use crate::registry::memory::MemoryRegistry;

    fn config(arch: &str) -> ImageConfig {
        let mut config = ImageConfig::scratch("linux", arch);
        config.history.push(History {
            created_by: "ADD rootfs /".to_string(),
            ..Default::default()
        });
        config
    }

    /// Push two platform images plus a list; returns the list digest and
    /// the child digests
    async fn multi_arch(registry: &MemoryRegistry) -> (Digest, Digest, Digest) {
        let amd = registry
            .put_image("demo", "amd64", &config("amd64"), &[b"amd64 layer".to_vec()])
            .unwrap();
        let arm = registry
            .put_image("demo", "arm64", &config("arm64"), &[b"arm64 layer".to_vec()])
            .unwrap();
        let repo = registry.repository("demo");
        let mut manifests = Vec::new();
        for (digest, arch) in [(&amd, "amd64"), (&arm, "arm64")] {
            let child = crate::registry::ManifestService::get(&repo, digest).await.unwrap();
            manifests.push(ManifestDescriptor {
                descriptor: child.descriptor(),
                platform: Platform::new("linux", arch),
            });
        }
        let list = Manifest::from_list(ManifestList {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
            manifests,
        })
        .unwrap();
        let list_digest = registry.put_manifest("demo", &list, Some("latest")).unwrap();
        (list_digest, amd, arm)
    }

    #[tokio::test]
    async fn first_manifest_selects_filtered_child() {
        let registry = MemoryRegistry::new();
        let (list, amd, _) = multi_arch(&registry).await;
        let repo = registry.repository("demo");
        let reference = ImageReference::parse("registry.local/demo:latest").unwrap();
        let filter = PlatformFilter::from_pattern(Some("linux/amd64")).unwrap();

        let (manifest, location) = first_manifest(&reference, &repo, &filter).await.unwrap();
        assert_eq!(manifest.digest(), amd);
        assert_eq!(location.manifest, amd);
        assert_eq!(location.manifest_list, Some(list));
    }

    #[tokio::test]
    async fn first_manifest_rejects_ambiguous_and_empty_selections() {
        let registry = MemoryRegistry::new();
        multi_arch(&registry).await;
        let repo = registry.repository("demo");
        let reference = ImageReference::parse("registry.local/demo:latest").unwrap();

        let err = first_manifest(&reference, &repo, &PlatformFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        let filter = PlatformFilter::from_pattern(Some("windows/.*")).unwrap();
        let err = first_manifest(&reference, &repo, &filter).await.unwrap_err();
        assert!(matches!(err, RegistryError::AllImagesFiltered(_)));
    }

    #[tokio::test]
    async fn all_manifests_returns_every_child() {
        let registry = MemoryRegistry::new();
        let (list, amd, arm) = multi_arch(&registry).await;
        let repo = registry.repository("demo");
        let reference = ImageReference::parse("registry.local/demo:latest").unwrap();

        let (children, location) = all_manifests(&reference, &repo).await.unwrap();
        let digests: Vec<Digest> = children.into_iter().map(|(d, _)| d).collect();
        assert_eq!(digests, vec![amd, arm]);
        assert_eq!(location.manifest_list, Some(list));
    }

    #[tokio::test]
    async fn process_manifest_list_rewrites_filtered_list() {
        let registry = MemoryRegistry::new();
        let (list, amd, _) = multi_arch(&registry).await;
        let repo = registry.repository("demo");
        let manifest = crate::registry::ManifestService::get(&repo, &list).await.unwrap();
        let filter = PlatformFilter::from_pattern(Some("amd64")).unwrap();

        let kept = process_manifest_list(&list, manifest.clone(), &repo, &filter, true)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(kept.digest, list);
        assert_eq!(kept.digest, kept.manifest.digest());
        assert_eq!(kept.children.len(), 1);

        let single = process_manifest_list(&list, manifest.clone(), &repo, &filter, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(single.digest, amd);
        assert!(single.children.is_empty());

        let none = PlatformFilter::from_pattern(Some("s390x")).unwrap();
        assert!(
            process_manifest_list(&list, manifest, &repo, &none, true)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn default_filter_only_applies_to_multi_image_lists() {
        let filter = PlatformFilter::default();
        let arm = Platform::new("linux", "arm64");
        assert!(filter.includes(&arm, false));
        assert!(!filter.includes(&arm, true));
        assert!(filter.includes(&Platform::new("linux", "amd64"), true));
    }

    #[tokio::test]
    async fn schema2_config_and_layers() {
        let registry = MemoryRegistry::new();
        let digest = registry
            .put_image("demo", "v1", &config("amd64"), &[b"one".to_vec(), b"two".to_vec()])
            .unwrap();
        let repo = registry.repository("demo");
        let manifest = crate::registry::ManifestService::get(&repo, &digest).await.unwrap();

        let (config, layers) = manifest_to_image_config(&manifest, &repo).await.unwrap();
        assert_eq!(config.architecture, "amd64");
        assert_eq!(layers.len(), 2);
        assert_eq!(config.size, 6);
    }

    #[tokio::test]
    async fn falls_back_to_schema1_when_schema2_is_rejected() {
        let source = MemoryRegistry::new();
        let mut image = config("amd64");
        image.rootfs = Some(RootFs {
            kind: "layers".to_string(),
            diff_ids: vec![Digest::from_bytes(b"layer tar").to_string()],
        });
        let digest = source
            .put_image("demo", "v1", &image, &[b"layer".to_vec()])
            .unwrap();
        let source_repo = source.repository("demo");
        let manifest = crate::registry::ManifestService::get(&source_repo, &digest)
            .await
            .unwrap();

        let legacy = MemoryRegistry::schema1_only();
        legacy
            .put_blob("demo", MEDIA_TYPE_LAYER, b"layer")
            .unwrap();
        let target = legacy.repository("demo");

        let pushed = put_manifest_in_compatible_schema(&manifest, "v1", &target, &source_repo, None)
            .await
            .unwrap();
        let stored = crate::registry::ManifestService::get(&target, &pushed).await.unwrap();
        assert!(matches!(stored, Manifest::Schema1(_)));

        let (config, layers) = manifest_to_image_config(&stored, &target).await.unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].digest, Digest::from_bytes(b"layer"));
        assert_eq!(config.architecture, "amd64");
    }
}
