//! In-process registry
//!
//! Implements every service trait on top of maps guarded by a `RwLock`.
//! Dry runs send their writes here, and the test suites use it as a
//! registry that counts uploads and mounts.

use crate::error::{CODE_MANIFEST_INVALID, RegistryError, Result};
use crate::image::config::ImageConfig;
use crate::image::digest::Digest;
use crate::image::manifest::{
    Descriptor, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, Manifest, Schema2Manifest,
};
use crate::registry::{
    BlobCreation, BlobService, BlobStream, BlobWriter, ManifestService, MountRequest, Repository,
    RepositoryProvider, TagService, read_stream, stream_from_bytes,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct RepositoryState {
    blobs: HashMap<Digest, (String, Bytes)>,
    manifests: HashMap<Digest, Manifest>,
    tags: HashMap<String, Digest>,
}

#[derive(Default)]
struct RegistryState {
    repositories: HashMap<String, RepositoryState>,
    /// Reject schema2 pushes like a registry that only speaks schema1
    schema1_only: bool,
}

#[derive(Default)]
struct Counters {
    uploads: AtomicUsize,
    mounts: AtomicUsize,
    manifest_puts: AtomicUsize,
}

/// A registry kept entirely in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
    counters: Arc<Counters>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that answers schema2 pushes with `MANIFEST_INVALID`
    pub fn schema1_only() -> Self {
        let registry = Self::default();
        if let Ok(mut state) = registry.state.write() {
            state.schema1_only = true;
        }
        registry
    }

    pub fn repository(&self, name: &str) -> MemoryRepository {
        MemoryRepository {
            registry: self.clone(),
            name: name.to_string(),
        }
    }

    /// Blobs written through put or a committed upload
    pub fn upload_count(&self) -> usize {
        self.counters.uploads.load(Ordering::SeqCst)
    }

    pub fn mount_count(&self) -> usize {
        self.counters.mounts.load(Ordering::SeqCst)
    }

    pub fn manifest_put_count(&self) -> usize {
        self.counters.manifest_puts.load(Ordering::SeqCst)
    }

    /// Store a schema2 image built from `layers` and tag it. Returns the
    /// manifest digest.
    pub fn put_image(
        &self,
        repository: &str,
        tag: &str,
        config: &ImageConfig,
        layers: &[Vec<u8>],
    ) -> Result<Digest> {
        let repo = self.repository(repository);
        let layer_descriptors: Vec<Descriptor> = layers
            .iter()
            .map(|content| repo.insert_blob(MEDIA_TYPE_LAYER, Bytes::from(content.clone())))
            .collect::<Result<_>>()?;
        let config_json = serde_json::to_vec(config)?;
        let config_descriptor = repo.insert_blob(MEDIA_TYPE_IMAGE_CONFIG, Bytes::from(config_json))?;
        let manifest = Manifest::from_schema2(Schema2Manifest::new(config_descriptor, layer_descriptors))?;
        repo.insert_manifest(&manifest, Some(tag))
    }

    /// Store an arbitrary manifest, optionally under a tag
    pub fn put_manifest(&self, repository: &str, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        self.repository(repository).insert_manifest(manifest, tag)
    }

    /// Store raw blob content
    pub fn put_blob(&self, repository: &str, media_type: &str, content: &[u8]) -> Result<Descriptor> {
        self.repository(repository)
            .insert_blob(media_type, Bytes::copy_from_slice(content))
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> Result<T> {
        let state = self
            .state
            .read()
            .map_err(|_| RegistryError::Io("memory registry lock poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut RegistryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| RegistryError::Io("memory registry lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

/// Handle on one repository of a [`MemoryRegistry`]
#[derive(Clone)]
pub struct MemoryRepository {
    registry: MemoryRegistry,
    name: String,
}

impl MemoryRepository {
    fn subject(&self, reference: &str) -> String {
        format!("{}@{}", self.name, reference)
    }

    fn insert_blob(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        let digest = Digest::from_bytes(&content);
        let descriptor = Descriptor::new(media_type, digest.clone(), content.len() as u64);
        self.registry.write(|state| {
            state
                .repositories
                .entry(self.name.clone())
                .or_default()
                .blobs
                .insert(digest, (media_type.to_string(), content));
        })?;
        self.registry.counters.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(descriptor)
    }

    fn insert_manifest(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        let digest = manifest.digest();
        self.registry.write(|state| {
            let repo = state.repositories.entry(self.name.clone()).or_default();
            repo.manifests.insert(digest.clone(), manifest.clone());
            if let Some(tag) = tag {
                repo.tags.insert(tag.to_string(), digest.clone());
            }
        })?;
        Ok(digest)
    }

    fn blob(&self, digest: &Digest) -> Result<(String, Bytes)> {
        self.registry
            .read(|state| {
                state
                    .repositories
                    .get(&self.name)
                    .and_then(|r| r.blobs.get(digest).cloned())
            })?
            .ok_or_else(|| RegistryError::BlobUnknown(self.subject(digest.as_str())))
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        Arc::new(self.clone())
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        Arc::new(self.clone())
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ManifestService for MemoryRepository {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.registry.read(|state| {
            state
                .repositories
                .get(&self.name)
                .is_some_and(|r| r.manifests.contains_key(digest))
        })
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        let manifest = self
            .registry
            .read(|state| {
                state
                    .repositories
                    .get(&self.name)
                    .and_then(|r| r.manifests.get(digest).cloned())
            })?
            .ok_or_else(|| RegistryError::ManifestUnknown(self.subject(digest.as_str())))?;
        digest.verify(&manifest.digest())?;
        Ok(manifest)
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        if matches!(manifest, Manifest::Schema2(_)) && self.registry.read(|s| s.schema1_only)? {
            return Err(RegistryError::Registry {
                status: 400,
                codes: vec![CODE_MANIFEST_INVALID.to_string()],
                message: "manifest invalid: schema2 not supported".to_string(),
            });
        }
        for reference in manifest.references() {
            let present = self.registry.read(|state| {
                state.repositories.get(&self.name).is_some_and(|r| {
                    if manifest.is_list() {
                        r.manifests.contains_key(&reference.digest)
                    } else {
                        r.blobs.contains_key(&reference.digest)
                    }
                })
            })?;
            if !present {
                return Err(RegistryError::Registry {
                    status: 400,
                    codes: vec!["MANIFEST_BLOB_UNKNOWN".to_string()],
                    message: format!("blob unknown to registry: {}", reference.digest),
                });
            }
        }
        self.registry.counters.manifest_puts.fetch_add(1, Ordering::SeqCst);
        self.insert_manifest(manifest, tag)
    }
}

#[async_trait]
impl BlobService for MemoryRepository {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let (media_type, content) = self.blob(digest)?;
        Ok(Descriptor::new(&media_type, digest.clone(), content.len() as u64))
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        Ok(self.blob(digest)?.1)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        Ok(stream_from_bytes(self.blob(digest)?.1))
    }

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        self.insert_blob(media_type, content)
    }

    async fn create(&self, mount: Option<MountRequest>) -> Result<BlobCreation> {
        if let Some(mount) = mount {
            let source = self.registry.read(|state| {
                state
                    .repositories
                    .get(&mount.from)
                    .and_then(|r| r.blobs.get(&mount.descriptor.digest).cloned())
            })?;
            if let Some((media_type, content)) = source {
                let size = content.len() as u64;
                self.registry.write(|state| {
                    state
                        .repositories
                        .entry(self.name.clone())
                        .or_default()
                        .blobs
                        .insert(mount.descriptor.digest.clone(), (media_type.clone(), content));
                })?;
                self.registry.counters.mounts.fetch_add(1, Ordering::SeqCst);
                return Ok(BlobCreation::Mounted(Descriptor::new(
                    &media_type,
                    mount.descriptor.digest,
                    size,
                )));
            }
        }
        Ok(BlobCreation::Upload(Box::new(MemoryBlobWriter {
            repository: self.clone(),
            buffer: Vec::new(),
        })))
    }
}

#[async_trait]
impl TagService for MemoryRepository {
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        let digest = self
            .registry
            .read(|state| {
                state
                    .repositories
                    .get(&self.name)
                    .and_then(|r| r.tags.get(tag).cloned())
            })?
            .ok_or_else(|| RegistryError::TagUnknown(format!("{}:{}", self.name, tag)))?;
        let manifest = ManifestService::get(self, &digest).await?;
        Ok(manifest.descriptor())
    }

    async fn all(&self) -> Result<Vec<String>> {
        let mut tags = self.registry.read(|state| {
            state
                .repositories
                .get(&self.name)
                .map(|r| r.tags.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        })?;
        tags.sort();
        Ok(tags)
    }

    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>> {
        let mut tags = self.registry.read(|state| {
            state
                .repositories
                .get(&self.name)
                .map(|r| {
                    r.tags
                        .iter()
                        .filter(|(_, d)| *d == digest)
                        .map(|(t, _)| t.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })?;
        tags.sort();
        Ok(tags)
    }
}

struct MemoryBlobWriter {
    repository: MemoryRepository,
    buffer: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn write(&mut self, content: BlobStream) -> Result<u64> {
        let content = read_stream(content).await?;
        self.buffer.extend_from_slice(&content);
        Ok(content.len() as u64)
    }

    async fn commit(self: Box<Self>, expected: &Descriptor) -> Result<Descriptor> {
        expected.digest.verify(&Digest::from_bytes(&self.buffer))?;
        self.repository
            .insert_blob(&expected.media_type, Bytes::from(self.buffer))
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A set of in-memory registries addressed by host name
#[derive(Clone, Default)]
pub struct MemoryRegistries {
    registries: Arc<RwLock<HashMap<String, MemoryRegistry>>>,
}

impl MemoryRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry for `host`, created on first use
    pub fn registry(&self, host: &str) -> MemoryRegistry {
        if let Ok(registries) = self.registries.read() {
            if let Some(registry) = registries.get(host) {
                return registry.clone();
            }
        }
        match self.registries.write() {
            Ok(mut registries) => registries.entry(host.to_string()).or_default().clone(),
            Err(_) => MemoryRegistry::new(),
        }
    }

    /// Register a pre-built registry under `host`
    pub fn insert(&self, host: &str, registry: MemoryRegistry) {
        if let Ok(mut registries) = self.registries.write() {
            registries.insert(host.to_string(), registry);
        }
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRegistries {
    async fn repository(
        &self,
        registry: &str,
        repository: &str,
        _insecure: bool,
    ) -> Result<Arc<dyn Repository>> {
        Ok(Arc::new(self.registry(registry).repository(repository)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mounts_from_sibling_repository() {
        let registry = MemoryRegistry::new();
        let blob = registry.put_blob("a", MEDIA_TYPE_LAYER, b"shared").unwrap();
        let target = registry.repository("b");

        let creation = target
            .create(Some(MountRequest {
                from: "a".to_string(),
                descriptor: blob.clone(),
            }))
            .await
            .unwrap();
        assert!(matches!(creation, BlobCreation::Mounted(_)));
        assert_eq!(BlobService::stat(&target, &blob.digest).await.unwrap().size, 6);
        assert_eq!(registry.mount_count(), 1);
    }

    #[tokio::test]
    async fn commit_verifies_digest() {
        let registry = MemoryRegistry::new();
        let repo = registry.repository("a");
        let BlobCreation::Upload(mut writer) = repo.create(None).await.unwrap() else {
            panic!("expected an upload session");
        };
        writer
            .write(stream_from_bytes(Bytes::from_static(b"actual")))
            .await
            .unwrap();
        let wrong = Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"other"), 6);
        assert!(matches!(
            writer.commit(&wrong).await,
            Err(RegistryError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn manifest_push_requires_blobs() {
        let registry = MemoryRegistry::new();
        let config = Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, Digest::from_bytes(b"{}"), 2);
        let manifest = Manifest::from_schema2(Schema2Manifest::new(config, vec![])).unwrap();
        let err = ManifestService::put(&registry.repository("a"), &manifest, Some("v1"))
            .await
            .unwrap_err();
        assert!(err.has_code("MANIFEST_BLOB_UNKNOWN"));
    }

    #[tokio::test]
    async fn tags_resolve_to_manifest_descriptors() {
        let registry = MemoryRegistry::new();
        let digest = registry
            .put_image("demo", "latest", &ImageConfig::scratch("linux", "amd64"), &[b"layer".to_vec()])
            .unwrap();
        let repo = registry.repository("demo");
        assert_eq!(TagService::get(&repo, "latest").await.unwrap().digest, digest);
        assert_eq!(repo.lookup(&digest).await.unwrap(), vec!["latest".to_string()]);
        assert!(matches!(
            TagService::get(&repo, "missing").await,
            Err(RegistryError::TagUnknown(_))
        ));
    }
}
