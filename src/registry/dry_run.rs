//! Repositories that read from a real registry and discard every write

use crate::error::Result;
use crate::image::digest::Digest;
use crate::image::manifest::{Descriptor, Manifest};
use crate::registry::{
    BlobCreation, BlobService, BlobStream, BlobWriter, ManifestService, MountRequest, Repository,
    RepositoryProvider, TagService,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;

/// Wraps a provider so that its repositories never change remote state
pub struct DryRunProvider {
    inner: Arc<dyn RepositoryProvider>,
}

impl DryRunProvider {
    pub fn new(inner: Arc<dyn RepositoryProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RepositoryProvider for DryRunProvider {
    async fn repository(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>> {
        let inner = self.inner.repository(registry, repository, insecure).await?;
        Ok(Arc::new(DryRunRepository { inner }))
    }

    async fn repository_with_scopes(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
        scopes: &[String],
    ) -> Result<Arc<dyn Repository>> {
        let inner = self
            .inner
            .repository_with_scopes(registry, repository, insecure, scopes)
            .await?;
        Ok(Arc::new(DryRunRepository { inner }))
    }
}

struct DryRunRepository {
    inner: Arc<dyn Repository>,
}

impl Repository for DryRunRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        Arc::new(DryRunManifests {
            inner: self.inner.manifests(),
        })
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        Arc::new(DryRunBlobs {
            inner: self.inner.blobs(),
        })
    }

    fn tags(&self) -> Arc<dyn TagService> {
        self.inner.tags()
    }
}

struct DryRunManifests {
    inner: Arc<dyn ManifestService>,
}

#[async_trait]
impl ManifestService for DryRunManifests {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.inner.exists(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        self.inner.get(digest).await
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        tracing::debug!(digest = %manifest.digest(), ?tag, "dry run: skipping manifest push");
        Ok(manifest.digest())
    }
}

struct DryRunBlobs {
    inner: Arc<dyn BlobService>,
}

#[async_trait]
impl BlobService for DryRunBlobs {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        self.inner.stat(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.inner.get(digest).await
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        self.inner.open(digest).await
    }

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        Ok(Descriptor::new(
            media_type,
            Digest::from_bytes(&content),
            content.len() as u64,
        ))
    }

    async fn create(&self, _mount: Option<MountRequest>) -> Result<BlobCreation> {
        Ok(BlobCreation::Upload(Box::new(DiscardWriter { written: 0 })))
    }
}

/// Consumes content so sizes can still be reported
struct DiscardWriter {
    written: u64,
}

#[async_trait]
impl BlobWriter for DiscardWriter {
    async fn write(&mut self, mut content: BlobStream) -> Result<u64> {
        let mut written = 0;
        while let Some(chunk) = content.next().await {
            written += chunk?.len() as u64;
        }
        self.written += written;
        Ok(written)
    }

    async fn commit(self: Box<Self>, expected: &Descriptor) -> Result<Descriptor> {
        let mut descriptor = expected.clone();
        descriptor.size = self.written;
        Ok(descriptor)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::ImageConfig;
    use crate::registry::memory::MemoryRegistries;

    #[tokio::test]
    async fn writes_leave_the_registry_untouched() {
        let registries = MemoryRegistries::new();
        let registry = registries.registry("registry.local");
        let digest = registry
            .put_image("demo", "v1", &ImageConfig::scratch("linux", "amd64"), &[b"layer".to_vec()])
            .unwrap();
        let uploads = registry.upload_count();

        let provider = DryRunProvider::new(Arc::new(registries.clone()));
        let repo = provider
            .repository("registry.local", "copy", false)
            .await
            .unwrap();
        let source = registry.repository("demo");
        let manifest = ManifestService::get(&source, &digest).await.unwrap();

        repo.blobs()
            .put("application/octet-stream", Bytes::from_static(b"ignored"))
            .await
            .unwrap();
        assert_eq!(repo.manifests().put(&manifest, Some("v1")).await.unwrap(), digest);

        assert_eq!(registry.upload_count(), uploads);
        assert!(!registry.repository("copy").manifests().exists(&digest).await.unwrap());
    }
}
