//! Registry access for Docker Registry HTTP API v2
//!
//! The engine talks to registries through the service traits defined here:
//! - [`ManifestService`]: manifests addressed by digest, pushes by tag or digest
//! - [`BlobService`]: blob stat, download, upload and cross-repository mount
//! - [`TagService`]: tag resolution and listing
//!
//! [`client::Context`] builds authenticated HTTP implementations and
//! [`retry::RetryRepository`] decorates any implementation with bounded
//! retry. [`memory::MemoryRegistry`] keeps everything in process;
//! [`dry_run::DryRunProvider`] reads through to a real registry but
//! discards writes.

pub mod auth;
pub mod client;
pub mod dry_run;
pub mod memory;
pub mod operations;
pub mod retry;
pub mod token_manager;

use crate::error::Result;
use crate::image::digest::Digest;
use crate::image::manifest::{Descriptor, Manifest};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

pub use client::{Context, ContextOptions};
pub use dry_run::DryRunProvider;
pub use memory::{MemoryRegistries, MemoryRegistry};
pub use retry::{Clock, RetryPolicy, RetryRepository, SystemClock};

/// Streamed blob content
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Fetch a manifest and verify its content against `digest`
    async fn get(&self, digest: &Digest) -> Result<Manifest>;

    /// Push a manifest under `tag`, or by digest when no tag is given
    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest>;
}

/// Optional cross-repository mount requested when an upload starts
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub from: String,
    pub descriptor: Descriptor,
}

/// Outcome of starting an upload
pub enum BlobCreation {
    /// The registry linked the blob from the mount source; nothing to upload
    Mounted(Descriptor),
    Upload(Box<dyn BlobWriter>),
}

#[async_trait]
pub trait BlobWriter: Send {
    /// Append content to the upload session, returning bytes written
    async fn write(&mut self, content: BlobStream) -> Result<u64>;

    /// Finish the upload under `expected.digest`
    async fn commit(self: Box<Self>, expected: &Descriptor) -> Result<Descriptor>;

    async fn cancel(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait BlobService: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor>;

    /// Download a whole blob and verify its digest
    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    async fn open(&self, digest: &Digest) -> Result<BlobStream>;

    /// Monolithic upload of small content
    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor>;

    async fn create(&self, mount: Option<MountRequest>) -> Result<BlobCreation>;
}

#[async_trait]
pub trait TagService: Send + Sync {
    async fn get(&self, tag: &str) -> Result<Descriptor>;

    async fn all(&self) -> Result<Vec<String>>;

    /// Tags currently pointing at `digest`
    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>>;
}

pub trait Repository: Send + Sync {
    /// Repository path within its registry
    fn name(&self) -> &str;

    fn manifests(&self) -> Arc<dyn ManifestService>;

    fn blobs(&self) -> Arc<dyn BlobService>;

    fn tags(&self) -> Arc<dyn TagService>;
}

/// Source of repository handles, keyed by registry host and repository path
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn repository(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>>;

    /// Like [`repository`](Self::repository), additionally requesting
    /// `scopes` (for example pull access on a cross-mount source)
    async fn repository_with_scopes(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
        _scopes: &[String],
    ) -> Result<Arc<dyn Repository>> {
        self.repository(registry, repository, insecure).await
    }
}

/// Wrap in-memory content as a single-chunk stream
pub fn stream_from_bytes(content: Bytes) -> BlobStream {
    Box::pin(futures::stream::once(async move { Ok(content) }))
}

/// Collect a stream into memory
pub async fn read_stream(mut stream: BlobStream) -> Result<Bytes> {
    use futures_util::StreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
