//! Time-windowed retry for repository services
//!
//! [`RetryRepository`] wraps the manifest, blob and tag services of another
//! repository. Read operations (`get`, `exists`, `stat`, `open`, `all`,
//! `lookup`) are repeated while [`RetryState::should_retry`] allows it.
//! Writes pass straight through.
//!
//! The budget is meant to absorb one short disturbance, such as a token
//! issued by a server with a skewed clock, not to back off indefinitely:
//! - the first retry records when failures started and proceeds immediately
//! - later retries sleep `window / (retries - 1)` while still inside the window
//! - once the window has elapsed the budget drops to zero

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::{Descriptor, Manifest};
use crate::registry::{
    BlobCreation, BlobService, BlobStream, ManifestService, MountRequest, Repository, TagService,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source used by retry bookkeeping
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry configuration handed to every wrapper
#[derive(Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub window: Duration,
    pub clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(retries: u32, window: Duration) -> Self {
        Self {
            retries,
            window,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pause between retries after the first one
    pub fn wait(&self) -> Duration {
        if self.retries > 1 {
            self.window / (self.retries - 1)
        } else {
            self.window
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("window", &self.window)
            .finish()
    }
}

struct Budget {
    remaining: u32,
    first_failure: Option<Instant>,
}

/// Retry budget shared by the services of one wrapper
pub struct RetryState {
    policy: RetryPolicy,
    budget: Mutex<Budget>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            budget: Mutex::new(Budget {
                remaining: policy.retries,
                first_failure: None,
            }),
            policy,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.budget.lock().map(|b| b.remaining).unwrap_or(0)
    }

    /// Decide whether the operation that produced `err` should run again,
    /// sleeping first when required. Each `true` consumes one retry.
    pub async fn should_retry(&self, err: &RegistryError) -> bool {
        if !err.is_temporary() {
            return false;
        }

        let wait = {
            let Ok(mut budget) = self.budget.lock() else {
                return false;
            };
            if budget.remaining == 0 {
                return false;
            }
            let now = self.policy.clock.now();
            match budget.first_failure {
                None => {
                    budget.first_failure = Some(now);
                    budget.remaining -= 1;
                    None
                }
                Some(start) if now.duration_since(start) > self.policy.window => {
                    budget.remaining = 0;
                    return false;
                }
                Some(_) => {
                    budget.remaining -= 1;
                    Some(self.policy.wait())
                }
            }
        };

        if let Some(wait) = wait {
            tracing::debug!(?wait, error = %err, "retrying registry operation");
            self.policy.clock.sleep(wait).await;
        } else {
            tracing::debug!(error = %err, "retrying registry operation");
        }
        true
    }

    async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.should_retry(&err).await {
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Repository decorator applying one [`RetryState`] to all its services
pub struct RetryRepository {
    inner: Arc<dyn Repository>,
    state: Arc<RetryState>,
}

impl RetryRepository {
    pub fn new(inner: Arc<dyn Repository>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            state: Arc::new(RetryState::new(policy)),
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }
}

impl Repository for RetryRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        Arc::new(RetryManifests {
            inner: self.inner.manifests(),
            state: self.state.clone(),
        })
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        Arc::new(RetryBlobs {
            inner: self.inner.blobs(),
            state: self.state.clone(),
        })
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(RetryTags {
            inner: self.inner.tags(),
            state: self.state.clone(),
        })
    }
}

struct RetryManifests {
    inner: Arc<dyn ManifestService>,
    state: Arc<RetryState>,
}

#[async_trait]
impl ManifestService for RetryManifests {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.state.run(|| self.inner.exists(digest)).await
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        self.state.run(|| self.inner.get(digest)).await
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        self.inner.put(manifest, tag).await
    }
}

struct RetryBlobs {
    inner: Arc<dyn BlobService>,
    state: Arc<RetryState>,
}

#[async_trait]
impl BlobService for RetryBlobs {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        self.state.run(|| self.inner.stat(digest)).await
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.state.run(|| self.inner.get(digest)).await
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        self.state.run(|| self.inner.open(digest)).await
    }

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        self.inner.put(media_type, content).await
    }

    async fn create(&self, mount: Option<MountRequest>) -> Result<BlobCreation> {
        self.inner.create(mount).await
    }
}

struct RetryTags {
    inner: Arc<dyn TagService>,
    state: Arc<RetryState>,
}

#[async_trait]
impl TagService for RetryTags {
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        self.state.run(|| self.inner.get(tag)).await
    }

    async fn all(&self) -> Result<Vec<String>> {
        self.state.run(|| self.inner.all()).await
    }

    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>> {
        self.state.run(|| self.inner.lookup(digest)).await
    }
}
