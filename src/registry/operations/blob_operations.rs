//! Blob operations for registry client
//!
//! Implements Docker Registry v2 blob operations:
//! - existence checks (HEAD /v2/{name}/blobs/{digest})
//! - download with digest verification (GET /v2/{name}/blobs/{digest})
//! - staged uploads: POST to open, PATCH content, PUT with `?digest=` to commit
//! - cross-repository mount (POST /v2/{name}/blobs/uploads/?mount=&from=)

use super::Transport;
use crate::error::handlers::Resource;
use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::Descriptor;
use crate::registry::{
    BlobCreation, BlobService, BlobStream, BlobWriter, MountRequest, stream_from_bytes,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
pub struct BlobOperations {
    transport: Transport,
}

impl BlobOperations {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    fn subject(&self, digest: &Digest) -> String {
        format!("{}@{}", self.transport.repository(), digest)
    }

    async fn download(&self, digest: &Digest) -> Result<reqwest::Response> {
        let url = self.transport.url(&format!("blobs/{}", digest))?;
        let response = self
            .transport
            .send(|client| client.get(url.clone()))
            .await?;
        if !response.status().is_success() {
            return Err(Transport::error(response, Resource::Blob, &self.subject(digest)).await);
        }
        Ok(response)
    }
}

fn location(transport: &Transport, response: &reqwest::Response) -> Result<Url> {
    let header = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryError::Protocol {
            status: response.status().as_u16(),
            message: "upload response has no Location header".to_string(),
        })?;
    transport.resolve(header)
}

#[async_trait]
impl BlobService for BlobOperations {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let url = self.transport.url(&format!("blobs/{}", digest))?;
        let response = self
            .transport
            .send(|client| client.head(url.clone()))
            .await?;
        if !response.status().is_success() {
            return Err(Transport::error(response, Resource::Blob, &self.subject(digest)).await);
        }
        let headers = response.headers();
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(OCTET_STREAM);
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Descriptor::new(media_type, digest.clone(), size))
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let content = self.download(digest).await?.bytes().await?;
        digest.verify(&Digest::from_bytes(&content))?;
        Ok(content)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        let response = self.download(digest).await?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(RegistryError::from)),
        ))
    }

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        let expected = Descriptor::new(
            media_type,
            Digest::from_bytes(&content),
            content.len() as u64,
        );
        match self.create(None).await? {
            BlobCreation::Mounted(desc) => Ok(desc),
            BlobCreation::Upload(mut writer) => {
                writer.write(stream_from_bytes(content)).await?;
                writer.commit(&expected).await
            }
        }
    }

    async fn create(&self, mount: Option<MountRequest>) -> Result<BlobCreation> {
        let mut url = self.transport.url("blobs/uploads/")?;
        if let Some(mount) = &mount {
            url.query_pairs_mut()
                .append_pair("mount", mount.descriptor.digest.as_str())
                .append_pair("from", &mount.from);
        }
        let response = self
            .transport
            .send(|client| client.post(url.clone()).header(CONTENT_LENGTH, 0))
            .await?;

        match (response.status(), mount) {
            (StatusCode::CREATED, Some(mount)) => {
                tracing::debug!(
                    repository = %self.transport.repository(),
                    digest = %mount.descriptor.digest,
                    from = %mount.from,
                    "blob mounted"
                );
                Ok(BlobCreation::Mounted(mount.descriptor))
            }
            (StatusCode::ACCEPTED, _) => {
                let location = location(&self.transport, &response)?;
                Ok(BlobCreation::Upload(Box::new(HttpBlobWriter {
                    transport: self.transport.clone(),
                    location,
                    written: 0,
                })))
            }
            _ => Err(Transport::error(response, Resource::Upload, self.transport.repository()).await),
        }
    }
}

/// An open upload session addressed by its `Location`
pub struct HttpBlobWriter {
    transport: Transport,
    location: Url,
    written: u64,
}

#[async_trait]
impl BlobWriter for HttpBlobWriter {
    async fn write(&mut self, content: BlobStream) -> Result<u64> {
        let counter = Arc::new(AtomicU64::new(0));
        let counted = {
            let counter = counter.clone();
            content.inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
            })
        };
        let request = self
            .transport
            .client()
            .patch(self.location.clone())
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(Body::wrap_stream(counted));
        let response = self.transport.send_once(request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(
                Transport::error(response, Resource::Upload, self.transport.repository()).await,
            );
        }
        self.location = location(&self.transport, &response)?;
        let written = counter.load(Ordering::Relaxed);
        self.written += written;
        Ok(written)
    }

    async fn commit(self: Box<Self>, expected: &Descriptor) -> Result<Descriptor> {
        if expected.size > 0 && expected.size != self.written {
            let _ = self.cancel_upload().await;
            return Err(RegistryError::SizeMismatch {
                digest: expected.digest.to_string(),
                expected: expected.size,
                actual: self.written,
            });
        }
        let mut url = self.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", expected.digest.as_str());
        let response = self
            .transport
            .send(|client| client.put(url.clone()).header(CONTENT_LENGTH, 0))
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Transport::error(
                response,
                Resource::Blob,
                &format!("{}@{}", self.transport.repository(), expected.digest),
            )
            .await);
        }
        let mut committed = expected.clone();
        committed.size = self.written;
        Ok(committed)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        self.cancel_upload().await
    }
}

impl HttpBlobWriter {
    async fn cancel_upload(&self) -> Result<()> {
        let url = self.location.clone();
        let response = self
            .transport
            .send(|client| client.delete(url.clone()))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Transport::error(response, Resource::Upload, self.transport.repository()).await),
        }
    }
}
