//! Manifest operations against `/v2/<name>/manifests/<reference>`
//!
//! Requests advertise list, schema2 and schema1 media types in that order.
//! Fetched content is always verified against the requested digest.

use super::Transport;
use crate::error::handlers::Resource;
use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::{MANIFEST_ACCEPT, Manifest};
use crate::registry::ManifestService;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

#[derive(Clone)]
pub struct ManifestOperations {
    transport: Transport,
}

impl ManifestOperations {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    fn subject(&self, reference: &str) -> String {
        let separator = if reference.contains(':') { "@" } else { ":" };
        format!("{}{}{}", self.transport.repository(), separator, reference)
    }

    /// Fetch whatever `reference` (tag or digest) points at, unverified
    pub(crate) async fn fetch(&self, reference: &str) -> Result<Manifest> {
        let url = self.transport.url(&format!("manifests/{}", reference))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let response = self
            .transport
            .send(|client| client.get(url.clone()).header(ACCEPT, accept.as_str()))
            .await?;
        if !response.status().is_success() {
            return Err(
                Transport::error(response, Resource::Manifest, &self.subject(reference)).await,
            );
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = response.bytes().await?.to_vec();
        Manifest::parse(content_type.as_deref(), raw)
    }
}

#[async_trait]
impl ManifestService for ManifestOperations {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.transport.url(&format!("manifests/{}", digest))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let response = self
            .transport
            .send(|client| client.head(url.clone()).header(ACCEPT, accept.as_str()))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Transport::error(response, Resource::Manifest, &self.subject(digest.as_str())).await),
        }
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        let manifest = self.fetch(digest.as_str()).await?;
        digest.verify(&manifest.digest())?;
        Ok(manifest)
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest> {
        let digest = manifest.digest();
        let reference = tag.map(str::to_string).unwrap_or_else(|| digest.to_string());
        let url = self.transport.url(&format!("manifests/{}", reference))?;
        let media_type = manifest.media_type();
        let payload = manifest.payload().to_vec();

        tracing::debug!(
            repository = %self.transport.repository(),
            %reference,
            %media_type,
            "putting manifest"
        );
        let response = self
            .transport
            .send(|client| {
                client
                    .put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(payload.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(
                Transport::error(response, Resource::Manifest, &self.subject(&reference)).await,
            );
        }

        match response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
        {
            Some(returned) => {
                let returned = Digest::parse(returned)?;
                if returned != digest {
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: returned.to_string(),
                    });
                }
                Ok(returned)
            }
            None => Ok(digest),
        }
    }
}
