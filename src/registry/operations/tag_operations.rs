//! Tag resolution and listing

use super::Transport;
use super::manifest_operations::{DOCKER_CONTENT_DIGEST, ManifestOperations};
use crate::error::handlers::Resource;
use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::{Descriptor, MANIFEST_ACCEPT};
use crate::registry::TagService;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK};
use serde::Deserialize;

const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct TagOperations {
    transport: Transport,
    manifests: ManifestOperations,
}

impl TagOperations {
    pub fn new(transport: Transport) -> Self {
        Self {
            manifests: ManifestOperations::new(transport.clone()),
            transport,
        }
    }
}

/// Extract the target of a `Link: <...>; rel="next"` header
fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.replace(' ', "").contains("rel=\"next\"") {
            return None;
        }
        target
            .trim()
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
    })
}

#[async_trait]
impl TagService for TagOperations {
    /// HEAD the tag for its digest, falling back to a GET when the
    /// registry does not return `Docker-Content-Digest`
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        let url = self.transport.url(&format!("manifests/{}", tag))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let response = self
            .transport
            .send(|client| client.head(url.clone()).header(ACCEPT, accept.as_str()))
            .await?;
        let subject = format!("{}:{}", self.transport.repository(), tag);
        if !response.status().is_success() {
            return Err(Transport::error(response, Resource::Tag, &subject).await);
        }

        let headers = response.headers();
        let digest = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(Digest::parse)
            .transpose()?;
        if let Some(digest) = digest {
            let media_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let size = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return Ok(Descriptor::new(media_type, digest, size));
        }

        tracing::debug!(%subject, "no digest header on HEAD, fetching manifest");
        let manifest = self.manifests.fetch(tag).await.map_err(|e| match e {
            RegistryError::ManifestUnknown(s) => RegistryError::TagUnknown(s),
            other => other,
        })?;
        Ok(manifest.descriptor())
    }

    async fn all(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = self.transport.url("tags/list")?;
        url.query_pairs_mut()
            .append_pair("n", &PAGE_SIZE.to_string());
        loop {
            let current = url.clone();
            let response = self
                .transport
                .send(|client| client.get(current.clone()))
                .await?;
            if !response.status().is_success() {
                return Err(
                    Transport::error(response, Resource::Repository, self.transport.repository())
                        .await,
                );
            }
            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link)
                .map(str::to_string);
            let page: TagList = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());
            match next {
                Some(next) => url = self.transport.resolve(&next)?,
                None => break,
            }
        }
        Ok(tags)
    }

    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>> {
        let mut matching = Vec::new();
        for tag in self.all().await? {
            match self.get(&tag).await {
                Ok(desc) if &desc.digest == digest => matching.push(tag),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_next_page() {
        let header = r#"</v2/library/busybox/tags/list?n=100&last=1.36>; rel="next""#;
        assert_eq!(
            next_link(header),
            Some("/v2/library/busybox/tags/list?n=100&last=1.36")
        );
        assert_eq!(next_link(r#"</other>; rel="prev""#), None);
    }
}
