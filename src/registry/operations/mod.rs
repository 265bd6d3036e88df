//! HTTP implementations of the registry service traits
//!
//! Every operation goes through one [`Transport`] per repository. The
//! transport attaches credentials for the challenges recorded by the
//! context and repeats a request once when the registry answers 401 with a
//! fresh challenge.

pub mod blob_operations;
pub mod manifest_operations;
pub mod tag_operations;

pub use blob_operations::{BlobOperations, HttpBlobWriter};
pub use manifest_operations::ManifestOperations;
pub use tag_operations::TagOperations;

use crate::error::Result;
use crate::error::handlers::{HttpErrorHandler, Resource};
use crate::error::RegistryError;
use crate::registry::auth::{ChallengeManager, CredentialStore};
use crate::registry::token_manager::TokenManager;
use crate::registry::{BlobService, ManifestService, Repository, TagService};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use url::Url;

/// Authenticated request plumbing for one repository
#[derive(Clone)]
pub struct Transport {
    client: Client,
    base: Url,
    repository: String,
    challenges: Arc<ChallengeManager>,
    tokens: TokenManager,
    credentials: Arc<dyn CredentialStore>,
}

impl Transport {
    pub fn new(
        client: Client,
        base: Url,
        repository: &str,
        challenges: Arc<ChallengeManager>,
        tokens: TokenManager,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            client,
            base,
            repository: repository.to_string(),
            challenges,
            tokens,
            credentials,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `<base>/v2/<repository>/<path>`
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self
            .base
            .join(&format!("v2/{}/{}", self.repository, path))?)
    }

    /// Resolve a `Location` header, which may be relative to the registry
    pub fn resolve(&self, location: &str) -> Result<Url> {
        Ok(self.base.join(location)?)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let challenges = self.challenges.get(&self.base);
        if let Some(bearer) = challenges.iter().find(|c| c.scheme == "bearer") {
            let token = self.tokens.get_valid_token(bearer, &self.base).await?;
            return Ok(request.bearer_auth(token));
        }
        if challenges.iter().any(|c| c.scheme == "basic") {
            if let Some((user, pass)) = self.credentials.basic(&self.base) {
                return Ok(request.basic_auth(user, Some(pass)));
            }
        }
        Ok(request)
    }

    /// Send a request built by `build`, authenticating and retrying once
    /// when the registry issues a new challenge.
    pub async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.authorize(build(&self.client)).await?.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if !self.challenges.add_response(&self.base, response.headers()) {
            return Ok(response);
        }
        tracing::debug!(repository = %self.repository, "registry issued a new challenge, re-authenticating");
        self.tokens.invalidate();
        Ok(self.authorize(build(&self.client)).await?.send().await?)
    }

    /// Send a request whose body cannot be rebuilt
    pub async fn send_once(&self, request: RequestBuilder) -> Result<Response> {
        Ok(self.authorize(request).await?.send().await?)
    }

    /// Turn a non-success response into an error
    pub async fn error(response: Response, resource: Resource, subject: &str) -> RegistryError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        HttpErrorHandler::handle_registry_error(status, &text, resource, subject)
    }
}

/// Repository backed by a remote registry
pub struct HttpRepository {
    name: String,
    manifests: Arc<ManifestOperations>,
    blobs: Arc<BlobOperations>,
    tags: Arc<TagOperations>,
}

impl HttpRepository {
    pub fn new(transport: Transport) -> Self {
        Self {
            name: transport.repository().to_string(),
            manifests: Arc::new(ManifestOperations::new(transport.clone())),
            blobs: Arc::new(BlobOperations::new(transport.clone())),
            tags: Arc::new(TagOperations::new(transport)),
        }
    }
}

impl Repository for HttpRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        self.manifests.clone()
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        self.blobs.clone()
    }

    fn tags(&self) -> Arc<dyn TagService> {
        self.tags.clone()
    }
}
