//! Registry context: endpoint discovery, authentication and repository construction
//!
//! A [`Context`] owns the HTTP client, a cache of probed registry endpoints
//! and the [`ChallengeManager`] shared by every repository it hands out.
//! Derived contexts (`with_credentials`, `with_actions`, ...) share both
//! caches so a registry is pinged at most once per run.

use crate::error::{RegistryError, Result};
use crate::image::reference::{DEFAULT_REGISTRY, DOCKER_HUB_ENDPOINT};
use crate::registry::auth::{
    ChallengeManager, CredentialStore, MemoryRefreshTokens, NoCredentials, RefreshTokenStore,
};
use crate::registry::operations::{HttpRepository, Transport};
use crate::registry::retry::{Clock, RetryPolicy, RetryRepository, SystemClock};
use crate::registry::token_manager::TokenManager;
use crate::registry::{Repository, RepositoryProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION_V2: &str = "registry/2.0";

/// HTTP client settings for a [`Context`]
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Accept invalid certificates and host names
    pub skip_tls_verify: bool,
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            skip_tls_verify: false,
            timeout: None,
            user_agent: format!("docker-image-mirror/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone)]
pub struct Context {
    client: Client,
    credentials: Arc<dyn CredentialStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    actions: Vec<String>,
    scopes: Vec<String>,
    retries: u32,
    retry_window: Duration,
    clock: Arc<dyn Clock>,
    /// Probed v2 endpoints keyed by host and whether plain http was allowed
    pings: Arc<RwLock<HashMap<(String, bool), Url>>>,
    challenges: Arc<ChallengeManager>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Result<Self> {
        let mut builder = Client::builder().user_agent(options.user_agent);
        if options.skip_tls_verify {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| RegistryError::Validation(format!(
            "failed to build http client: {}",
            e
        )))?;

        Ok(Self {
            client,
            credentials: Arc::new(NoCredentials),
            refresh_tokens: Arc::new(MemoryRefreshTokens::new()),
            actions: vec!["pull".to_string()],
            scopes: Vec::new(),
            retries: 0,
            retry_window: Duration::from_secs(10),
            clock: Arc::new(SystemClock),
            pings: Arc::new(RwLock::new(HashMap::new())),
            challenges: Arc::new(ChallengeManager::new()),
        })
    }

    pub fn with_credentials(&self, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            ..self.clone()
        }
    }

    pub fn with_refresh_tokens(&self, refresh_tokens: Arc<dyn RefreshTokenStore>) -> Self {
        Self {
            refresh_tokens,
            ..self.clone()
        }
    }

    /// Actions requested in repository scopes, `pull` by default
    pub fn with_actions(&self, actions: &[&str]) -> Self {
        Self {
            actions: actions.iter().map(|a| a.to_string()).collect(),
            ..self.clone()
        }
    }

    /// Extra scopes requested alongside the repository scope
    pub fn with_scopes(&self, scopes: &[String]) -> Self {
        Self {
            scopes: scopes.to_vec(),
            ..self.clone()
        }
    }

    pub fn with_retry(&self, retries: u32, window: Duration) -> Self {
        Self {
            retries,
            retry_window: window,
            ..self.clone()
        }
    }

    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ..self.clone()
        }
    }

    /// Whether `other` shares this context's endpoint and challenge caches
    pub fn shares_caches(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.pings, &other.pings) && Arc::ptr_eq(&self.challenges, &other.challenges)
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    fn scopes_for(&self, repository: &str) -> Vec<String> {
        let mut scopes = vec![format!(
            "repository:{}:{}",
            repository,
            self.actions.join(",")
        )];
        scopes.extend(self.scopes.iter().cloned());
        scopes
    }

    /// Find the v2 endpoint for `registry`, probing it on first use
    pub async fn ping(&self, registry: &str, insecure: bool) -> Result<Url> {
        let host = if registry == DEFAULT_REGISTRY {
            DOCKER_HUB_ENDPOINT
        } else {
            registry
        };

        let key = (host.to_string(), insecure);
        if let Ok(pings) = self.pings.read() {
            if let Some(base) = pings.get(&key) {
                return Ok(base.clone());
            }
        }

        let secure = Url::parse(&format!("https://{}/", host))?;
        let base = match self.probe(&secure, host).await {
            Ok(()) => secure,
            Err(RegistryError::Network { .. } | RegistryError::Timeout(_)) if insecure => {
                let plain = Url::parse(&format!("http://{}/", host))?;
                tracing::debug!(%host, "https probe failed, falling back to http");
                self.probe(&plain, host).await?;
                plain
            }
            Err(e) => return Err(e),
        };

        if let Ok(mut pings) = self.pings.write() {
            pings.insert(key, base.clone());
        }
        Ok(base)
    }

    async fn probe(&self, base: &Url, host: &str) -> Result<()> {
        let response = self.client.get(base.join("v2/")?).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.challenges.add_response(base, response.headers());
        }
        if status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::debug!(%base, %status, "registry supports v2");
            return Ok(());
        }
        let declared = response
            .headers()
            .get(API_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|part| part.trim() == API_VERSION_V2));
        if declared {
            return Ok(());
        }
        Err(RegistryError::NotV2Registry(host.to_string()))
    }
}

#[async_trait]
impl RepositoryProvider for Context {
    async fn repository(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>> {
        let base = self.ping(registry, insecure).await?;
        let tokens = TokenManager::new(
            self.client.clone(),
            self.scopes_for(repository),
            self.credentials.clone(),
            self.refresh_tokens.clone(),
        );
        let transport = Transport::new(
            self.client.clone(),
            base,
            repository,
            self.challenges.clone(),
            tokens,
            self.credentials.clone(),
        );
        let repo: Arc<dyn Repository> = Arc::new(HttpRepository::new(transport));
        if self.retries == 0 {
            return Ok(repo);
        }
        let policy = RetryPolicy::new(self.retries, self.retry_window).with_clock(self.clock.clone());
        Ok(Arc::new(RetryRepository::new(repo, policy)))
    }

    async fn repository_with_scopes(
        &self,
        registry: &str,
        repository: &str,
        insecure: bool,
        scopes: &[String],
    ) -> Result<Arc<dyn Repository>> {
        let mut all = self.scopes.clone();
        all.extend(scopes.iter().cloned());
        self.with_scopes(&all)
            .repository(registry, repository, insecure)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_contexts_share_caches() {
        let base = Context::new(ContextOptions::default()).unwrap();
        let pushing = base.with_actions(&["pull", "push"]).with_retry(3, Duration::from_secs(5));
        assert!(base.shares_caches(&pushing));
        assert_eq!(pushing.retries, 3);
        assert_eq!(base.retries, 0);
    }

    #[test]
    fn repository_scope_lists_actions() {
        let ctx = Context::new(ContextOptions::default())
            .unwrap()
            .with_actions(&["pull", "push"])
            .with_scopes(&["registry:catalog:*".to_string()]);
        assert_eq!(
            ctx.scopes_for("library/busybox"),
            vec![
                "repository:library/busybox:pull,push".to_string(),
                "registry:catalog:*".to_string(),
            ]
        );
    }
}
