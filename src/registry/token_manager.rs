//! Bearer token acquisition and caching
//!
//! One [`TokenManager`] serves one repository handle. It requests tokens for
//! that repository's scopes from the realm announced by the registry's
//! challenge and reuses them until they expire or a request is rejected.

use crate::error::handlers::HttpErrorHandler;
use crate::error::{RegistryError, Result};
use crate::registry::auth::{Challenge, CredentialStore, RefreshTokenStore};
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use url::Url;

/// Lifetime assumed when the token server does not say
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);
const CLIENT_ID: &str = "docker-image-mirror";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub realm: String,
    pub service: String,
    pub expires_at: Instant,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe token cache for one repository
#[derive(Clone)]
pub struct TokenManager {
    client: Client,
    scopes: Vec<String>,
    credentials: Arc<dyn CredentialStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    token_info: Arc<RwLock<Option<TokenInfo>>>,
}

impl TokenManager {
    pub fn new(
        client: Client,
        scopes: Vec<String>,
        credentials: Arc<dyn CredentialStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        Self {
            client,
            scopes,
            credentials,
            refresh_tokens,
            token_info: Arc::new(RwLock::new(None)),
        }
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Drop the cached token so the next request fetches a fresh one
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.token_info.write() {
            *guard = None;
        }
    }

    /// A valid token for `challenge`, fetched when missing or expired
    pub async fn get_valid_token(&self, challenge: &Challenge, registry: &Url) -> Result<String> {
        let realm = challenge.parameter("realm").ok_or_else(|| {
            RegistryError::Unauthorized(format!("bearer challenge from {} has no realm", registry))
        })?;
        let service = challenge.parameter("service").unwrap_or_default();

        if let Ok(guard) = self.token_info.read() {
            if let Some(info) = guard.as_ref() {
                if !info.is_expired() && info.realm == realm && info.service == service {
                    return Ok(info.token.clone());
                }
            }
        }

        let info = self.fetch_token(realm, service, registry).await?;
        let token = info.token.clone();
        if let Ok(mut guard) = self.token_info.write() {
            *guard = Some(info);
        }
        Ok(token)
    }

    async fn fetch_token(&self, realm: &str, service: &str, registry: &Url) -> Result<TokenInfo> {
        let realm_url = Url::parse(realm)?;
        let credentials = self.credentials.basic(registry);
        let refresh_token = self.refresh_tokens.refresh_token(&realm_url, service);

        let request = match (&credentials, refresh_token) {
            (None, Some(refresh_token)) => {
                tracing::debug!(%realm, %service, "exchanging refresh token");
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token),
                    ("service", service.to_string()),
                    ("client_id", CLIENT_ID.to_string()),
                ];
                if !self.scopes.is_empty() {
                    form.push(("scope", self.scopes.join(" ")));
                }
                self.client.post(realm_url.clone()).form(&form)
            }
            _ => {
                let mut url = realm_url.clone();
                {
                    let mut query = url.query_pairs_mut();
                    if !service.is_empty() {
                        query.append_pair("service", service);
                    }
                    for scope in &self.scopes {
                        query.append_pair("scope", scope);
                    }
                    if credentials.is_some() {
                        query.append_pair("offline_token", "true");
                        query.append_pair("client_id", CLIENT_ID);
                    }
                }
                tracing::debug!(%url, authenticated = credentials.is_some(), "requesting registry token");
                let request = self.client.get(url);
                match &credentials {
                    Some((user, pass)) => request.basic_auth(user, Some(pass)),
                    None => request,
                }
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text, realm));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(format!("invalid token response from {}: {}", realm, e)))?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Unauthorized(format!("token server {} returned no token", realm)))?;
        if let Some(refresh_token) = body.refresh_token {
            self.refresh_tokens
                .set_refresh_token(&realm_url, service, refresh_token);
        }

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok(TokenInfo {
            token,
            realm: realm.to_string(),
            service: service.to_string(),
            expires_at: Instant::now() + lifetime,
        })
    }
}
