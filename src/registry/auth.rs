//! Authentication challenges and credential sources
//!
//! Registries announce how to authenticate through `WWW-Authenticate`
//! headers. The [`ChallengeManager`] remembers those challenges per endpoint
//! so every repository created from one context reuses them. Credentials
//! are supplied by a [`CredentialStore`]; refresh tokens by a
//! [`RefreshTokenStore`]. Both are opaque to the rest of the engine.

use crate::error::{RegistryError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use url::Url;

/// One parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercase auth scheme, `bearer` or `basic`
    pub scheme: String,
    pub parameters: HashMap<String, String>,
}

impl Challenge {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Parse a `WWW-Authenticate` header value such as
/// `Bearer realm="https://auth.example/token",service="registry",scope="repository:a:pull,push"`
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges = Vec::new();
    let mut rest = header.trim();

    while !rest.is_empty() {
        let (scheme, after) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
            None => (rest, ""),
        };
        let mut parameters = HashMap::new();
        let mut remaining = after;

        loop {
            let Some(eq) = remaining.find('=') else { break };
            let key = remaining[..eq].trim();
            // A token without '=' before the next space starts a new challenge
            if key.is_empty() || key.contains(char::is_whitespace) {
                break;
            }
            let value_part = &remaining[eq + 1..];
            let (value, consumed) = if let Some(quoted) = value_part.strip_prefix('"') {
                let mut value = String::new();
                let mut escaped = false;
                let mut end = quoted.len();
                for (i, c) in quoted.char_indices() {
                    if escaped {
                        value.push(c);
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        end = i + 1;
                        break;
                    } else {
                        value.push(c);
                    }
                }
                (value, 1 + end)
            } else {
                let end = value_part.find(',').unwrap_or(value_part.len());
                (value_part[..end].trim().to_string(), end)
            };
            parameters.insert(key.to_ascii_lowercase(), value);
            remaining = value_part[consumed.min(value_part.len())..].trim_start();
            match remaining.strip_prefix(',') {
                Some(next) => remaining = next.trim_start(),
                None => break,
            }
        }

        if !scheme.is_empty() {
            challenges.push(Challenge {
                scheme: scheme.to_ascii_lowercase(),
                parameters,
            });
        }
        if remaining.len() == rest.len() {
            break;
        }
        rest = remaining;
    }
    challenges
}

/// Challenges captured per registry endpoint, shared by every repository of
/// one context
#[derive(Debug, Default)]
pub struct ChallengeManager {
    challenges: RwLock<HashMap<String, Vec<Challenge>>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(url: &Url) -> String {
        format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        )
    }

    /// Record the challenges carried by a 401 response. Returns true when a
    /// challenge was found.
    pub fn add_response(&self, url: &Url, headers: &HeaderMap) -> bool {
        let challenges: Vec<Challenge> = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_challenges)
            .collect();
        if challenges.is_empty() {
            return false;
        }
        if let Ok(mut map) = self.challenges.write() {
            map.insert(Self::key(url), challenges);
        }
        true
    }

    pub fn get(&self, url: &Url) -> Vec<Challenge> {
        self.challenges
            .read()
            .ok()
            .and_then(|map| map.get(&Self::key(url)).cloned())
            .unwrap_or_default()
    }
}

/// Username and password lookup for a registry endpoint
pub trait CredentialStore: Send + Sync {
    fn basic(&self, url: &Url) -> Option<(String, String)>;
}

/// Storage for OAuth refresh tokens issued by token servers
pub trait RefreshTokenStore: Send + Sync {
    fn refresh_token(&self, realm: &Url, service: &str) -> Option<String>;

    fn set_refresh_token(&self, realm: &Url, service: &str, token: String);
}

/// Anonymous access
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn basic(&self, _url: &Url) -> Option<(String, String)> {
        None
    }
}

/// Fixed credentials per registry host; an empty host matches every registry
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, (String, String)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, username: &str, password: &str) -> Self {
        self.entries.insert(
            host.to_string(),
            (username.to_string(), password.to_string()),
        );
        self
    }
}

fn url_host(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

impl CredentialStore for StaticCredentials {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.entries
            .get(&url_host(url))
            .or_else(|| self.entries.get(""))
            .cloned()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials read from a Docker `config.json`
#[derive(Debug, Default, Clone)]
pub struct DockerConfigCredentials {
    entries: HashMap<String, (String, String)>,
}

impl DockerConfigCredentials {
    /// `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
    }

    /// Load the default file; a missing file yields an empty store
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &[u8]) -> Result<Self> {
        let file: DockerConfigFile = serde_json::from_slice(content)?;
        let mut entries = HashMap::new();
        for (server, entry) in file.auths {
            let credentials = match (entry.auth, entry.username, entry.password) {
                (Some(auth), _, _) if !auth.is_empty() => {
                    let decoded = STANDARD.decode(auth.trim()).map_err(|e| {
                        RegistryError::Parse(format!("invalid auth entry for {}: {}", server, e))
                    })?;
                    let decoded = String::from_utf8_lossy(&decoded).into_owned();
                    let (user, pass) = decoded.split_once(':').ok_or_else(|| {
                        RegistryError::Parse(format!("auth entry for {} is not user:password", server))
                    })?;
                    (user.to_string(), pass.to_string())
                }
                (_, Some(user), Some(pass)) => (user, pass),
                _ => continue,
            };
            entries.insert(normalize_server(&server), credentials);
        }
        Ok(Self { entries })
    }
}

/// `https://index.docker.io/v1/` and friends reduce to a bare host
fn normalize_server(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "docker.io" => "registry-1.docker.io".to_string(),
        other => other.to_string(),
    }
}

impl CredentialStore for DockerConfigCredentials {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.entries.get(&url_host(url)).cloned()
    }
}

/// Process-local refresh token storage
#[derive(Debug, Default)]
pub struct MemoryRefreshTokens {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryRefreshTokens {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshTokenStore for MemoryRefreshTokens {
    fn refresh_token(&self, realm: &Url, service: &str) -> Option<String> {
        self.tokens
            .read()
            .ok()
            .and_then(|t| t.get(&format!("{}|{}", realm, service)).cloned())
    }

    fn set_refresh_token(&self, realm: &Url, service: &str, token: String) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(format!("{}|{}", realm, service), token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_bearer_challenge_with_commas_in_scope() {
        let challenges = parse_challenges(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:team/app:pull,push""#,
        );
        assert_eq!(challenges.len(), 1);
        let c = &challenges[0];
        assert_eq!(c.scheme, "bearer");
        assert_eq!(c.parameter("realm"), Some("https://auth.example.com/token"));
        assert_eq!(c.parameter("service"), Some("registry.example.com"));
        assert_eq!(c.parameter("scope"), Some("repository:team/app:pull,push"));
    }

    #[test]
    fn parses_basic_challenge() {
        let challenges = parse_challenges(r#"Basic realm="Registry Realm""#);
        assert_eq!(challenges[0].scheme, "basic");
        assert_eq!(challenges[0].parameter("realm"), Some("Registry Realm"));
    }

    #[test]
    fn manager_shares_challenges_per_endpoint() {
        let manager = ChallengeManager::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer realm="https://auth/token",service="reg""#),
        );
        let ping = Url::parse("https://registry.example.com/v2/").unwrap();
        assert!(manager.add_response(&ping, &headers));

        let other_path = Url::parse("https://registry.example.com/v2/a/b/manifests/latest").unwrap();
        assert_eq!(manager.get(&other_path).len(), 1);
        let other_host = Url::parse("https://other.example.com/v2/").unwrap();
        assert!(manager.get(&other_host).is_empty());
    }

    #[test]
    fn docker_config_decodes_auth_entries() {
        let config = format!(
            r#"{{"auths": {{
                "https://index.docker.io/v1/": {{"auth": "{}"}},
                "quay.io": {{"username": "robot", "password": "secret"}},
                "empty.io": {{}}
            }}}}"#,
            STANDARD.encode("user:pa:ss")
        );
        let store = DockerConfigCredentials::parse(config.as_bytes()).unwrap();
        let hub = Url::parse("https://registry-1.docker.io/v2/").unwrap();
        assert_eq!(store.basic(&hub), Some(("user".into(), "pa:ss".into())));
        let quay = Url::parse("https://quay.io/v2/").unwrap();
        assert_eq!(store.basic(&quay), Some(("robot".into(), "secret".into())));
        let empty = Url::parse("https://empty.io/v2/").unwrap();
        assert_eq!(store.basic(&empty), None);
    }

    #[test]
    fn static_credentials_fall_back_to_wildcard() {
        let store = StaticCredentials::new()
            .with("localhost:5000", "a", "b")
            .with("", "any", "thing");
        let local = Url::parse("http://localhost:5000/v2/").unwrap();
        assert_eq!(store.basic(&local), Some(("a".into(), "b".into())));
        let other = Url::parse("https://quay.io/v2/").unwrap();
        assert_eq!(store.basic(&other), Some(("any".into(), "thing".into())));
    }
}
