//! Configuration management module

use crate::error::{RegistryError, Result};
use crate::registry::auth::StaticCredentials;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "IMAGE_MIRROR_";

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(RegistryError::Validation(
                "Username cannot be empty".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(RegistryError::Validation(
                "Password cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Credentials offered to every registry
    pub fn credentials(&self) -> StaticCredentials {
        StaticCredentials::new().with("", &self.username, &self.password)
    }
}

/// Engine settings shared by every subcommand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Registries worked on at once
    pub max_registry: usize,
    /// Blob and manifest operations at once within one registry
    pub max_per_registry: usize,
    pub retries: u32,
    pub retry_window_secs: u64,
    pub insecure: bool,
    pub force: bool,
    pub skip_mount: bool,
    pub skip_missing: bool,
    pub dry_run: bool,
    pub filter_by_os: Option<String>,
    pub verbose: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_registry: 4,
            max_per_registry: 6,
            retries: 2,
            retry_window_secs: 10,
            insecure: false,
            force: false,
            skip_mount: false,
            skip_missing: false,
            dry_run: false,
            filter_by_os: None,
            verbose: false,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_flag(name: &str) -> Option<bool> {
    env_var(name).map(|val| val.to_lowercase() == "true" || val == "1")
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|val| val.parse().ok())
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_registry == 0 {
            return Err(RegistryError::Validation(
                "max_registry must be greater than 0".to_string(),
            ));
        }
        if self.max_per_registry == 0 {
            return Err(RegistryError::Validation(
                "max_per_registry must be greater than 0".to_string(),
            ));
        }
        if self.retries > 0 && self.retry_window_secs == 0 {
            return Err(RegistryError::Validation(
                "retry_window_secs must be greater than 0 when retries are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.retry_window_secs)
    }

    /// Create config from `IMAGE_MIRROR_*` environment variables and defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(max_registry) = env_number("MAX_REGISTRY") {
            config.max_registry = max_registry;
        }
        if let Some(max_per_registry) = env_number("MAX_PER_REGISTRY") {
            config.max_per_registry = max_per_registry;
        }
        if let Some(retries) = env_number("RETRIES") {
            config.retries = retries;
        }
        if let Some(window) = env_number("RETRY_WINDOW_SECS") {
            config.retry_window_secs = window;
        }
        if let Some(insecure) = env_flag("INSECURE") {
            config.insecure = insecure;
        }
        if let Some(skip_mount) = env_flag("SKIP_MOUNT") {
            config.skip_mount = skip_mount;
        }
        if let Some(filter) = env_var("FILTER_BY_OS") {
            config.filter_by_os = Some(filter);
        }
        if let Some(verbose) = env_flag("VERBOSE") {
            config.verbose = verbose;
        }

        config
    }

    /// Merge with another config, preferring non-default values
    pub fn merge(mut self, other: &SyncConfig) -> Self {
        let default = SyncConfig::default();

        if other.max_registry != default.max_registry {
            self.max_registry = other.max_registry;
        }
        if other.max_per_registry != default.max_per_registry {
            self.max_per_registry = other.max_per_registry;
        }
        if other.retries != default.retries {
            self.retries = other.retries;
        }
        if other.retry_window_secs != default.retry_window_secs {
            self.retry_window_secs = other.retry_window_secs;
        }
        if other.insecure != default.insecure {
            self.insecure = other.insecure;
        }
        if other.force != default.force {
            self.force = other.force;
        }
        if other.skip_mount != default.skip_mount {
            self.skip_mount = other.skip_mount;
        }
        if other.skip_missing != default.skip_missing {
            self.skip_missing = other.skip_missing;
        }
        if other.dry_run != default.dry_run {
            self.dry_run = other.dry_run;
        }
        if other.filter_by_os.is_some() {
            self.filter_by_os = other.filter_by_os.clone();
        }
        if other.verbose != default.verbose {
            self.verbose = other.verbose;
        }

        self
    }
}
