//! Docker image configuration
//!
//! The config blob referenced by a schema2 manifest, or the equivalent
//! reconstructed from schema1 history. Unknown fields survive a round trip
//! through `extra`.

use crate::image::digest::Digest;
use crate::image::manifest::Descriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// Total compressed size of all layers
    #[serde(rename = "size", default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl ImageConfig {
    /// Config for an image built from nothing
    pub fn scratch(os: &str, architecture: &str) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            config: Some(ContainerConfig::default()),
            rootfs: Some(RootFs::default()),
            ..Default::default()
        }
    }

    pub fn diff_ids(&self) -> &[String] {
        self.rootfs
            .as_ref()
            .map(|r| r.diff_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Append a layer's diff ID and account for its size. An unknown diff ID
    /// is recorded as an empty string and filled in later.
    pub fn add_layer(&mut self, layer: &Descriptor, diff_id: Option<&Digest>) {
        let rootfs = self.rootfs.get_or_insert_with(RootFs::default);
        rootfs
            .diff_ids
            .push(diff_id.map(|d| d.to_string()).unwrap_or_default());
        self.size += layer.size;
    }

    /// Number of history entries that produced a filesystem layer
    pub fn non_empty_history(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_unknown_fields() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "docker_version": "19.03",
            "config": {"Env": ["PATH=/bin"], "StopSignal": "SIGTERM"},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aa"]},
            "history": [{"created_by": "ADD file", "empty_layer": false}]
        }"#;
        let config: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.extra.get("docker_version"), Some(&Value::from("19.03")));
        let container = config.config.as_ref().unwrap();
        assert_eq!(container.extra.get("StopSignal"), Some(&Value::from("SIGTERM")));

        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(encoded["docker_version"], "19.03");
        assert_eq!(encoded["config"]["StopSignal"], "SIGTERM");
        assert!(encoded["history"][0].get("empty_layer").is_none());
    }

    #[test]
    fn add_layer_tracks_size_and_diff_ids() {
        let mut config = ImageConfig::scratch("linux", "amd64");
        let layer = Descriptor::new("layer", Digest::from_bytes(b"blob"), 42);
        config.add_layer(&layer, Some(&Digest::from_bytes(b"tar")));
        config.add_layer(&layer, None);
        assert_eq!(config.size, 84);
        assert_eq!(config.diff_ids().len(), 2);
        assert_eq!(config.diff_ids()[1], "");
    }
}
