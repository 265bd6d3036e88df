//! Copy plan: registry → repository → blob and manifest operations
//!
//! Built once by the planner, trimmed, then handed to the scheduler. Only
//! the blob association map changes after planning: it records which
//! repository of a registry is known to hold a blob, so later copies can
//! request a cross-repository mount.

use crate::error::RegistryError;
use crate::image::digest::Digest;
use crate::image::manifest::{Descriptor, Manifest};
use crate::mirror::mapping::DestinationType;
use crate::registry::{BlobService, Repository};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Copy one blob from a source repository
#[derive(Clone)]
pub struct BlobCopyOperation {
    pub descriptor: Descriptor,
    pub from: Arc<dyn Repository>,
    /// `registry/repository` of the source, for messages
    pub from_name: String,
}

/// Push one manifest (and its list children) under a set of tags
#[derive(Clone)]
pub struct ManifestCopyOperation {
    pub digest: Digest,
    pub manifest: Manifest,
    /// Pushed by digest before `manifest`
    pub children: Vec<Manifest>,
    /// Empty means push by digest only
    pub tags: Vec<String>,
    /// Blobs of the source, used for schema1 down-conversion
    pub from_blobs: Arc<dyn BlobService>,
    /// The destination already held the manifest at planning time
    pub pre_existing: bool,
}

pub struct RepositoryPlan {
    pub registry: String,
    pub name: String,
    pub destination_type: DestinationType,
    pub to: Arc<dyn Repository>,
    blobs: Vec<BlobCopyOperation>,
    blob_digests: HashSet<Digest>,
    manifests: Vec<ManifestCopyOperation>,
}

impl RepositoryPlan {
    pub fn new(
        registry: &str,
        name: &str,
        destination_type: DestinationType,
        to: Arc<dyn Repository>,
    ) -> Self {
        Self {
            registry: registry.to_string(),
            name: name.to_string(),
            destination_type,
            to,
            blobs: Vec::new(),
            blob_digests: HashSet::new(),
            manifests: Vec::new(),
        }
    }

    /// Schedule a blob copy unless one is already planned for the digest
    pub fn add_blob(&mut self, op: BlobCopyOperation) {
        if self.blob_digests.insert(op.descriptor.digest.clone()) {
            self.blobs.push(op);
        }
    }

    /// Schedule a manifest push, merging tags into an existing push of the
    /// same digest
    pub fn add_manifest(&mut self, op: ManifestCopyOperation) {
        if let Some(existing) = self.manifests.iter_mut().find(|m| m.digest == op.digest) {
            for tag in op.tags {
                if !existing.tags.contains(&tag) {
                    existing.tags.push(tag);
                }
            }
            existing.pre_existing &= op.pre_existing;
            return;
        }
        self.manifests.push(op);
    }

    pub fn blobs(&self) -> &[BlobCopyOperation] {
        &self.blobs
    }

    pub fn manifests(&self) -> &[ManifestCopyOperation] {
        &self.manifests
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty() && self.manifests.is_empty()
    }

    /// `registry/repository`, prefixed with `s3://` for S3 targets
    pub fn display_name(&self) -> String {
        match self.destination_type {
            DestinationType::S3 => format!("s3://{}/{}", self.registry, self.name),
            DestinationType::Registry => format!("{}/{}", self.registry, self.name),
        }
    }
}

pub struct RegistryPlan {
    pub name: String,
    pub repositories: BTreeMap<String, RepositoryPlan>,
    /// blob digest → repository known to hold it
    associations: Mutex<HashMap<Digest, String>>,
}

impl RegistryPlan {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            repositories: BTreeMap::new(),
            associations: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `repository` holds `digest`. The first association wins.
    pub fn associate(&self, digest: &Digest, repository: &str) {
        if let Ok(mut map) = self.associations.lock() {
            map.entry(digest.clone())
                .or_insert_with(|| repository.to_string());
        }
    }

    /// A repository other than `exclude` that holds `digest`
    pub fn mount_source(&self, digest: &Digest, exclude: &str) -> Option<String> {
        let map = self.associations.lock().ok()?;
        map.get(digest).filter(|repo| repo.as_str() != exclude).cloned()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub repositories: usize,
    pub blobs: usize,
    pub bytes: u64,
    pub manifests: usize,
}

#[derive(Default)]
pub struct Plan {
    pub registries: BTreeMap<String, RegistryPlan>,
    errors: Vec<RegistryError>,
    stats: PlanStats,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry_mut(&mut self, name: &str) -> &mut RegistryPlan {
        self.registries
            .entry(name.to_string())
            .or_insert_with(|| RegistryPlan::new(name))
    }

    pub fn registry(&self, name: &str) -> Option<&RegistryPlan> {
        self.registries.get(name)
    }

    pub fn repository(&self, registry: &str, name: &str) -> Option<&RepositoryPlan> {
        self.registries.get(registry)?.repositories.get(name)
    }

    pub fn add_error(&mut self, err: RegistryError) {
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[RegistryError] {
        &self.errors
    }

    /// Drop repositories and registries with nothing to do
    pub fn trim(&mut self) {
        for registry in self.registries.values_mut() {
            registry.repositories.retain(|_, repo| !repo.is_empty());
        }
        self.registries.retain(|_, registry| !registry.repositories.is_empty());
        self.calculate_stats();
    }

    pub fn calculate_stats(&mut self) {
        let mut stats = PlanStats::default();
        for repo in self.registries.values().flat_map(|r| r.repositories.values()) {
            stats.repositories += 1;
            stats.blobs += repo.blobs.len();
            stats.bytes += repo.blobs.iter().map(|b| b.descriptor.size).sum::<u64>();
            stats.manifests += repo.manifests.len();
        }
        self.stats = stats;
    }

    pub fn stats(&self) -> PlanStats {
        self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    fn blob(repo: &Arc<dyn Repository>, content: &[u8]) -> BlobCopyOperation {
        BlobCopyOperation {
            descriptor: Descriptor::new("layer", Digest::from_bytes(content), content.len() as u64),
            from: repo.clone(),
            from_name: "registry.local/src".to_string(),
        }
    }

    #[test]
    fn trim_drops_empty_nodes_and_totals_bytes() {
        let registry = MemoryRegistry::new();
        let to: Arc<dyn Repository> = Arc::new(registry.repository("dst"));
        let mut plan = Plan::new();

        let target = plan.registry_mut("registry.local");
        let mut repo = RepositoryPlan::new("registry.local", "dst", DestinationType::Registry, to.clone());
        repo.add_blob(blob(&to, b"abc"));
        repo.add_blob(blob(&to, b"abc"));
        repo.add_blob(blob(&to, b"defg"));
        target.repositories.insert("dst".to_string(), repo);
        target.repositories.insert(
            "idle".to_string(),
            RepositoryPlan::new("registry.local", "idle", DestinationType::Registry, to),
        );
        plan.registry_mut("empty.local");

        plan.trim();
        assert_eq!(plan.registries.len(), 1);
        assert_eq!(
            plan.stats(),
            PlanStats {
                repositories: 1,
                blobs: 2,
                bytes: 7,
                manifests: 0,
            }
        );
    }

    #[test]
    fn mount_source_excludes_the_requesting_repository() {
        let registry = RegistryPlan::new("registry.local");
        let digest = Digest::from_bytes(b"layer");
        registry.associate(&digest, "a");
        registry.associate(&digest, "b");
        assert_eq!(registry.mount_source(&digest, "b"), Some("a".to_string()));
        assert_eq!(registry.mount_source(&digest, "a"), None);
    }
}
