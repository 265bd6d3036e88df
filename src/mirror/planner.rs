//! Build a [`Plan`] from mappings
//!
//! Mappings are grouped by source repository. Each source is resolved in
//! two passes: every requested tag is turned into a digest first, then each
//! digest is fetched, narrowed by the platform filter and scheduled for
//! every destination it maps to. Planning only reads; nothing is written
//! until the scheduler runs the plan.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::Manifest;
use crate::image::reference::ImageReference;
use crate::image::resolve::{ProcessedManifest, process_manifest_list};
use crate::logging::Logger;
use crate::mirror::MirrorOptions;
use crate::mirror::mapping::{DestinationType, Mapping};
use crate::mirror::plan::{BlobCopyOperation, ManifestCopyOperation, Plan, RepositoryPlan};
use crate::registry::{Repository, RepositoryProvider};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where one source digest or tag must be pushed
#[derive(Debug, Clone)]
struct Target {
    destination: ImageReference,
    kind: DestinationType,
}

#[derive(Default)]
struct SourceNode {
    reference: Option<ImageReference>,
    tags: BTreeMap<String, Vec<Target>>,
    digests: BTreeMap<Digest, Vec<Target>>,
}

fn build_source_tree(mappings: &[Mapping]) -> BTreeMap<(String, String), SourceNode> {
    let mut tree: BTreeMap<(String, String), SourceNode> = BTreeMap::new();
    for mapping in mappings {
        let source = &mapping.source;
        let node = tree
            .entry((source.registry.clone(), source.repository.clone()))
            .or_default();
        node.reference
            .get_or_insert_with(|| ImageReference {
                tag: None,
                digest: None,
                ..source.clone()
            });
        let target = Target {
            destination: mapping.destination.clone(),
            kind: mapping.destination_type,
        };
        match (&source.digest, &source.tag) {
            (Some(digest), _) => node.digests.entry(digest.clone()).or_default().push(target),
            (None, Some(tag)) => node.tags.entry(tag.clone()).or_default().push(target),
            (None, None) => {}
        }
    }
    tree
}

/// Destinations of one digest grouped by target repository
fn group_targets(targets: &[Target]) -> BTreeMap<(DestinationType, String, String), Vec<String>> {
    let mut groups: BTreeMap<(DestinationType, String, String), Vec<String>> = BTreeMap::new();
    for target in targets {
        let tags = groups
            .entry((
                target.kind,
                target.destination.registry.clone(),
                target.destination.repository.clone(),
            ))
            .or_default();
        if let Some(tag) = &target.destination.tag {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }
    groups
}

pub struct Planner {
    sources: Arc<dyn RepositoryProvider>,
    destinations: Arc<dyn RepositoryProvider>,
    s3: Option<Arc<dyn RepositoryProvider>>,
    options: MirrorOptions,
    logger: Logger,
}

impl Planner {
    pub fn new(
        sources: Arc<dyn RepositoryProvider>,
        destinations: Arc<dyn RepositoryProvider>,
        options: MirrorOptions,
        logger: Logger,
    ) -> Self {
        Self {
            sources,
            destinations,
            s3: None,
            options,
            logger,
        }
    }

    /// Provider used for `s3://` destinations
    pub fn with_s3(mut self, provider: Arc<dyn RepositoryProvider>) -> Self {
        self.s3 = Some(provider);
        self
    }

    /// Resolve every mapping and build the trimmed plan. Failures are
    /// collected in [`Plan::errors`] rather than returned.
    pub async fn plan(&self, mappings: &[Mapping]) -> Plan {
        let mut plan = Plan::new();
        for ((registry, repository), mut node) in build_source_tree(mappings) {
            let name = format!("{}/{}", registry, repository);
            let repo = match self
                .sources
                .repository(&registry, &repository, self.options.insecure)
                .await
            {
                Ok(repo) => repo,
                Err(err) => {
                    plan.add_error(RegistryError::Validation(format!(
                        "unable to connect to {}: {}",
                        name, err
                    )));
                    continue;
                }
            };

            self.resolve_tags(&name, repo.as_ref(), &mut node, &mut plan).await;

            let Some(source) = node.reference.as_ref() else {
                continue;
            };
            for (digest, targets) in &node.digests {
                self.plan_digest(source, repo.clone(), digest, targets, &mut plan)
                    .await;
            }
        }
        plan.trim();
        plan
    }

    async fn resolve_tags(&self, name: &str, repo: &dyn Repository, node: &mut SourceNode, plan: &mut Plan) {
        let tags = repo.tags();
        for (tag, targets) in std::mem::take(&mut node.tags) {
            match tags.get(&tag).await {
                Ok(descriptor) => {
                    tracing::debug!(source = %name, %tag, digest = %descriptor.digest, "resolved tag");
                    node.digests
                        .entry(descriptor.digest)
                        .or_default()
                        .extend(targets);
                }
                Err(err) if err.is_not_found() && self.options.skip_missing => {
                    self.logger
                        .warning(&format!("Skipping missing tag {}:{}", name, tag));
                }
                Err(err) => plan.add_error(match err {
                    RegistryError::TagUnknown(_) | RegistryError::ManifestUnknown(_) => {
                        RegistryError::TagUnknown(format!("{}:{}", name, tag))
                    }
                    other => other,
                }),
            }
        }
    }

    async fn plan_digest(
        &self,
        source: &ImageReference,
        from: Arc<dyn Repository>,
        digest: &Digest,
        targets: &[Target],
        plan: &mut Plan,
    ) {
        let source_ref = source.with_digest(digest.clone());
        let manifest = match from.manifests().get(digest).await {
            Ok(manifest) => manifest,
            Err(err) if err.is_not_found() && self.options.skip_missing => {
                self.logger
                    .warning(&format!("Skipping missing manifest {}", source_ref));
                return;
            }
            Err(err) => {
                plan.add_error(match err {
                    RegistryError::ManifestUnknown(_) => RegistryError::ManifestUnknown(source_ref.to_string()),
                    other => other,
                });
                return;
            }
        };

        let processed = match process_manifest_list(
            digest,
            manifest,
            from.as_ref(),
            &self.options.filter,
            self.options.keep_manifest_list,
        )
        .await
        {
            Ok(Some(processed)) => processed,
            Ok(None) => {
                self.logger.info(&format!(
                    "Skipping {}, no images matched the platform filter",
                    source_ref
                ));
                return;
            }
            Err(err) => {
                plan.add_error(err);
                return;
            }
        };

        for ((kind, registry, repository), tags) in group_targets(targets) {
            if let Err(err) = self
                .plan_destination(source, &from, &processed, kind, &registry, &repository, tags, plan)
                .await
            {
                plan.add_error(err);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_destination(
        &self,
        source: &ImageReference,
        from: &Arc<dyn Repository>,
        processed: &ProcessedManifest,
        kind: DestinationType,
        registry: &str,
        repository: &str,
        tags: Vec<String>,
        plan: &mut Plan,
    ) -> Result<()> {
        let same_registry = kind == DestinationType::Registry && source.registry == registry;
        let same_repository = same_registry && source.repository == repository;

        let to = match plan
            .repository(registry, repository)
            .filter(|existing| existing.destination_type == kind)
        {
            Some(existing) => existing.to.clone(),
            None => {
                let provider = match kind {
                    DestinationType::Registry => self.destinations.clone(),
                    DestinationType::S3 => self.s3.clone().ok_or_else(|| {
                        RegistryError::Validation(format!(
                            "s3://{}/{} requires an S3 provider",
                            registry, repository
                        ))
                    })?,
                };
                // Mounting from the source needs pull access on it
                let scopes = if same_registry && !same_repository {
                    vec![format!("repository:{}:pull", source.repository)]
                } else {
                    Vec::new()
                };
                provider
                    .repository_with_scopes(registry, repository, self.options.insecure, &scopes)
                    .await?
            }
        };

        let must_copy = if self.options.force || !same_repository {
            true
        } else {
            !to.manifests().exists(&processed.digest).await?
        };
        if !must_copy {
            tracing::debug!(
                digest = %processed.digest,
                destination = %format!("{}/{}", registry, repository),
                "manifest already present"
            );
        }

        let mut blobs = Vec::new();
        if must_copy {
            let images: Vec<&Manifest> = if processed.children.is_empty() {
                vec![&processed.manifest]
            } else {
                processed.children.iter().collect()
            };
            blobs.extend(images.into_iter().flat_map(|image| image.references()));
        }

        let registry_plan = plan.registry_mut(registry);
        if same_registry {
            for descriptor in &blobs {
                registry_plan.associate(&descriptor.digest, &source.repository);
            }
        }
        let repo_plan = registry_plan
            .repositories
            .entry(repository.to_string())
            .or_insert_with(|| RepositoryPlan::new(registry, repository, kind, to.clone()));

        let from_name = source.name();
        for descriptor in blobs {
            repo_plan.add_blob(BlobCopyOperation {
                descriptor,
                from: from.clone(),
                from_name: from_name.clone(),
            });
        }
        repo_plan.add_manifest(ManifestCopyOperation {
            digest: processed.digest.clone(),
            manifest: processed.manifest.clone(),
            children: processed.children.clone(),
            tags,
            from_blobs: from.blobs(),
            pre_existing: !must_copy,
        });
        Ok(())
    }
}
