//! Phased execution of a [`Plan`]
//!
//! [`greedy`] orders the repositories of a plan into phases. Within a
//! registry, the first repository to need a blob uploads it; any later
//! repository needing the same blob runs in a following phase so it can
//! mount the blob instead. Phases run one after another; the repositories
//! of a phase run concurrently, bounded per registry.

use crate::error::{RegistryError, Result};
use crate::concurrency::WorkQueue;
use crate::image::digest::Digest;
use crate::logging::Logger;
use crate::mirror::copy::{BlobOutcome, CopyOptions, copy_blob, push_manifest};
use crate::mirror::plan::Plan;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;

/// One repository of one registry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkUnit {
    pub registry: String,
    pub repository: String,
}

/// Units that may run concurrently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Phase {
    pub units: Vec<WorkUnit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    pub phases: Vec<Phase>,
}

impl WorkPlan {
    pub fn unit_count(&self) -> usize {
        self.phases.iter().map(|p| p.units.len()).sum()
    }
}

/// Split `plan` into phases of independent repositories
pub fn greedy(plan: &Plan) -> WorkPlan {
    let mut phases: BTreeMap<usize, Vec<WorkUnit>> = BTreeMap::new();
    for (registry_name, registry) in &plan.registries {
        let mut claimed: HashMap<&Digest, usize> = HashMap::new();
        for (repository_name, repository) in &registry.repositories {
            let phase = repository
                .blobs()
                .iter()
                .filter_map(|op| claimed.get(&op.descriptor.digest))
                .max()
                .map_or(0, |p| p + 1);
            for op in repository.blobs() {
                claimed.entry(&op.descriptor.digest).or_insert(phase);
            }
            phases.entry(phase).or_default().push(WorkUnit {
                registry: registry_name.clone(),
                repository: repository_name.clone(),
            });
        }
    }
    WorkPlan {
        phases: phases.into_values().map(|units| Phase { units }).collect(),
    }
}

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicU64,
    copied: AtomicUsize,
    mounted: AtomicUsize,
    skipped: AtomicUsize,
    manifests: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub phases: usize,
    pub bytes: u64,
    pub blobs_copied: usize,
    pub blobs_mounted: usize,
    pub blobs_skipped: usize,
    pub manifests: usize,
    /// Pushed references, `<digest> <reference>`
    pub pushed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_registry: usize,
    pub max_per_registry: usize,
    pub copy: CopyOptions,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_registry: 4,
            max_per_registry: 6,
            copy: CopyOptions::default(),
        }
    }
}

pub struct Scheduler {
    options: SchedulerOptions,
    logger: Logger,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, logger: Logger) -> Self {
        Self { options, logger }
    }

    /// Run `work` against `plan`. The first failing phase stops execution;
    /// work finished by earlier phases is kept.
    pub async fn execute(
        &self,
        plan: Arc<Plan>,
        work: &WorkPlan,
        stop: watch::Receiver<bool>,
    ) -> Result<ExecutionSummary> {
        let counters = Arc::new(Counters::default());
        let pushed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let outer = WorkQueue::new(self.options.max_registry, stop.clone());
        let inner: HashMap<String, WorkQueue> = plan
            .registries
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    WorkQueue::new(self.options.max_per_registry, stop.clone()),
                )
            })
            .collect();

        for (index, phase) in work.phases.iter().enumerate() {
            self.logger.step(&format!(
                "Phase {}/{}: {} repositories",
                index + 1,
                work.phases.len(),
                phase.units.len()
            ));

            let mut by_registry: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            for unit in &phase.units {
                by_registry
                    .entry(unit.registry.as_str())
                    .or_default()
                    .push(unit.repository.clone());
            }

            let result = outer
                .try_batch(|w| {
                    for (registry, repositories) in by_registry {
                        let Some(queue) = inner.get(registry).cloned() else {
                            continue;
                        };
                        let registry = registry.to_string();
                        let plan = plan.clone();
                        let counters = counters.clone();
                        let pushed = pushed.clone();
                        let logger = self.logger.clone();
                        let copy = self.options.copy;
                        w.try_work(async move {
                            let units = repositories.into_iter().map(|repository| {
                                run_unit(
                                    plan.clone(),
                                    queue.clone(),
                                    registry.clone(),
                                    repository,
                                    copy,
                                    counters.clone(),
                                    pushed.clone(),
                                    logger.clone(),
                                )
                            });
                            let results = futures::future::join_all(units).await;
                            results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
                        });
                    }
                })
                .await;

            if let Err(err) = result {
                self.logger
                    .error(&format!("Phase {} failed: {}", index + 1, err));
                return Err(err);
            }
            if *stop.borrow() {
                return Err(RegistryError::Cancelled(format!(
                    "stopped after phase {}/{}",
                    index + 1,
                    work.phases.len()
                )));
            }
        }

        let pushed = pushed
            .lock()
            .map(|p| p.clone())
            .map_err(|_| RegistryError::Io("result list lock poisoned".to_string()))?;
        Ok(ExecutionSummary {
            phases: work.phases.len(),
            bytes: counters.bytes.load(Ordering::SeqCst),
            blobs_copied: counters.copied.load(Ordering::SeqCst),
            blobs_mounted: counters.mounted.load(Ordering::SeqCst),
            blobs_skipped: counters.skipped.load(Ordering::SeqCst),
            manifests: counters.manifests.load(Ordering::SeqCst),
            pushed,
        })
    }
}

/// Copy every blob of one repository, then push its manifests. Blob and
/// manifest requests go through the registry's queue.
#[allow(clippy::too_many_arguments)]
async fn run_unit(
    plan: Arc<Plan>,
    queue: WorkQueue,
    registry: String,
    repository: String,
    copy: CopyOptions,
    counters: Arc<Counters>,
    pushed: Arc<std::sync::Mutex<Vec<String>>>,
    logger: Logger,
) -> Result<()> {
    let Some(repo) = plan.repository(&registry, &repository) else {
        return Ok(());
    };
    let target_name = repo.display_name();
    tracing::debug!(
        repository = %target_name,
        blobs = repo.blobs().len(),
        manifests = repo.manifests().len(),
        "starting repository"
    );

    let blob_count = repo.blobs().len();
    queue
        .try_batch(|w| {
            for index in 0..blob_count {
                let plan = plan.clone();
                let registry = registry.clone();
                let repository = repository.clone();
                let counters = counters.clone();
                let logger = logger.clone();
                w.try_work(async move {
                    let (Some(registry_plan), Some(repo)) = (
                        plan.registry(&registry),
                        plan.repository(&registry, &repository),
                    ) else {
                        return Ok(());
                    };
                    let op = &repo.blobs()[index];
                    let outcome = copy_blob(op, repo.to.as_ref(), registry_plan, &repository, copy)
                        .await
                        .map_err(|err| {
                            tracing::debug!(digest = %op.descriptor.digest, from = %op.from_name, error = %err, "blob copy failed");
                            err
                        })?;
                    match outcome {
                        BlobOutcome::Skipped => {
                            counters.skipped.fetch_add(1, Ordering::SeqCst);
                        }
                        BlobOutcome::Mounted => {
                            counters.mounted.fetch_add(1, Ordering::SeqCst);
                            logger.detail(&format!("Mounted {} into {}", op.descriptor.digest.short(), repository));
                        }
                        BlobOutcome::Copied(bytes) => {
                            counters.copied.fetch_add(1, Ordering::SeqCst);
                            counters.bytes.fetch_add(bytes, Ordering::SeqCst);
                            logger.transfer("Copied", &repo.display_name(), op.descriptor.digest.as_str(), bytes);
                        }
                    }
                    Ok(())
                });
            }
        })
        .await?;

    let manifest_count = repo.manifests().len();
    queue
        .try_batch(|w| {
            for index in 0..manifest_count {
                let plan = plan.clone();
                let registry = registry.clone();
                let repository = repository.clone();
                let counters = counters.clone();
                let pushed = pushed.clone();
                let logger = logger.clone();
                let target_name = target_name.clone();
                w.try_work(async move {
                    let Some(repo) = plan.repository(&registry, &repository) else {
                        return Ok(());
                    };
                    let op = &repo.manifests()[index];
                    let lines = push_manifest(op, repo.to.as_ref(), &target_name, &logger).await?;
                    counters.manifests.fetch_add(1, Ordering::SeqCst);
                    if let Ok(mut pushed) = pushed.lock() {
                        pushed.extend(lines);
                    }
                    Ok(())
                });
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::manifest::MEDIA_TYPE_LAYER;
    use crate::mirror::mapping::DestinationType;
    use crate::mirror::plan::{BlobCopyOperation, RepositoryPlan};
    use crate::registry::{MemoryRegistry, Repository};

    fn repo_with_blobs(
        source: &MemoryRegistry,
        target: &MemoryRegistry,
        name: &str,
        blobs: &[&[u8]],
    ) -> RepositoryPlan {
        let to: Arc<dyn Repository> = Arc::new(target.repository(name));
        let from: Arc<dyn Repository> = Arc::new(source.repository("src"));
        let mut repo = RepositoryPlan::new("target", name, DestinationType::Registry, to);
        for content in blobs {
            let descriptor = source.put_blob("src", MEDIA_TYPE_LAYER, content).unwrap();
            repo.add_blob(BlobCopyOperation {
                descriptor,
                from: from.clone(),
                from_name: "source/src".to_string(),
            });
        }
        repo
    }

    #[test]
    fn shared_blobs_push_later_repositories_to_a_new_phase() {
        let source = MemoryRegistry::new();
        let target = MemoryRegistry::new();
        let mut plan = Plan::new();
        let registry = plan.registry_mut("target");
        for (name, blobs) in [
            ("a", vec![&b"base"[..], &b"one"[..]]),
            ("b", vec![&b"base"[..], &b"two"[..]]),
            ("c", vec![&b"three"[..]]),
        ] {
            registry
                .repositories
                .insert(name.to_string(), repo_with_blobs(&source, &target, name, &blobs));
        }

        let work = greedy(&plan);
        assert_eq!(work.phases.len(), 2);
        let names: Vec<&str> = work.phases[0].units.iter().map(|u| u.repository.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(work.phases[1].units[0].repository, "b");
        assert_eq!(work.unit_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn later_phase_mounts_blobs_uploaded_earlier() {
        let source = MemoryRegistry::new();
        let target = MemoryRegistry::new();
        let mut plan = Plan::new();
        let registry = plan.registry_mut("target");
        registry
            .repositories
            .insert("a".to_string(), repo_with_blobs(&source, &target, "a", &[b"base layer"]));
        registry
            .repositories
            .insert("b".to_string(), repo_with_blobs(&source, &target, "b", &[b"base layer"]));
        plan.calculate_stats();

        let work = greedy(&plan);
        let (stop_tx, stop) = watch::channel(false);
        let scheduler = Scheduler::new(SchedulerOptions::default(), Logger::new_quiet());
        let summary = scheduler.execute(Arc::new(plan), &work, stop).await.unwrap();
        let _ = stop_tx.send(true);

        assert_eq!(summary.phases, 2);
        assert_eq!(summary.blobs_copied, 1);
        assert_eq!(summary.blobs_mounted, 1);
        assert_eq!(target.upload_count(), 1);
        assert_eq!(target.mount_count(), 1);
    }

    #[tokio::test]
    async fn failing_phase_halts_execution() {
        let source = MemoryRegistry::new();
        let target = MemoryRegistry::new();
        let mut plan = Plan::new();
        let registry = plan.registry_mut("target");
        let mut broken = repo_with_blobs(&source, &target, "a", &[b"shared"]);
        broken.add_blob(BlobCopyOperation {
            descriptor: crate::image::manifest::Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"missing"), 7),
            from: Arc::new(source.repository("src")),
            from_name: "source/src".to_string(),
        });
        registry.repositories.insert("a".to_string(), broken);
        registry
            .repositories
            .insert("b".to_string(), repo_with_blobs(&source, &target, "b", &[b"shared"]));

        let work = greedy(&plan);
        assert_eq!(work.phases.len(), 2);
        let (_stop_tx, stop) = watch::channel(false);
        let scheduler = Scheduler::new(SchedulerOptions::default(), Logger::new_quiet());
        let err = scheduler.execute(Arc::new(plan), &work, stop).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(target.mount_count(), 0);
        assert_eq!(target.upload_count(), 1);
    }

    #[tokio::test]
    async fn stopped_run_reports_cancellation() {
        let source = MemoryRegistry::new();
        let target = MemoryRegistry::new();
        let mut plan = Plan::new();
        plan.registry_mut("target")
            .repositories
            .insert("a".to_string(), repo_with_blobs(&source, &target, "a", &[b"layer"]));

        let work = greedy(&plan);
        let (stop_tx, stop) = watch::channel(false);
        stop_tx.send(true).unwrap();
        let scheduler = Scheduler::new(SchedulerOptions::default(), Logger::new_quiet());
        let err = scheduler.execute(Arc::new(plan), &work, stop).await.unwrap_err();

        assert!(matches!(err, RegistryError::Cancelled(_)));
        assert_eq!(target.upload_count(), 0);
    }
}
