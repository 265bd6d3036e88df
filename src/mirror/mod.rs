//! Registry to registry mirroring
//!
//! A run is split in two: [`planner::Planner`] resolves mappings into a
//! [`plan::Plan`] without writing anything, then [`scheduler::Scheduler`]
//! executes it phase by phase. [`Mirror`] wires both together.

pub mod copy;
pub mod mapping;
pub mod plan;
pub mod planner;
pub mod scheduler;

use crate::error::{RegistryError, Result};
use crate::image::resolve::PlatformFilter;
use crate::logging::Logger;
use crate::registry::{DryRunProvider, RepositoryProvider};
use std::sync::Arc;
use tokio::sync::watch;

pub use copy::CopyOptions;
pub use mapping::{DestinationType, Mapping, MappingParser};
pub use plan::{Plan, PlanStats};
pub use planner::Planner;
pub use scheduler::{ExecutionSummary, Scheduler, SchedulerOptions, WorkPlan, greedy};

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub filter: PlatformFilter,
    /// Push a filtered list even when only one image survives
    pub keep_manifest_list: bool,
    /// Copy blobs and manifests even when the destination has them
    pub force: bool,
    pub skip_mount: bool,
    /// Warn instead of failing on unknown tags and manifests
    pub skip_missing: bool,
    pub insecure: bool,
    pub dry_run: bool,
    pub max_registry: usize,
    pub max_per_registry: usize,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            filter: PlatformFilter::All,
            keep_manifest_list: false,
            force: false,
            skip_mount: false,
            skip_missing: false,
            insecure: false,
            dry_run: false,
            max_registry: 4,
            max_per_registry: 6,
        }
    }
}

impl MirrorOptions {
    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_registry: self.max_registry,
            max_per_registry: self.max_per_registry,
            copy: CopyOptions {
                force: self.force,
                skip_mount: self.skip_mount,
            },
        }
    }
}

pub struct Mirror {
    planner: Planner,
    options: MirrorOptions,
    logger: Logger,
}

impl Mirror {
    /// Destinations (and the S3 provider, if any) are wrapped so writes are
    /// discarded when `options.dry_run` is set.
    pub fn new(
        sources: Arc<dyn RepositoryProvider>,
        destinations: Arc<dyn RepositoryProvider>,
        s3: Option<Arc<dyn RepositoryProvider>>,
        options: MirrorOptions,
        logger: Logger,
    ) -> Self {
        let wrap = |provider: Arc<dyn RepositoryProvider>| -> Arc<dyn RepositoryProvider> {
            if options.dry_run {
                Arc::new(DryRunProvider::new(provider))
            } else {
                provider
            }
        };
        let mut planner = Planner::new(sources, wrap(destinations), options.clone(), logger.clone());
        if let Some(s3) = s3 {
            planner = planner.with_s3(wrap(s3));
        }
        Self {
            planner,
            options,
            logger,
        }
    }

    /// Build the plan, failing with every collected error at once
    pub async fn plan(&self, mappings: &[Mapping]) -> Result<Plan> {
        let plan = self.planner.plan(mappings).await;
        if !plan.errors().is_empty() {
            return Err(RegistryError::Plan(plan.errors().to_vec()));
        }
        Ok(plan)
    }

    /// Plan and execute `mappings`
    pub async fn run(&self, mappings: &[Mapping]) -> Result<ExecutionSummary> {
        self.logger.section("Planning");
        let plan = self.plan(mappings).await?;
        let stats = plan.stats();
        if plan.is_empty() {
            self.logger.info("Nothing to copy");
            return Ok(ExecutionSummary::default());
        }
        self.logger.summary_kv(
            "Plan",
            &[
                ("Repositories", stats.repositories.to_string()),
                ("Blobs", stats.blobs.to_string()),
                ("Size", self.logger.format_size(stats.bytes)),
                ("Manifests", stats.manifests.to_string()),
            ],
        );

        let work = greedy(&plan);
        self.logger.section(if self.options.dry_run {
            "Mirroring (dry run)"
        } else {
            "Mirroring"
        });
        let (stop_tx, stop) = watch::channel(false);
        let scheduler = Scheduler::new(self.options.scheduler_options(), self.logger.clone());
        let result = scheduler.execute(Arc::new(plan), &work, stop).await;
        let _ = stop_tx.send(true);
        let summary = result?;

        let elapsed = self.logger.elapsed();
        self.logger.summary_kv(
            "Summary",
            &[
                ("Copied", summary.blobs_copied.to_string()),
                ("Mounted", summary.blobs_mounted.to_string()),
                ("Already present", summary.blobs_skipped.to_string()),
                ("Manifests", summary.manifests.to_string()),
                ("Transferred", self.logger.format_size(summary.bytes)),
                ("Throughput", self.logger.format_throughput(summary.bytes, elapsed)),
                ("Elapsed", self.logger.format_duration(elapsed)),
            ],
        );
        Ok(summary)
    }
}
