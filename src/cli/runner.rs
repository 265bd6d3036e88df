//! Runs a parsed command line against real registries

use crate::append::{AppendOptions, Appender, parse_created_at};
use crate::cli::args::{AppendArgs, Args, Command, ExtractArgs, InfoArgs, MirrorArgs};
use crate::cli::config::SyncConfig;
use crate::error::{RegistryError, Result};
use crate::extract::{Alteration, Alterations, ExtractMapping, ExtractOptions, ExtractTarget, Extractor};
use crate::image::manifest::Manifest;
use crate::image::reference::{ImageReference, parse_pull_spec};
use crate::image::resolve::{PlatformFilter, first_manifest, manifest_to_image_config, resolve_digest};
use crate::logging::Logger;
use crate::mirror::{MappingParser, Mirror, MirrorOptions};
use crate::registry::auth::{CredentialStore, DockerConfigCredentials};
use crate::registry::{Context, ContextOptions, RepositoryProvider};
use crate::upload::reader_stream;
use std::sync::Arc;

pub struct Runner {
    args: Args,
    config: SyncConfig,
    output: Logger,
}

impl Runner {
    /// Settings from `IMAGE_MIRROR_*` are overridden by explicit flags
    pub fn new(args: Args) -> Result<Self> {
        args.validate()?;
        let config = SyncConfig::from_env().merge(&args.sync_config());
        config.validate()?;

        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(config.verbose)
        };

        Ok(Self { args, config, output })
    }

    pub async fn run(&self) -> Result<()> {
        let context = self.create_context()?;
        let sources: Arc<dyn RepositoryProvider> = Arc::new(context.clone());
        let destinations: Arc<dyn RepositoryProvider> = Arc::new(context.with_actions(&["pull", "push"]));

        match &self.args.command {
            Command::Mirror(args) => self.mirror(args, sources, destinations).await,
            Command::Extract(args) => self.extract(args, sources).await,
            Command::Append(args) => self.append(args, sources, destinations).await,
            Command::Info(args) => self.info(args, sources).await,
        }
    }

    fn create_context(&self) -> Result<Context> {
        let credentials: Arc<dyn CredentialStore> = match (self.args.auth(), &self.args.registry_config) {
            (Some(auth), _) => {
                self.output.detail("Using provided credentials");
                Arc::new(auth.credentials())
            }
            (None, Some(path)) => Arc::new(DockerConfigCredentials::load(path)?),
            (None, None) => Arc::new(DockerConfigCredentials::load_default()?),
        };
        let options = ContextOptions {
            skip_tls_verify: self.config.insecure,
            ..Default::default()
        };
        Ok(Context::new(options)?
            .with_credentials(credentials)
            .with_retry(self.config.retries, self.config.retry_window()))
    }

    fn platform_filter(&self) -> Result<PlatformFilter> {
        PlatformFilter::from_pattern(self.config.filter_by_os.as_deref())
    }

    async fn mirror(
        &self,
        args: &MirrorArgs,
        sources: Arc<dyn RepositoryProvider>,
        destinations: Arc<dyn RepositoryProvider>,
    ) -> Result<()> {
        let mut parser = MappingParser::new();
        for path in &args.filenames {
            parser.parse_file(path)?;
        }
        parser.parse_args(&args.mappings)?;
        let mappings = parser.finish()?;

        // Mirroring keeps every platform unless asked otherwise
        let filter = match self.config.filter_by_os.as_deref() {
            None => PlatformFilter::All,
            pattern => PlatformFilter::from_pattern(pattern)?,
        };
        let options = MirrorOptions {
            filter,
            keep_manifest_list: args.keep_manifest_list,
            force: self.config.force,
            skip_mount: self.config.skip_mount,
            skip_missing: self.config.skip_missing,
            insecure: self.config.insecure,
            dry_run: self.config.dry_run,
            max_registry: self.config.max_registry,
            max_per_registry: self.config.max_per_registry,
        };
        Mirror::new(sources, destinations, None, options, self.output.clone())
            .run(&mappings)
            .await?;
        Ok(())
    }

    async fn extract(&self, args: &ExtractArgs, sources: Arc<dyn RepositoryProvider>) -> Result<()> {
        let (image, layers) = parse_pull_spec(&args.image)?;

        let mut alterations = Alterations::default();
        if let Some(path) = &args.path {
            let rebase = Alteration::rebase(path).ok_or_else(|| {
                RegistryError::Validation(format!("--path must be FROM:TO, got {}", path))
            })?;
            alterations.push(rebase);
        }
        if args.only_files {
            alterations.push(Alteration::FilesOnly);
        }
        if args.strip_permissions {
            alterations.push(Alteration::StripPermissions);
        }
        if args.strip_ownership {
            alterations.push(Alteration::StripOwnership);
        }

        let target = match &args.archive {
            Some(path) => ExtractTarget::Archive {
                path: path.clone(),
                checksum: args.checksum,
            },
            None => ExtractTarget::Directory {
                path: args.to.clone(),
                allow_existing: args.allow_existing,
            },
        };
        let options = ExtractOptions {
            filter: self.platform_filter()?,
            all_layers: args.all_layers,
            insecure: self.config.insecure,
        };

        self.output.section(&format!("Extracting {}", image));
        Extractor::new(sources, self.output.clone())
            .extract(
                ExtractMapping {
                    image,
                    layers,
                    alterations,
                    target,
                },
                &options,
            )
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        args: &AppendArgs,
        sources: Arc<dyn RepositoryProvider>,
        destinations: Arc<dyn RepositoryProvider>,
    ) -> Result<()> {
        let mut options = AppendOptions::new(ImageReference::parse(&args.to)?);
        options.from = args.from.as_deref().map(ImageReference::parse).transpose()?;
        options.filter = self.platform_filter()?;
        options.layer_files = args.layers.clone();
        options.created_at = args.created_at.as_deref().map(parse_created_at).transpose()?;
        options.drop_history = args.drop_history;
        options.config_patch = args.config_patch.clone();
        options.meta_patch = args.meta_patch.clone();
        options.force = self.config.force;
        options.dry_run = self.config.dry_run;
        options.insecure = self.config.insecure;
        options.max_per_registry = self.config.max_per_registry;

        let stream = args.stdin.then(|| reader_stream(tokio::io::stdin()));

        self.output.section(&format!("Appending to {}", options.to));
        Appender::new(sources, destinations, self.output.clone())
            .append(&options, stream)
            .await?;
        Ok(())
    }

    async fn info(&self, args: &InfoArgs, sources: Arc<dyn RepositoryProvider>) -> Result<()> {
        let filter = self.platform_filter()?;
        for spec in &args.images {
            let image = ImageReference::parse(spec)?;
            let repo = sources
                .repository(&image.registry, &image.repository, self.config.insecure)
                .await?;
            let digest = resolve_digest(&image, repo.as_ref()).await?;
            let top = repo.manifests().get(&digest).await?;

            if let Manifest::List(list) = &top {
                let platforms: Vec<String> = list.value.manifests.iter().map(|c| c.platform.display_name()).collect();
                let children: Vec<(&str, String)> = platforms
                    .iter()
                    .zip(&list.value.manifests)
                    .map(|(platform, child)| (platform.as_str(), child.descriptor.digest.to_string()))
                    .collect();
                self.output
                    .summary_kv(&format!("{} (manifest list {})", image, digest.short()), &children);
            }

            let (manifest, location) = first_manifest(&image, repo.as_ref(), &filter).await?;
            let (config, layers) = manifest_to_image_config(&manifest, repo.blobs().as_ref()).await?;
            let mut items = vec![
                ("Name", image.to_string()),
                ("Digest", location.manifest.to_string()),
                ("Media Type", manifest.media_type().to_string()),
                ("OS", format!("{}/{}", config.os, config.architecture)),
                ("Created", config.created.clone().unwrap_or_default()),
                ("Layers", layers.len().to_string()),
                ("Size", self.output.format_size(config.size)),
            ];
            if let Some(list) = &location.manifest_list {
                items.insert(2, ("Manifest List", list.to_string()));
            }
            self.output.summary_kv(&image.to_string(), &items);
            for layer in &layers {
                self.output
                    .detail(&format!("{} {}", layer.digest, self.output.format_size(layer.size)));
            }
            self.output.result(&format!("{} {}", location.manifest, image));
        }
        Ok(())
    }
}
