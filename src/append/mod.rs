//! Append layers to an image
//!
//! Builds a new image from a base image (or from scratch) plus gzipped tar
//! layers read from files or a stream, and pushes it to a destination
//! repository. Base layers are copied or mounted into the destination in
//! parallel; diff IDs missing from the base config are computed while the
//! layers stream through.

use crate::concurrency::WorkQueue;
use crate::error::{RegistryError, Result};
use crate::image::config::{ContainerConfig, History, ImageConfig};
use crate::image::digest::{Digest, GZIPPED_EMPTY_LAYER, GZIPPED_EMPTY_LAYER_DIGEST};
use crate::image::manifest::{Descriptor, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER, Manifest, Schema2Manifest};
use crate::image::reference::ImageReference;
use crate::image::resolve::{PlatformFilter, first_manifest, manifest_to_image_config, put_manifest_in_compatible_schema};
use crate::logging::Logger;
use crate::registry::{
    BlobCreation, BlobService, BlobStream, DryRunProvider, MountRequest, Repository, RepositoryProvider,
    stream_from_bytes,
};
use crate::upload::{digest_stream, file_stream};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Base image; `None` starts from scratch
    pub from: Option<ImageReference>,
    pub to: ImageReference,
    pub filter: PlatformFilter,
    pub layer_files: Vec<PathBuf>,
    pub created_at: Option<DateTime<Utc>>,
    pub drop_history: bool,
    /// JSON merged into the container config
    pub config_patch: Option<String>,
    /// JSON merged into the image metadata
    pub meta_patch: Option<String>,
    pub force: bool,
    pub dry_run: bool,
    pub insecure: bool,
    pub max_per_registry: usize,
}

impl AppendOptions {
    pub fn new(to: ImageReference) -> Self {
        Self {
            from: None,
            to,
            filter: PlatformFilter::Default,
            layer_files: Vec::new(),
            created_at: None,
            drop_history: false,
            config_patch: None,
            meta_patch: None,
            force: false,
            dry_run: false,
            insecure: false,
            max_per_registry: 6,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(from) = &self.from {
            if from.tag.is_none() && from.digest.is_none() {
                return Err(RegistryError::Validation(
                    "--from must point to an image ID or image tag".to_string(),
                ));
            }
        }
        if self.to.digest.is_some() {
            return Err(RegistryError::Validation(
                "--to may not point to an image by ID".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `--created-at`: milliseconds since the epoch or an RFC3339 date
pub fn parse_created_at(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = value.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| RegistryError::Validation(format!("--created-at {} is out of range", value)));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            RegistryError::Validation(
                "--created-at must be milliseconds since the epoch or an RFC3339 formatted date".to_string(),
            )
        })
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Overwrite the top-level fields of `value` with those of the JSON object
/// `patch`
fn apply_patch<T: Serialize + DeserializeOwned>(value: &T, patch: &str, flag: &str) -> Result<T> {
    let invalid = |e: String| RegistryError::Validation(format!("unable to patch image from {}: {}", flag, e));
    let mut current = serde_json::to_value(value)?;
    let patch: Value = serde_json::from_str(patch).map_err(|e| invalid(e.to_string()))?;
    let (Value::Object(target), Value::Object(fields)) = (&mut current, patch) else {
        return Err(invalid("expected a JSON object".to_string()));
    };
    target.extend(fields);
    serde_json::from_value(current).map_err(|e| invalid(e.to_string()))
}

async fn drain(mut stream: BlobStream) -> Result<u64> {
    let mut total = 0;
    while let Some(chunk) = stream.next().await {
        total += chunk?.len() as u64;
    }
    Ok(total)
}

/// Outcome of copying one base layer
struct CopiedLayer {
    index: usize,
    size: u64,
    diff_id: Option<Digest>,
}

pub struct Appender {
    sources: Arc<dyn RepositoryProvider>,
    destinations: Arc<dyn RepositoryProvider>,
    logger: Logger,
}

impl Appender {
    /// `destinations` must grant push access
    pub fn new(
        sources: Arc<dyn RepositoryProvider>,
        destinations: Arc<dyn RepositoryProvider>,
        logger: Logger,
    ) -> Self {
        Self {
            sources,
            destinations,
            logger,
        }
    }

    /// Build and push the image, returning the pushed manifest digest.
    /// `stream` is appended after the layer files.
    pub async fn append(&self, options: &AppendOptions, stream: Option<BlobStream>) -> Result<Digest> {
        options.validate()?;
        let to = &options.to;
        let destinations: Arc<dyn RepositoryProvider> = if options.dry_run {
            Arc::new(DryRunProvider::new(self.destinations.clone()))
        } else {
            self.destinations.clone()
        };
        let to_repo = destinations
            .repository(&to.registry, &to.repository, options.insecure)
            .await?;
        let to_blobs = to_repo.blobs();

        let (from_repo, mut config, mut layers) = match &options.from {
            Some(from) => {
                let repo = self
                    .sources
                    .repository(&from.registry, &from.repository, options.insecure)
                    .await?;
                let (manifest, location) = first_manifest(from, repo.as_ref(), &options.filter)
                    .await
                    .map_err(|e| RegistryError::Validation(format!("unable to read image {}: {}", from, e)))?;
                let (config, layers) = manifest_to_image_config(&manifest, repo.blobs().as_ref())
                    .await
                    .map_err(|e| RegistryError::Validation(format!("unable to parse image {}: {}", from, e)))?;
                tracing::debug!(base = %location.manifest, layers = layers.len(), "loaded base image");
                (Some(repo), config, layers)
            }
            None => (None, ImageConfig::scratch("linux", "amd64"), Vec::new()),
        };

        self.prepare_config(&mut config, options)?;

        let base_layers = layers.len();
        for path in &options.layer_files {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| RegistryError::Io(format!("unable to open layer {}: {}", path.display(), e)))?;
            self.append_layer(file_stream(file), &mut layers, &mut config, to_blobs.as_ref())
                .await?;
        }
        if let Some(stream) = stream {
            self.append_layer(stream, &mut layers, &mut config, to_blobs.as_ref())
                .await?;
        }
        if layers.is_empty() {
            self.append_layer(
                stream_from_bytes(Bytes::from_static(GZIPPED_EMPTY_LAYER)),
                &mut layers,
                &mut config,
                to_blobs.as_ref(),
            )
            .await?;
        }

        // schema1 needs one history entry per layer
        while config.history.len() < layers.len() {
            config.history.push(History {
                created: config.created.clone(),
                ..Default::default()
            });
        }

        if let Some(from_repo) = &from_repo {
            if options.dry_run {
                self.logger
                    .detail(&format!("Would copy {} base layers", base_layers));
            } else {
                let mount_from = options
                    .from
                    .as_ref()
                    .filter(|from| from.registry == to.registry)
                    .map(|from| from.repository.clone());
                self.copy_base_layers(
                    from_repo.clone(),
                    to_repo.clone(),
                    &mut layers[..base_layers],
                    &mut config,
                    mount_from,
                    options,
                )
                .await?;
            }
        }

        let config_json = Bytes::from(serde_json::to_vec(&config)?);
        let config_descriptor = to_blobs.put(MEDIA_TYPE_IMAGE_CONFIG, config_json.clone()).await?;
        let manifest = Manifest::from_schema2(Schema2Manifest::new(config_descriptor, layers))?;
        let schema_blobs = match &from_repo {
            Some(repo) => repo.blobs(),
            None => to_blobs.clone(),
        };
        let digest = put_manifest_in_compatible_schema(
            &manifest,
            to.tag.as_deref().unwrap_or_default(),
            to_repo.as_ref(),
            schema_blobs.as_ref(),
            Some(config_json),
        )
        .await
        .map_err(|e| {
            RegistryError::Validation(format!("unable to convert the image to a compatible schema version: {}", e))
        })?;

        if options.dry_run {
            self.logger.info(&format!("Would push {} to {}", digest, to));
        } else {
            self.logger.result(&format!("Pushed {} to {}", digest, to));
        }
        Ok(digest)
    }

    fn prepare_config(&self, config: &mut ImageConfig, options: &AppendOptions) -> Result<()> {
        config.extra.remove("parent");
        let container = config.config.get_or_insert_with(ContainerConfig::default);
        let created = options.created_at.unwrap_or_else(Utc::now);
        config.created = Some(timestamp(&created));

        if options.drop_history {
            for key in ["container_config", "container", "docker_version"] {
                config.extra.remove(key);
            }
            container.extra.remove("Image");
            config.history.clear();
        }
        if let Some(patch) = &options.config_patch {
            let patched = apply_patch(&*container, patch, "--image")?;
            *container = patched;
        }
        if let Some(patch) = &options.meta_patch {
            *config = apply_patch(&*config, patch, "--meta")?;
        }
        Ok(())
    }

    /// Upload one gzipped tar layer and record it in `config`
    async fn append_layer(
        &self,
        stream: BlobStream,
        layers: &mut Vec<Descriptor>,
        config: &mut ImageConfig,
        blobs: &dyn BlobService,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        let mut writer = match blobs.create(None).await? {
            BlobCreation::Upload(writer) => writer,
            BlobCreation::Mounted(_) => {
                return Err(RegistryError::Validation(
                    "registry mounted a blob that was not requested".to_string(),
                ));
            }
        };
        let (tee, pending) = digest_stream(stream);
        if let Err(err) = writer.write(tee).await {
            let _ = writer.cancel().await;
            return Err(err);
        }
        let result = pending.finish().await?;
        let descriptor = Descriptor::new(MEDIA_TYPE_LAYER, result.blob_digest.clone(), result.size);
        writer.commit(&descriptor).await?;

        let speed = result.size as f64 / started.elapsed().as_secs_f64().max(0.001);
        self.logger.detail(&format!(
            "Uploaded {} ({}, {})",
            descriptor.digest.short(),
            self.logger.format_size(descriptor.size),
            self.logger.format_speed(speed as u64)
        ));
        config.add_layer(&descriptor, Some(&result.layer_digest));
        if let Some(mod_time) = result.mod_time {
            config.created = Some(timestamp(&mod_time));
        }
        layers.push(descriptor);
        Ok(())
    }

    async fn copy_base_layers(
        &self,
        from: Arc<dyn Repository>,
        to: Arc<dyn Repository>,
        layers: &mut [Descriptor],
        config: &mut ImageConfig,
        mount_from: Option<String>,
        options: &AppendOptions,
    ) -> Result<()> {
        let diff_ids = config.diff_ids().to_vec();
        let results = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop) = watch::channel(false);
        let queue = WorkQueue::new(options.max_per_registry, stop);

        let outcome = queue
            .try_batch(|w| {
                for (index, layer) in layers.iter().enumerate() {
                    let need_diff_id = diff_ids.get(index).is_none_or(|d| d.is_empty());
                    let from = from.clone();
                    let to = to.clone();
                    let layer = layer.clone();
                    let mount_from = mount_from.clone();
                    let results = results.clone();
                    let logger = self.logger.clone();
                    let force = options.force;
                    w.try_work(async move {
                        let copied = copy_base_layer(from, to, layer, index, need_diff_id, mount_from, force, logger).await?;
                        if let Ok(mut results) = results.lock() {
                            results.push(copied);
                        }
                        Ok(())
                    });
                }
            })
            .await;
        let _ = stop_tx.send(true);
        outcome?;

        let copied = std::mem::take(
            &mut *results
                .lock()
                .map_err(|_| RegistryError::Io("layer result lock poisoned".to_string()))?,
        );
        let rootfs = config.rootfs.get_or_insert_with(Default::default);
        for CopiedLayer { index, size, diff_id } in copied {
            if layers[index].size == 0 {
                layers[index].size = size;
            }
            if let Some(diff_id) = diff_id {
                if rootfs.diff_ids.len() <= index {
                    rootfs.diff_ids.resize(index + 1, String::new());
                }
                rootfs.diff_ids[index] = diff_id.to_string();
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_base_layer(
    from: Arc<dyn Repository>,
    to: Arc<dyn Repository>,
    layer: Descriptor,
    index: usize,
    need_diff_id: bool,
    mount_from: Option<String>,
    force: bool,
    logger: Logger,
) -> Result<CopiedLayer> {
    let from_blobs = from.blobs();
    let to_blobs = to.blobs();

    if !force {
        if let Ok(existing) = to_blobs.stat(&layer.digest).await {
            tracing::debug!(digest = %layer.digest, "layer already exists in destination");
            let mut diff_id = None;
            if need_diff_id {
                let source = from_blobs.open(&layer.digest).await.map_err(|e| {
                    RegistryError::Validation(format!(
                        "unable to access the layer {} in order to calculate its content ID: {}",
                        layer.digest, e
                    ))
                })?;
                let (tee, pending) = digest_stream(source);
                drain(tee).await?;
                diff_id = Some(pending.finish().await?.layer_digest);
            }
            // Registries report the empty layer as present even when a
            // manifest referencing it would be rejected
            if layer.digest.as_str() != GZIPPED_EMPTY_LAYER_DIGEST {
                return Ok(CopiedLayer {
                    index,
                    size: existing.size,
                    diff_id,
                });
            }
        }
    }

    let mount = mount_from
        .filter(|_| !need_diff_id)
        .map(|from| MountRequest {
            from,
            descriptor: layer.clone(),
        });
    let mut writer = match to_blobs.create(mount).await? {
        BlobCreation::Mounted(descriptor) => {
            logger.detail(&format!("Mounted {}", layer.digest.short()));
            return Ok(CopiedLayer {
                index,
                size: descriptor.size,
                diff_id: None,
            });
        }
        BlobCreation::Upload(writer) => writer,
    };

    if layer.size > 0 {
        logger.step(&format!("Uploading {} ...", logger.format_size(layer.size)));
    } else {
        logger.step("Uploading ...");
    }
    let source = from_blobs.open(&layer.digest).await?;
    let (source, pending) = if need_diff_id {
        let (tee, pending) = digest_stream(source);
        (tee, Some(pending))
    } else {
        (source, None)
    };
    let written = match writer.write(source).await {
        Ok(written) => written,
        Err(err) => {
            let _ = writer.cancel().await;
            return Err(RegistryError::Validation(format!(
                "uploading the source layer {} failed: {}",
                layer.digest, err
            )));
        }
    };
    let diff_id = match pending {
        Some(pending) => {
            let result = pending.finish().await?;
            layer.digest.verify(&result.blob_digest)?;
            Some(result.layer_digest)
        }
        None => None,
    };
    let committed = writer.commit(&layer).await?;
    if committed.digest != layer.digest {
        return Err(RegistryError::DigestMismatch {
            expected: layer.digest.to_string(),
            actual: committed.digest.to_string(),
        });
    }
    Ok(CopiedLayer {
        index,
        size: if committed.size > 0 { committed.size } else { written },
        diff_id,
    })
}
