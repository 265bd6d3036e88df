//! Blob and manifest copy primitives used by the scheduler

use crate::error::Result;
use crate::image::resolve::put_manifest_in_compatible_schema;
use crate::logging::Logger;
use crate::mirror::plan::{BlobCopyOperation, ManifestCopyOperation, RegistryPlan};
use crate::registry::{BlobCreation, BlobWriter, MountRequest, Repository};

/// Blobs below this size are fetched whole and pushed in one request
pub const SMALL_BLOB_THRESHOLD: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOutcome {
    /// Already present at the destination
    Skipped,
    Mounted,
    /// Uploaded, with the number of bytes sent
    Copied(u64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub force: bool,
    pub skip_mount: bool,
}

/// Copy one blob into `to`, which is repository `repository` of `registry`.
///
/// Unless forced the destination is checked first. A mount is requested
/// from another repository of the same registry known to hold the blob.
/// Every blob confirmed present is recorded so later copies can mount it.
pub async fn copy_blob(
    op: &BlobCopyOperation,
    to: &dyn Repository,
    registry: &RegistryPlan,
    repository: &str,
    options: CopyOptions,
) -> Result<BlobOutcome> {
    let descriptor = &op.descriptor;
    let blobs = to.blobs();

    if !options.force {
        match blobs.stat(&descriptor.digest).await {
            Ok(_) => {
                tracing::trace!(digest = %descriptor.digest, %repository, "blob already present");
                registry.associate(&descriptor.digest, repository);
                return Ok(BlobOutcome::Skipped);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    let mut writer: Option<Box<dyn BlobWriter>> = None;
    if !options.skip_mount {
        if let Some(from) = registry.mount_source(&descriptor.digest, repository) {
            let request = MountRequest {
                from: from.clone(),
                descriptor: descriptor.clone(),
            };
            match blobs.create(Some(request)).await? {
                BlobCreation::Mounted(_) => {
                    tracing::debug!(digest = %descriptor.digest, %from, to = %repository, "mounted blob");
                    registry.associate(&descriptor.digest, repository);
                    return Ok(BlobOutcome::Mounted);
                }
                BlobCreation::Upload(upload) => writer = Some(upload),
            }
        }
    }

    let source = op.from.blobs();
    let small = descriptor.size > 0 && descriptor.size < SMALL_BLOB_THRESHOLD;
    let written = match writer {
        None if small => {
            let content = source.get(&descriptor.digest).await?;
            let size = content.len() as u64;
            let pushed = blobs.put(&descriptor.media_type, content).await?;
            descriptor.digest.verify(&pushed.digest)?;
            size
        }
        pending => {
            let mut writer = match pending {
                Some(writer) => writer,
                None => match blobs.create(None).await? {
                    BlobCreation::Upload(writer) => writer,
                    BlobCreation::Mounted(_) => {
                        registry.associate(&descriptor.digest, repository);
                        return Ok(BlobOutcome::Mounted);
                    }
                },
            };
            let written = match source.open(&descriptor.digest).await {
                Ok(stream) => writer.write(stream).await,
                Err(err) => Err(err),
            };
            let written = match written {
                Ok(written) => written,
                Err(err) => {
                    if let Err(cancel) = writer.cancel().await {
                        tracing::debug!(error = %cancel, "failed to cancel upload");
                    }
                    return Err(err);
                }
            };
            if descriptor.size > 0 && written != descriptor.size {
                tracing::warn!(
                    digest = %descriptor.digest,
                    expected = descriptor.size,
                    actual = written,
                    "blob size differs from descriptor"
                );
            }
            writer.commit(descriptor).await?;
            written
        }
    };

    registry.associate(&descriptor.digest, repository);
    Ok(BlobOutcome::Copied(written))
}

/// Push list children by digest, then the manifest under each tag (or by
/// digest when it has none). Returns the pushed references as
/// `<digest> <target_name>[:<tag>]`.
pub async fn push_manifest(
    op: &ManifestCopyOperation,
    to: &dyn Repository,
    target_name: &str,
    logger: &Logger,
) -> Result<Vec<String>> {
    let blobs = op.from_blobs.as_ref();
    for child in &op.children {
        put_manifest_in_compatible_schema(child, "", to, blobs, None).await?;
    }

    let mut pushed = Vec::new();
    if op.tags.is_empty() {
        let digest = put_manifest_in_compatible_schema(&op.manifest, "", to, blobs, None).await?;
        pushed.push(format!("{} {}", digest, target_name));
    } else {
        for tag in &op.tags {
            let digest = put_manifest_in_compatible_schema(&op.manifest, tag, to, blobs, None).await?;
            pushed.push(format!("{} {}:{}", digest, target_name, tag));
        }
    }
    for line in &pushed {
        logger.result(line);
    }
    if op.pre_existing {
        tracing::debug!(digest = %op.digest, destination = %target_name, "retagged existing manifest");
    }
    Ok(pushed)
}
