//! Extract image layers to disk
//!
//! Layers are walked from the newest to the oldest so the first time a path
//! is seen wins and anything a newer layer whited out is skipped. With
//! `all_layers` every layer is written oldest first instead, letting later
//! entries overwrite earlier ones. Output goes to a directory, a gzipped
//! tar archive or a per-entry callback.

pub mod alter;

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::Descriptor;
use crate::image::reference::{ImageReference, LayerFilter};
use crate::image::resolve::{PlatformFilter, first_manifest, manifest_to_image_config};
use crate::logging::Logger;
use crate::registry::{BlobStream, RepositoryProvider};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use futures_util::StreamExt;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub use alter::{Alteration, Alterations};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const PIPE_DEPTH: usize = 16;

/// An entry handed to an [`ExtractTarget::Callback`]
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub layer: Digest,
    /// Path after alterations, relative to the image root
    pub path: PathBuf,
    pub header: tar::Header,
}

pub type EntryCallback = Box<dyn FnMut(&EntryInfo, &mut dyn Read) -> Result<()> + Send>;

pub enum ExtractTarget {
    /// Write into a directory, which must be empty unless `allow_existing`
    Directory { path: PathBuf, allow_existing: bool },
    /// Write a `.tar.gz`, plus `<path>.sha256` when `checksum` is set
    Archive { path: PathBuf, checksum: bool },
    Callback(EntryCallback),
}

pub struct ExtractMapping {
    pub image: ImageReference,
    /// Layers to extract; all when `None`
    pub layers: Option<LayerFilter>,
    pub alterations: Alterations,
    pub target: ExtractTarget,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub filter: PlatformFilter,
    /// Write every selected layer instead of only the visible files
    pub all_layers: bool,
    pub insecure: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            filter: PlatformFilter::Default,
            all_layers: false,
            insecure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub layers: usize,
    pub entries: usize,
    pub bytes: u64,
}

pub struct Extractor {
    sources: Arc<dyn RepositoryProvider>,
    logger: Logger,
}

impl Extractor {
    pub fn new(sources: Arc<dyn RepositoryProvider>, logger: Logger) -> Self {
        Self { sources, logger }
    }

    pub async fn extract(&self, mapping: ExtractMapping, options: &ExtractOptions) -> Result<ExtractSummary> {
        let image = &mapping.image;
        let repo = self
            .sources
            .repository(&image.registry, &image.repository, options.insecure)
            .await?;
        let (manifest, location) = first_manifest(image, repo.as_ref(), &options.filter).await?;
        let blobs = repo.blobs();
        let (_, layers) = manifest_to_image_config(&manifest, blobs.as_ref()).await?;

        let mut selected = match &mapping.layers {
            Some(filter) => filter.select(&layers)?,
            None => (0..layers.len()).collect(),
        };
        if !options.all_layers {
            selected.reverse();
        }
        tracing::debug!(
            image = %image,
            manifest = %location.manifest,
            layers = selected.len(),
            all_layers = options.all_layers,
            "extracting"
        );

        let sink = Sink::open(mapping.target)?;
        let mut walker = Walker {
            sink,
            alterations: mapping.alterations,
            shadow: Shadow::new(!options.all_layers),
            summary: ExtractSummary::default(),
        };

        for index in selected {
            let layer = layers[index].clone();
            self.logger
                .step(&format!("Extracting layer {} ({})", layer.digest.short(), self.logger.format_size(layer.size)));
            let stream = blobs.open(&layer.digest).await?;
            let reader = stream_reader(stream);
            walker = tokio::task::spawn_blocking(move || -> Result<Walker> {
                walker.apply_layer(&layer, reader)?;
                Ok(walker)
            })
            .await??;
            walker.summary.layers += 1;
        }

        let summary = walker.summary.clone();
        tokio::task::spawn_blocking(move || walker.sink.finish()).await??;
        self.logger.success(&format!(
            "Extracted {} entries ({}) from {} layers of {}",
            summary.entries,
            self.logger.format_size(summary.bytes),
            summary.layers,
            image
        ));
        Ok(summary)
    }
}

/// Paths hidden from older layers
struct Shadow {
    enabled: bool,
    seen: HashSet<PathBuf>,
    /// Whited out paths, hidden together with everything below them
    removed: Vec<PathBuf>,
    /// Opaque directories, whose older contents are hidden
    opaque: Vec<PathBuf>,
    pending: Pending,
}

#[derive(Default)]
struct Pending {
    seen: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    opaque: Vec<PathBuf>,
}

impl Shadow {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            seen: HashSet::new(),
            removed: Vec::new(),
            opaque: Vec::new(),
            pending: Pending::default(),
        }
    }

    fn hidden(&self, path: &Path) -> bool {
        self.enabled
            && (self.seen.contains(path)
                || self.removed.iter().any(|p| path.starts_with(p))
                || self.opaque.iter().any(|p| path.starts_with(p) && path != p))
    }

    /// Record a whiteout entry. Returns false for regular paths.
    fn whiteout(&mut self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !name.starts_with(WHITEOUT_PREFIX) {
            return false;
        }
        if self.enabled {
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
            if name == WHITEOUT_OPAQUE {
                self.pending.opaque.push(parent);
            } else {
                self.pending.removed.push(parent.join(&name[WHITEOUT_PREFIX.len()..]));
            }
        }
        true
    }

    fn visit(&mut self, path: PathBuf) {
        if self.enabled {
            self.pending.seen.push(path);
        }
    }

    /// Entries of a layer only shadow the layers below it
    fn end_layer(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.seen.extend(pending.seen);
        self.removed.extend(pending.removed);
        self.opaque.extend(pending.opaque);
    }
}

struct Walker {
    sink: Sink,
    alterations: Alterations,
    shadow: Shadow,
    summary: ExtractSummary,
}

impl Walker {
    fn apply_layer<R: Read>(&mut self, layer: &Descriptor, compressed: R) -> Result<()> {
        let mut reader = HashingReader {
            inner: compressed,
            hasher: Sha256::new(),
        };
        {
            let mut archive = tar::Archive::new(MultiGzDecoder::new(&mut reader));
            let entries = archive
                .entries()
                .map_err(|e| RegistryError::Parse(format!("layer {} is not a tar archive: {}", layer.digest, e)))?;
            for entry in entries {
                let mut entry =
                    entry.map_err(|e| RegistryError::Parse(format!("invalid entry in layer {}: {}", layer.digest, e)))?;
                let raw = entry.path()?.into_owned();
                let Some(path) = alter::relative(&raw) else {
                    tracing::warn!(path = %raw.display(), layer = %layer.digest, "skipping entry outside the image root");
                    continue;
                };
                if path.as_os_str().is_empty() || self.shadow.whiteout(&path) || self.shadow.hidden(&path) {
                    continue;
                }
                self.shadow.visit(path.clone());

                let mut header = entry.header().clone();
                let Some(path) = self.alterations.apply(&mut header, path) else {
                    continue;
                };
                if path.as_os_str().is_empty() {
                    continue;
                }
                let info = EntryInfo {
                    layer: layer.digest.clone(),
                    path,
                    header,
                };
                self.sink.write(&info, &mut entry)?;
                self.summary.entries += 1;
                if info.header.entry_type().is_file() {
                    self.summary.bytes += info.header.size().unwrap_or(0);
                }
            }
        }
        self.shadow.end_layer();

        io::copy(&mut reader, &mut io::sink())?;
        // Schema1 layers have no recorded size, only verify the digest
        layer.digest.verify(&Digest::from_hasher(reader.hasher))
    }
}

enum Sink {
    Directory {
        root: PathBuf,
        /// Applied once everything is written so read-only directories can
        /// still be filled
        modes: Vec<(PathBuf, u32)>,
    },
    Archive {
        path: PathBuf,
        checksum: bool,
        builder: tar::Builder<GzEncoder<HashingWriter<fs::File>>>,
    },
    Callback(EntryCallback),
}

impl Sink {
    fn open(target: ExtractTarget) -> Result<Self> {
        match target {
            ExtractTarget::Directory { path, allow_existing } => {
                if path.exists() {
                    if !allow_existing && fs::read_dir(&path)?.next().is_some() {
                        return Err(RegistryError::DirectoryNotEmpty(path));
                    }
                } else {
                    fs::create_dir_all(&path)?;
                }
                Ok(Sink::Directory {
                    root: path,
                    modes: Vec::new(),
                })
            }
            ExtractTarget::Archive { path, checksum } => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = HashingWriter {
                    inner: fs::File::create(&path)?,
                    hasher: Sha256::new(),
                };
                Ok(Sink::Archive {
                    path,
                    checksum,
                    builder: tar::Builder::new(GzEncoder::new(file, Compression::default())),
                })
            }
            ExtractTarget::Callback(callback) => Ok(Sink::Callback(callback)),
        }
    }

    fn write(&mut self, info: &EntryInfo, content: &mut dyn Read) -> Result<()> {
        match self {
            Sink::Directory { root, modes } => write_to_directory(root, modes, info, content),
            Sink::Archive { builder, .. } => {
                let mut header = info.header.clone();
                if !header.entry_type().is_file() {
                    header.set_size(0);
                }
                builder.append_data(&mut header, &info.path, content)?;
                Ok(())
            }
            Sink::Callback(callback) => callback(info, content),
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            Sink::Directory { root, mut modes } => {
                // Deepest first so parents stay writable until their children are done
                modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
                for (path, mode) in modes {
                    set_mode(&resolve_in_root(&root, &path)?, mode)?;
                }
                Ok(())
            }
            Sink::Archive {
                path,
                checksum,
                builder,
            } => {
                let mut file = builder.into_inner()?.finish()?;
                file.flush()?;
                if checksum {
                    let digest = Digest::from_hasher(file.hasher);
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let mut sum = path.clone().into_os_string();
                    sum.push(".sha256");
                    fs::write(sum, format!("{}  {}\n", digest.hex(), name))?;
                }
                Ok(())
            }
            Sink::Callback(_) => Ok(()),
        }
    }
}

fn write_to_directory(
    root: &Path,
    modes: &mut Vec<(PathBuf, u32)>,
    info: &EntryInfo,
    content: &mut dyn Read,
) -> Result<()> {
    let mode = info.header.mode().unwrap_or(0o644) & 0o7777;
    let kind = info.header.entry_type();

    if kind == tar::EntryType::Directory {
        let target = resolve_in_root(root, &info.path)?;
        fs::create_dir_all(&target)?;
        modes.push((info.path.clone(), mode));
        return Ok(());
    }

    // The final component is replaced, never followed
    let Some(target) = entry_target(root, &info.path)? else {
        return Ok(());
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match kind {
        tar::EntryType::Regular | tar::EntryType::Continuous => {
            remove_existing(&target)?;
            let mut file = fs::File::create(&target)?;
            io::copy(content, &mut file)?;
            set_mode(&target, mode)?;
        }
        tar::EntryType::Symlink => {
            let Some(link) = info.header.link_name()? else {
                return Ok(());
            };
            remove_existing(&target)?;
            symlink(&link, &target)?;
        }
        tar::EntryType::Link => {
            let Some(link) = info.header.link_name()?.and_then(|l| alter::relative(&l)) else {
                return Ok(());
            };
            let Some(source) = entry_target(root, &link)? else {
                return Ok(());
            };
            remove_existing(&target)?;
            if let Err(e) = fs::hard_link(&source, &target) {
                tracing::warn!(path = %info.path.display(), link = %link.display(), error = %e, "skipping hard link");
            }
        }
        other => {
            tracing::debug!(path = %info.path.display(), kind = ?other, "skipping special file");
        }
    }
    Ok(())
}

/// Symlink hops allowed while resolving one path
const MAX_LINK_HOPS: usize = 40;

/// Resolve `path` below `root`, following symlinks already written as if
/// `root` were the filesystem root. The result never leaves `root`.
fn resolve_in_root(root: &Path, path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, path);
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("too many levels of symbolic links: {}", path.display()),
                    ));
                }
                let link = fs::read_link(&full)?;
                if link.is_absolute() {
                    resolved = PathBuf::new();
                }
                push_components(&mut pending, &link);
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved))
}

/// Push the components of `path` so that popping yields them in order
fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    let parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect();
    pending.extend(parts.into_iter().rev());
}

/// Location for an entry at `path`: the parent resolved inside `root`, the
/// file name kept as is
fn entry_target(root: &Path, path: &Path) -> io::Result<Option<PathBuf>> {
    let Some(name) = path.file_name() else {
        return Ok(None);
    };
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(Some(resolve_in_root(root, parent)?.join(name)))
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    tracing::debug!(path = %target.display(), link = %link.display(), "symlinks unsupported, skipping");
    Ok(())
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Blocking reader fed from `stream` by a background task
struct StreamReader {
    chunks: tokio::sync::mpsc::Receiver<Result<Bytes>>,
    current: Bytes,
}

fn stream_reader(mut stream: BlobStream) -> StreamReader {
    let (tx, rx) = tokio::sync::mpsc::channel(PIPE_DEPTH);
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    StreamReader {
        chunks: rx,
        current: Bytes::new(),
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.chunks.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(io::Error::other(e.to_string())),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::ImageConfig;
    use crate::registry::MemoryRegistries;
    use std::sync::Mutex;

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        HardLink(&'a str, &'a str),
    }

    fn layer(items: &[Item]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for item in items {
            let mut header = tar::Header::new_gnu();
            match item {
                Item::File(path, content) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, path, *content).unwrap();
                }
                Item::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
                Item::Symlink(path, target) | Item::HardLink(path, target) => {
                    let kind = match item {
                        Item::Symlink(..) => tar::EntryType::Symlink,
                        _ => tar::EntryType::Link,
                    };
                    header.set_entry_type(kind);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_link_name(target).unwrap();
                    header.set_cksum();
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// `registry.local/app:1` with a base layer and an upper layer that
    /// overwrites, deletes and hides files from it
    fn image() -> MemoryRegistries {
        let registries = MemoryRegistries::new();
        let base = layer(&[
            Item::Dir("etc"),
            Item::File("etc/motd", b"base"),
            Item::File("etc/removed", b"gone"),
            Item::Dir("var/cache"),
            Item::File("var/cache/old", b"stale"),
        ]);
        let upper = layer(&[
            Item::File("etc/motd", b"upper"),
            Item::File("etc/.wh.removed", b""),
            Item::File("var/cache/.wh..wh..opq", b""),
            Item::File("var/cache/new", b"fresh"),
        ]);
        registries
            .registry("registry.local")
            .put_image("app", "1", &ImageConfig::scratch("linux", "amd64"), &[base, upper])
            .unwrap();
        registries
    }

    fn mapping(target: ExtractTarget) -> ExtractMapping {
        ExtractMapping {
            image: ImageReference::parse("registry.local/app:1").unwrap(),
            layers: None,
            alterations: Alterations::default(),
            target,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_layers_shadow_and_white_out_older_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rootfs");
        let extractor = Extractor::new(Arc::new(image()), Logger::new_quiet());
        extractor
            .extract(
                mapping(ExtractTarget::Directory {
                    path: root.clone(),
                    allow_existing: false,
                }),
                &ExtractOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(fs::read(root.join("etc/motd")).unwrap(), b"upper");
        assert!(!root.join("etc/removed").exists());
        assert!(!root.join("etc/.wh.removed").exists());
        assert!(!root.join("var/cache/old").exists());
        assert_eq!(fs::read(root.join("var/cache/new")).unwrap(), b"fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn all_layers_writes_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(Arc::new(image()), Logger::new_quiet());
        let options = ExtractOptions {
            all_layers: true,
            ..Default::default()
        };
        extractor
            .extract(
                mapping(ExtractTarget::Directory {
                    path: dir.path().to_path_buf(),
                    allow_existing: false,
                }),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(fs::read(dir.path().join("etc/motd")).unwrap(), b"upper");
        assert!(dir.path().join("etc/removed").exists());
        assert!(dir.path().join("var/cache/old").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("existing"), b"x").unwrap();
        let extractor = Extractor::new(Arc::new(image()), Logger::new_quiet());
        let err = extractor
            .extract(
                mapping(ExtractTarget::Directory {
                    path: dir.path().to_path_buf(),
                    allow_existing: false,
                }),
                &ExtractOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DirectoryNotEmpty(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callback_sees_altered_paths_of_selected_layers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EntryCallback = Box::new(move |info, content| {
            if !info.header.entry_type().is_file() {
                return Ok(());
            }
            let mut body = String::new();
            content.read_to_string(&mut body)?;
            sink.lock().unwrap().push((info.path.clone(), body));
            Ok(())
        });

        let mut mapping = mapping(ExtractTarget::Callback(callback));
        mapping.layers = Some(LayerFilter::parse("0").unwrap());
        mapping.alterations.push(Alteration::rebase("etc:config").unwrap());
        mapping.alterations.push(Alteration::FilesOnly);

        let extractor = Extractor::new(Arc::new(image()), Logger::new_quiet());
        let summary = extractor.extract(mapping, &ExtractOptions::default()).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(summary.layers, 1);
        assert_eq!(
            seen,
            vec![
                (PathBuf::from("config/motd"), "base".to_string()),
                (PathBuf::from("config/removed"), "gone".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn archive_has_visible_files_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/rootfs.tar.gz");
        let extractor = Extractor::new(Arc::new(image()), Logger::new_quiet());
        extractor
            .extract(
                mapping(ExtractTarget::Archive {
                    path: path.clone(),
                    checksum: true,
                }),
                &ExtractOptions::default(),
            )
            .await
            .unwrap();

        let archived = fs::read(&path).unwrap();
        let sum = fs::read_to_string(dir.path().join("out/rootfs.tar.gz.sha256")).unwrap();
        assert_eq!(sum, format!("{}  rootfs.tar.gz\n", Digest::from_bytes(&archived).hex()));

        let mut archive = tar::Archive::new(MultiGzDecoder::new(archived.as_slice()));
        let mut paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        paths.sort();
        assert!(paths.contains(&"etc/motd".to_string()));
        assert!(paths.contains(&"var/cache/new".to_string()));
        assert!(!paths.iter().any(|p| p.contains("removed") || p.contains(".wh.") || p.ends_with("old")));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn symlinks_never_lead_outside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret"), b"keep").unwrap();
        let root = dir.path().join("rootfs");

        let escape = outside.to_string_lossy().into_owned();
        let hostile = layer(&[
            Item::Symlink("escape", &escape),
            Item::File("escape/pwned", b"x"),
            Item::Symlink("up", "../../.."),
            Item::File("up/evil", b"y"),
            Item::HardLink("shadow", "escape/secret"),
        ]);
        let registries = MemoryRegistries::new();
        registries
            .registry("registry.local")
            .put_image("app", "1", &ImageConfig::scratch("linux", "amd64"), &[hostile])
            .unwrap();

        Extractor::new(Arc::new(registries), Logger::new_quiet())
            .extract(
                mapping(ExtractTarget::Directory {
                    path: root.clone(),
                    allow_existing: false,
                }),
                &ExtractOptions::default(),
            )
            .await
            .unwrap();

        assert!(!outside.join("pwned").exists());
        assert!(!dir.path().join("evil").exists());
        assert_eq!(fs::read(outside.join("secret")).unwrap(), b"keep");
        let inside = root.join(outside.strip_prefix("/").unwrap());
        assert_eq!(fs::read(inside.join("pwned")).unwrap(), b"x");
        assert_eq!(fs::read(root.join("evil")).unwrap(), b"y");
        assert!(fs::symlink_metadata(root.join("escape")).unwrap().file_type().is_symlink());
        assert!(fs::symlink_metadata(root.join("shadow")).is_err());
    }

    #[test]
    fn resolution_is_clamped_to_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert_eq!(resolve_in_root(root, Path::new("../../etc")).unwrap(), root.join("etc"));
        assert_eq!(resolve_in_root(root, Path::new("a/./b/../c")).unwrap(), root.join("a/c"));
    }
}
