//! Command-line argument parsing

use crate::cli::config::{AuthConfig, SyncConfig};
use crate::error::{RegistryError, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "docker-image-mirror")]
#[command(about = "Mirror, extract and append to Docker images without a daemon")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Registry username
    #[arg(long = "username", short = 'u', global = true, help = "Username for registry authentication")]
    pub username: Option<String>,

    /// Registry password
    #[arg(long = "password", short = 'p', global = true, help = "Password for registry authentication")]
    pub password: Option<String>,

    /// Docker config file with stored credentials
    #[arg(long = "registry-config", short = 'a', global = true, help = "Path to a Docker config.json with registry credentials")]
    pub registry_config: Option<PathBuf>,

    /// Allow plain HTTP and invalid certificates
    #[arg(long = "insecure", global = true, help = "Allow push and pull operations to registries over HTTP")]
    pub insecure: bool,

    /// Retries for temporary failures
    #[arg(long = "retries", global = true, help = "Number of retries for temporary registry failures")]
    pub retries: Option<u32>,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Only print results
    #[arg(long = "quiet", short = 'q', global = true, help = "Only print results")]
    pub quiet: bool,

    /// Debug diagnostics
    #[arg(long = "debug", global = true, help = "Print debug diagnostics for this tool")]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy images from one repository to another
    Mirror(MirrorArgs),
    /// Extract the contents of an image to disk
    Extract(ExtractArgs),
    /// Add layers to an image and push it to a registry
    Append(AppendArgs),
    /// Display information about images
    Info(InfoArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct MirrorArgs {
    /// `SRC=DST` pairs, or one `SRC DST [DST...]` group
    pub mappings: Vec<String>,

    #[arg(long = "filename", short = 'f', help = "File with one mapping per line")]
    pub filenames: Vec<PathBuf>,

    #[arg(long = "filter-by-os", help = "Regular expression selecting os/arch[/variant] from manifest lists")]
    pub filter_by_os: Option<String>,

    #[arg(long = "keep-manifest-list", help = "Push a manifest list even when one image survives filtering")]
    pub keep_manifest_list: bool,

    #[arg(long = "force", help = "Copy blobs and manifests even if they already exist")]
    pub force: bool,

    #[arg(long = "skip-mount", help = "Always upload blobs instead of mounting them")]
    pub skip_mount: bool,

    #[arg(long = "skip-missing", help = "Warn instead of failing on missing source images")]
    pub skip_missing: bool,

    #[arg(long = "dry-run", help = "Plan and report without writing to any registry")]
    pub dry_run: bool,

    #[arg(long = "max-registry", help = "Registries worked on in parallel")]
    pub max_registry: Option<usize>,

    #[arg(long = "max-per-registry", help = "Parallel operations within one registry")]
    pub max_per_registry: Option<usize>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ExtractArgs {
    /// Image to extract, with an optional `[selector]` suffix
    pub image: String,

    #[arg(long = "to", default_value = ".", conflicts_with = "archive", help = "Directory to extract into")]
    pub to: PathBuf,

    #[arg(long = "archive", help = "Write a .tar.gz archive instead of a directory")]
    pub archive: Option<PathBuf>,

    #[arg(long = "checksum", requires = "archive", help = "Write <archive>.sha256 next to the archive")]
    pub checksum: bool,

    #[arg(long = "confirm", help = "Extract into a directory that is not empty")]
    pub allow_existing: bool,

    #[arg(long = "all-layers", help = "Write every layer instead of only visible files")]
    pub all_layers: bool,

    #[arg(long = "path", help = "Only extract FROM and place it at TO, as FROM:TO")]
    pub path: Option<String>,

    #[arg(long = "only-files", help = "Only extract regular files and directories")]
    pub only_files: bool,

    #[arg(long = "strip-permissions", help = "Reset file modes to 0640 and directories to 0755")]
    pub strip_permissions: bool,

    #[arg(long = "strip-ownership", help = "Reset owners to root")]
    pub strip_ownership: bool,

    #[arg(long = "filter-by-os", help = "Regular expression selecting the image from a manifest list")]
    pub filter_by_os: Option<String>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct AppendArgs {
    /// Gzipped tar files to add as layers
    pub layers: Vec<PathBuf>,

    #[arg(long = "from", help = "Base image; empty starts from scratch")]
    pub from: Option<String>,

    #[arg(long = "to", help = "Image to push")]
    pub to: String,

    #[arg(long = "stdin", help = "Read an additional gzipped tar layer from standard input")]
    pub stdin: bool,

    #[arg(long = "created-at", help = "Image creation time, RFC3339 or milliseconds since the epoch")]
    pub created_at: Option<String>,

    #[arg(long = "drop-history", help = "Remove the base image history")]
    pub drop_history: bool,

    #[arg(long = "image", help = "JSON merged into the image config")]
    pub config_patch: Option<String>,

    #[arg(long = "meta", help = "JSON merged into the image metadata")]
    pub meta_patch: Option<String>,

    #[arg(long = "force", help = "Upload layers even if they already exist")]
    pub force: bool,

    #[arg(long = "dry-run", help = "Build the image without pushing it")]
    pub dry_run: bool,

    #[arg(long = "filter-by-os", help = "Regular expression selecting the base image from a manifest list")]
    pub filter_by_os: Option<String>,

    #[arg(long = "max-per-registry", help = "Parallel base layer copies")]
    pub max_per_registry: Option<usize>,
}

#[derive(ClapArgs, Debug, Default)]
pub struct InfoArgs {
    /// Images to describe
    #[arg(required = true)]
    pub images: Vec<String>,

    #[arg(long = "filter-by-os", help = "Regular expression selecting images from manifest lists")]
    pub filter_by_os: Option<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<()> {
        if let Some(auth) = self.auth() {
            auth.validate()?;
        } else if self.username.is_some() || self.password.is_some() {
            return Err(RegistryError::Validation(
                "--username and --password must be given together".to_string(),
            ));
        }
        if self.verbose && self.quiet {
            return Err(RegistryError::Validation(
                "--verbose and --quiet are mutually exclusive".to_string(),
            ));
        }
        match &self.command {
            Command::Mirror(mirror) if mirror.mappings.is_empty() && mirror.filenames.is_empty() => {
                Err(RegistryError::Validation(
                    "you must specify at least one source image to pull and the destination to push to as SRC=DST or SRC DST [DST2 DST3 ...]".to_string(),
                ))
            }
            Command::Append(append) if append.layers.is_empty() && !append.stdin && append.from.is_none() => {
                Err(RegistryError::Validation(
                    "append needs --from, layer files or --stdin".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn auth(&self) -> Option<AuthConfig> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(AuthConfig::new(username.clone(), password.clone())),
            _ => None,
        }
    }

    /// Engine settings given on the command line, defaults elsewhere
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig {
            insecure: self.insecure,
            verbose: self.verbose,
            ..Default::default()
        };
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        match &self.command {
            Command::Mirror(mirror) => {
                config.force = mirror.force;
                config.skip_mount = mirror.skip_mount;
                config.skip_missing = mirror.skip_missing;
                config.dry_run = mirror.dry_run;
                config.filter_by_os = mirror.filter_by_os.clone();
                if let Some(max) = mirror.max_registry {
                    config.max_registry = max;
                }
                if let Some(max) = mirror.max_per_registry {
                    config.max_per_registry = max;
                }
            }
            Command::Extract(extract) => {
                config.filter_by_os = extract.filter_by_os.clone();
            }
            Command::Append(append) => {
                config.force = append.force;
                config.dry_run = append.dry_run;
                config.filter_by_os = append.filter_by_os.clone();
                if let Some(max) = append.max_per_registry {
                    config.max_per_registry = max;
                }
            }
            Command::Info(info) => {
                config.filter_by_os = info.filter_by_os.clone();
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mirror_flags_into_config() {
        let args = Args::try_parse_from([
            "docker-image-mirror",
            "mirror",
            "a.io/x:1=b.io/x:1",
            "--max-per-registry",
            "3",
            "--skip-mount",
            "--insecure",
        ])
        .unwrap();
        args.validate().unwrap();
        let config = args.sync_config();
        assert_eq!(config.max_per_registry, 3);
        assert!(config.skip_mount);
        assert!(config.insecure);
        assert_eq!(config.max_registry, 4);
    }

    #[test]
    fn mirror_needs_mappings() {
        let args = Args::try_parse_from(["docker-image-mirror", "mirror"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn username_requires_password() {
        let args = Args::try_parse_from(["docker-image-mirror", "info", "a.io/x:1", "-u", "me"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn checksum_requires_archive() {
        assert!(Args::try_parse_from(["docker-image-mirror", "extract", "a.io/x:1", "--checksum"]).is_err());
        assert!(
            Args::try_parse_from([
                "docker-image-mirror",
                "extract",
                "a.io/x:1",
                "--archive",
                "out.tar.gz",
                "--checksum"
            ])
            .is_ok()
        );
    }
}
