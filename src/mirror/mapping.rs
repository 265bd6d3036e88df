//! Source to destination mappings
//!
//! Accepted forms, on the command line or one per line in a mapping file:
//! - `SRC=DST`, any number of pairs
//! - `SRC DST [DST...]`, one source fanned out to several destinations
//!
//! In files everything after `#` is a comment and blank lines are skipped.

use crate::error::{RegistryError, Result};
use crate::image::reference::ImageReference;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

const S3_PREFIX: &str = "s3://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DestinationType {
    #[default]
    Registry,
    S3,
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Registry => f.write_str("docker"),
            DestinationType::S3 => f.write_str("s3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub source: ImageReference,
    pub destination: ImageReference,
    pub destination_type: DestinationType,
}

impl Mapping {
    /// Destination as printed in results, with the `s3://` prefix restored
    pub fn destination_display(&self) -> String {
        match self.destination_type {
            DestinationType::S3 => format!("{}{}", S3_PREFIX, self.destination),
            DestinationType::Registry => self.destination.to_string(),
        }
    }
}

fn parse_source(value: &str) -> Result<ImageReference> {
    let source = ImageReference::parse(value)
        .map_err(|e| RegistryError::Validation(format!("{:?} is not a valid image reference: {}", value, e)))?;
    if source.tag.is_none() && source.digest.is_none() {
        return Err(RegistryError::Validation(format!(
            "you must specify a tag or digest for SRC {}",
            value
        )));
    }
    Ok(source)
}

fn parse_destination(value: &str) -> Result<(ImageReference, DestinationType)> {
    let (value, kind) = match value.strip_prefix(S3_PREFIX) {
        Some(rest) => (rest, DestinationType::S3),
        None => (value, DestinationType::Registry),
    };
    let destination = ImageReference::parse(value)
        .map_err(|e| RegistryError::Validation(format!("{:?} is not a valid image reference: {}", value, e)))?;
    if destination.digest.is_some() {
        return Err(RegistryError::Validation(format!(
            "you must specify a tag for DST {} or leave it blank to only push by digest",
            value
        )));
    }
    Ok((destination, kind))
}

/// Accumulates mappings from arguments and files, rejecting a destination
/// named twice
#[derive(Debug, Default)]
pub struct MappingParser {
    seen: HashMap<String, String>,
    mappings: Vec<Mapping>,
}

impl MappingParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, source: &ImageReference, destination: ImageReference, kind: DestinationType) -> Result<()> {
        if source.same_repository(&destination) && source.tag == destination.tag && source.digest.is_none() {
            return Err(RegistryError::Validation(format!(
                "SRC and DST may not be the same: {}",
                source
            )));
        }
        let key = destination.to_string();
        if self.seen.contains_key(&key) {
            return Err(RegistryError::Validation(format!(
                "each destination tag may only be specified once: {}",
                key
            )));
        }
        self.seen.insert(key, source.to_string());
        self.mappings.push(Mapping {
            source: source.clone(),
            destination,
            destination_type: kind,
        });
        Ok(())
    }

    pub fn parse_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        let mut remaining = Vec::new();
        let mut pairs = 0;
        for arg in args {
            let arg = arg.as_ref();
            let Some((src, dst)) = arg.split_once('=') else {
                remaining.push(arg);
                continue;
            };
            if src.is_empty() || dst.is_empty() {
                return Err(RegistryError::Validation(
                    "all arguments must be valid SRC=DST mappings".to_string(),
                ));
            }
            let source = parse_source(src)?;
            let (destination, kind) = parse_destination(dst)?;
            self.push(&source, destination, kind)?;
            pairs += 1;
        }

        match remaining.as_slice() {
            [] => Ok(()),
            [source, destinations @ ..] if !destinations.is_empty() && pairs == 0 => {
                let source = parse_source(source)?;
                for dst in destinations {
                    let (destination, kind) = parse_destination(dst)?;
                    self.push(&source, destination, kind)?;
                }
                Ok(())
            }
            _ => Err(RegistryError::Validation(
                "all arguments must be valid SRC=DST mappings, or you must specify one SRC argument and one or more DST arguments"
                    .to_string(),
            )),
        }
    }

    pub fn parse_str(&mut self, content: &str, origin: &str) -> Result<()> {
        for (number, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let args: Vec<&str> = line.split_whitespace().collect();
            self.parse_args(&args).map_err(|e| {
                RegistryError::Validation(format!("file {}, line {}: {}", origin, number + 1, e))
            })?;
        }
        Ok(())
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_str(&content, &path.display().to_string())
    }

    /// All mappings collected so far; at least one is required
    pub fn finish(self) -> Result<Vec<Mapping>> {
        if self.mappings.is_empty() {
            return Err(RegistryError::Validation(
                "you must specify at least one source image to pull and the destination to push to as SRC=DST or SRC DST [DST2 DST3 ...]"
                    .to_string(),
            ));
        }
        Ok(self.mappings)
    }
}

/// Parse command line mappings
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<Mapping>> {
    let mut parser = MappingParser::new();
    parser.parse_args(args)?;
    parser.finish()
}

/// Parse a mapping file
pub fn parse_file(path: &Path) -> Result<Vec<Mapping>> {
    let mut parser = MappingParser::new();
    parser.parse_file(path)?;
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pairs_and_fan_out() {
        let mappings = parse_args(&["quay.io/a/b:1=quay.io/c/d:1", "quay.io/a/b:2=quay.io/c/d:2"]).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].destination.tag.as_deref(), Some("2"));

        let mappings = parse_args(&["quay.io/a/b:1", "quay.io/c/d:1", "s3://s3.amazonaws.com/us-east-1/bucket/img"]).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].destination_type, DestinationType::S3);
        assert_eq!(mappings[1].destination.registry, "s3.amazonaws.com");
    }

    #[test]
    fn rejects_invalid_mappings() {
        // source without tag or digest
        assert!(parse_args(&["quay.io/a/b=quay.io/c/d:1"]).is_err());
        // destination with a digest
        let digest = format!("sha256:{}", "a".repeat(64));
        assert!(parse_args(&[format!("quay.io/a/b:1=quay.io/c/d@{}", digest)]).is_err());
        // duplicate destination
        assert!(parse_args(&["quay.io/a/b:1=quay.io/c/d:1", "quay.io/a/b:2=quay.io/c/d:1"]).is_err());
        // same source and destination
        assert!(parse_args(&["quay.io/a/b:1=quay.io/a/b:1"]).is_err());
        // a lone source
        assert!(parse_args(&["quay.io/a/b:1"]).is_err());
    }

    #[test]
    fn file_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# mirror list").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "quay.io/a/b:1=registry.local/b:1  # first").unwrap();
        writeln!(file, "quay.io/a/b:2 registry.local/b:2 registry.local/b:two").unwrap();

        let mappings = parse_file(file.path()).unwrap();
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[2].destination.tag.as_deref(), Some("two"));
    }

    #[test]
    fn file_errors_name_the_line() {
        let mut parser = MappingParser::new();
        let err = parser
            .parse_str("quay.io/a/b:1=quay.io/c/d:1\nquay.io/a/b=quay.io/c/d:2\n", "mirror.txt")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
