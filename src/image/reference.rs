//! Image references and pull-spec parsing
//!
//! Pull-spec syntax: `[registry/]repository[:tag|@digest][[selector]]`, where
//! the optional selector picks layers for extraction: `[N]`, `[A:B]` or
//! `[~digestprefix]`.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::Descriptor;
use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

/// A parsed image reference. The digest is authoritative when both a tag and
/// a digest are present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RegistryError::Validation(
                "image reference cannot be empty".to_string(),
            ));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons are ports.
        let last_slash = name.rfind('/');
        let (name, tag) = match name.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&name[..colon], Some(name[colon + 1..].to_string()))
            }
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        validate_repository(&repository)?;
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag-or-digest string used to resolve this reference
    pub fn reference(&self) -> Option<String> {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => Some(digest.to_string()),
            (None, Some(tag)) => Some(tag.clone()),
            (None, None) => None,
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            tag: None,
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Same registry and repository
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }

    /// Host to contact for this reference's registry
    pub fn registry_endpoint(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_ENDPOINT
        } else {
            &self.registry
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_repository(repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        });
    if !valid {
        return Err(RegistryError::Validation(format!(
            "invalid repository name: {}",
            repository
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if !valid {
        return Err(RegistryError::Validation(format!("invalid tag: {}", tag)));
    }
    Ok(())
}

/// Layer selector suffix of a pull spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerFilter {
    /// `[N]`, negative counts from the youngest layer
    Index(isize),
    /// `[A:B]`, either bound may be omitted
    Range(Option<isize>, Option<isize>),
    /// `[~prefix]`, layers whose blob digest starts with the prefix
    Prefix(String),
}

impl LayerFilter {
    pub fn parse(selector: &str) -> Result<Self> {
        let invalid = || RegistryError::Validation(format!("invalid layer selector [{}]", selector));
        let parse_bound = |value: &str| -> Result<Option<isize>> {
            let value = value.trim();
            if value.is_empty() {
                Ok(None)
            } else {
                value.parse().map(Some).map_err(|_| invalid())
            }
        };

        if let Some(prefix) = selector.strip_prefix('~') {
            let prefix = prefix.strip_prefix("sha256:").unwrap_or(prefix);
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            return Ok(LayerFilter::Prefix(prefix.to_ascii_lowercase()));
        }
        if let Some((start, end)) = selector.split_once(':') {
            return Ok(LayerFilter::Range(parse_bound(start)?, parse_bound(end)?));
        }
        parse_bound(selector)?
            .map(LayerFilter::Index)
            .ok_or_else(invalid)
    }

    /// Indices into `layers` selected by this filter, oldest first
    pub fn select(&self, layers: &[Descriptor]) -> Result<Vec<usize>> {
        let len = layers.len() as isize;
        let resolve = |i: isize| if i < 0 { len + i } else { i };

        match self {
            LayerFilter::Index(index) => {
                let i = resolve(*index);
                if i < 0 || i >= len {
                    return Err(RegistryError::Validation(format!(
                        "layer index {} out of range, image has {} layers",
                        index, len
                    )));
                }
                Ok(vec![i as usize])
            }
            LayerFilter::Range(start, end) => {
                let start = start.map(resolve).unwrap_or(0).clamp(0, len);
                let end = end.map(resolve).unwrap_or(len).clamp(0, len);
                Ok((start..end.max(start)).map(|i| i as usize).collect())
            }
            LayerFilter::Prefix(prefix) => {
                let selected: Vec<usize> = layers
                    .iter()
                    .enumerate()
                    .filter(|(_, layer)| layer.digest.hex().starts_with(prefix.as_str()))
                    .map(|(i, _)| i)
                    .collect();
                if selected.is_empty() {
                    return Err(RegistryError::Validation(format!(
                        "no layer digest starts with {}",
                        prefix
                    )));
                }
                Ok(selected)
            }
        }
    }
}

/// Parse a pull spec with an optional trailing layer selector
pub fn parse_pull_spec(spec: &str) -> Result<(ImageReference, Option<LayerFilter>)> {
    let spec = spec.trim();
    match spec.strip_suffix(']').and_then(|s| s.rsplit_once('[')) {
        Some((reference, selector)) => Ok((
            ImageReference::parse(reference)?,
            Some(LayerFilter::parse(selector)?),
        )),
        None => Ok((ImageReference::parse(spec)?, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(n: usize) -> Vec<Descriptor> {
        (0..n)
            .map(|i| Descriptor::new("layer", Digest::from_bytes(&[i as u8]), 1))
            .collect()
    }

    #[test]
    fn parses_docker_hub_shorthand() {
        let r = ImageReference::parse("busybox").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, None);
        assert_eq!(r.registry_endpoint(), DOCKER_HUB_ENDPOINT);
    }

    #[test]
    fn distinguishes_ports_from_tags() {
        let r = ImageReference::parse("localhost:5000/team/app:v1.2").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v1.2"));

        let r = ImageReference::parse("quay.io:443/team/app").unwrap();
        assert_eq!(r.registry, "quay.io:443");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn digest_is_authoritative() {
        let digest = Digest::from_bytes(b"manifest");
        let r = ImageReference::parse(&format!("quay.io/a/b:latest@{}", digest)).unwrap();
        assert_eq!(r.reference(), Some(digest.to_string()));
        assert_eq!(r.to_string(), format!("quay.io/a/b:latest@{}", digest));
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(ImageReference::parse("quay.io/Upper/case").is_err());
        assert!(ImageReference::parse("quay.io/a/b:-bad").is_err());
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn parses_selectors() {
        let (r, f) = parse_pull_spec("quay.io/a/b:v1[1:3]").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(f, Some(LayerFilter::Range(Some(1), Some(3))));

        let (_, f) = parse_pull_spec("quay.io/a/b:v1[-1]").unwrap();
        assert_eq!(f, Some(LayerFilter::Index(-1)));

        let (_, f) = parse_pull_spec("quay.io/a/b:v1[~ABC]").unwrap();
        assert_eq!(f, Some(LayerFilter::Prefix("abc".into())));

        assert!(parse_pull_spec("quay.io/a/b:v1[x]").is_err());
    }

    #[test]
    fn selects_layers() {
        let layers = layers(4);
        assert_eq!(LayerFilter::Index(-1).select(&layers).unwrap(), vec![3]);
        assert!(LayerFilter::Index(4).select(&layers).is_err());
        assert_eq!(
            LayerFilter::Range(Some(1), None).select(&layers).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            LayerFilter::Range(None, Some(-2)).select(&layers).unwrap(),
            vec![0, 1]
        );
        assert!(
            LayerFilter::Range(Some(3), Some(1))
                .select(&layers)
                .unwrap()
                .is_empty()
        );

        let prefix = layers[2].digest.hex()[..8].to_string();
        assert_eq!(
            LayerFilter::Prefix(prefix).select(&layers).unwrap(),
            vec![2]
        );
    }
}
