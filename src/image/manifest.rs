//! Docker manifest model
//!
//! [`Manifest`] is a closed union over the three Docker schemas. Every value
//! keeps the exact bytes it was decoded from (or encoded to) so its digest is
//! reproducible:
//! - schema1: the digest covers the JWS payload with signatures removed
//! - schema2 and manifest lists: the digest covers the raw bytes

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Accept list for manifest requests, in order of preference
pub const MANIFEST_ACCEPT: &[&str] = &[
    MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_SCHEMA2,
    MEDIA_TYPE_SCHEMA1_SIGNED,
    MEDIA_TYPE_SCHEMA1,
];

/// Content address of a blob or manifest. Two descriptors are equal when
/// their digests are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            size,
            digest,
            urls: Vec::new(),
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            ..Default::default()
        }
    }

    /// `os/arch` or `os/arch/variant`
    pub fn display_name(&self) -> String {
        if self.variant.is_empty() {
            format!("{}/{}", self.os, self.architecture)
        } else {
            format!("{}/{}/{}", self.os, self.architecture, self.variant)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(default)]
    pub platform: Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<ManifestDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Schema2Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_SCHEMA2.to_string(),
            config,
            layers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    pub v1_compatibility: String,
}

/// Field order matches the canonical encoding registries expect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<V1History>,
}

/// A decoded value together with the bytes it travels as
#[derive(Debug, Clone)]
pub struct Encoded<T> {
    pub value: T,
    raw: Vec<u8>,
    canonical_len: Option<usize>,
    canonical_tail: Vec<u8>,
}

impl<T> Encoded<T> {
    fn plain(value: T, raw: Vec<u8>) -> Self {
        Self {
            value,
            raw,
            canonical_len: None,
            canonical_tail: Vec::new(),
        }
    }

    /// Bytes covered by the digest
    fn canonical(&self) -> Vec<u8> {
        match self.canonical_len {
            Some(len) => {
                let mut bytes = self.raw[..len].to_vec();
                bytes.extend_from_slice(&self.canonical_tail);
                bytes
            }
            None => self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Manifest {
    Schema1(Encoded<Schema1Manifest>),
    Schema2(Encoded<Schema2Manifest>),
    List(Encoded<ManifestList>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    signatures: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

impl Manifest {
    /// Decode manifest bytes. `content_type` comes from the response header
    /// and is only trusted when it names a Docker manifest type.
    pub fn parse(content_type: Option<&str>, raw: Vec<u8>) -> Result<Self> {
        let versioned: Versioned = serde_json::from_slice(&raw)
            .map_err(|e| RegistryError::Parse(format!("invalid manifest: {}", e)))?;

        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
            .filter(|ct| MANIFEST_ACCEPT.contains(ct))
            .map(str::to_string)
            .or(versioned.media_type.clone());

        if versioned.schema_version == 1 {
            return Self::parse_schema1(raw, versioned.signatures.unwrap_or_default());
        }

        match declared.as_deref() {
            Some(MEDIA_TYPE_MANIFEST_LIST) => {
                let value: ManifestList = serde_json::from_slice(&raw)?;
                Ok(Manifest::List(Encoded::plain(value, raw)))
            }
            Some(MEDIA_TYPE_SCHEMA2) => {
                let value: Schema2Manifest = serde_json::from_slice(&raw)?;
                Ok(Manifest::Schema2(Encoded::plain(value, raw)))
            }
            other => Err(RegistryError::Validation(format!(
                "unsupported manifest media type {:?}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    fn parse_schema1(raw: Vec<u8>, signatures: Vec<serde_json::Value>) -> Result<Self> {
        let value: Schema1Manifest = serde_json::from_slice(&raw)?;
        let protected = signatures
            .first()
            .and_then(|sig| sig.get("protected"))
            .and_then(|p| p.as_str());

        let Some(protected) = protected else {
            return Ok(Manifest::Schema1(Encoded::plain(value, raw)));
        };

        let header = decode_base64url(protected)?;
        let header: ProtectedHeader = serde_json::from_slice(&header)?;
        if header.format_length > raw.len() {
            return Err(RegistryError::Parse(
                "schema1 signature format length exceeds manifest size".to_string(),
            ));
        }
        Ok(Manifest::Schema1(Encoded {
            value,
            raw,
            canonical_len: Some(header.format_length),
            canonical_tail: decode_base64url(&header.format_tail)?,
        }))
    }

    pub fn from_schema2(value: Schema2Manifest) -> Result<Self> {
        let raw = to_indented_json(&value)?;
        Ok(Manifest::Schema2(Encoded::plain(value, raw)))
    }

    pub fn from_list(value: ManifestList) -> Result<Self> {
        let raw = to_indented_json(&value)?;
        Ok(Manifest::List(Encoded::plain(value, raw)))
    }

    /// Signed schema1 from its payload and the full JWS document
    pub(crate) fn from_signed_schema1(
        value: Schema1Manifest,
        signed: Vec<u8>,
        payload_len: usize,
        tail: Vec<u8>,
    ) -> Self {
        Manifest::Schema1(Encoded {
            value,
            raw: signed,
            canonical_len: Some(payload_len),
            canonical_tail: tail,
        })
    }

    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1(m) if m.canonical_len.is_some() => MEDIA_TYPE_SCHEMA1_SIGNED,
            Manifest::Schema1(_) => MEDIA_TYPE_SCHEMA1,
            Manifest::Schema2(_) => MEDIA_TYPE_SCHEMA2,
            Manifest::List(_) => MEDIA_TYPE_MANIFEST_LIST,
        }
    }

    /// Bytes to send when pushing this manifest
    pub fn payload(&self) -> &[u8] {
        match self {
            Manifest::Schema1(m) => &m.raw,
            Manifest::Schema2(m) => &m.raw,
            Manifest::List(m) => &m.raw,
        }
    }

    pub fn digest(&self) -> Digest {
        let canonical = match self {
            Manifest::Schema1(m) => m.canonical(),
            Manifest::Schema2(m) => m.canonical(),
            Manifest::List(m) => m.canonical(),
        };
        Digest::from_bytes(&canonical)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.media_type(),
            self.digest(),
            self.payload().len() as u64,
        )
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Manifest::List(_))
    }

    /// Blobs (schema1/schema2) or child manifests (lists) this manifest
    /// points at, without duplicates and in manifest order
    pub fn references(&self) -> Vec<Descriptor> {
        let all: Vec<Descriptor> = match self {
            Manifest::Schema2(m) => std::iter::once(m.value.config.clone())
                .chain(m.value.layers.iter().cloned())
                .collect(),
            Manifest::Schema1(m) => m
                .value
                .fs_layers
                .iter()
                .rev()
                .map(|l| Descriptor::new(MEDIA_TYPE_LAYER, l.blob_sum.clone(), 0))
                .collect(),
            Manifest::List(m) => m
                .value
                .manifests
                .iter()
                .map(|c| c.descriptor.clone())
                .collect(),
        };
        let mut seen = std::collections::HashSet::new();
        all.into_iter()
            .filter(|d| seen.insert(d.digest.clone()))
            .collect()
    }
}

/// Serialize with the three-space indentation registries produce
pub fn to_indented_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

pub(crate) fn decode_base64url(value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| RegistryError::Parse(format!("invalid base64url value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(content: &[u8]) -> Descriptor {
        Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(content), content.len() as u64)
    }

    #[test]
    fn schema2_digest_covers_raw_bytes() {
        let manifest = Manifest::from_schema2(Schema2Manifest::new(
            Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, Digest::from_bytes(b"{}"), 2),
            vec![layer(b"one"), layer(b"two")],
        ))
        .unwrap();

        let reparsed =
            Manifest::parse(Some(MEDIA_TYPE_SCHEMA2), manifest.payload().to_vec()).unwrap();
        assert_eq!(reparsed.digest(), Digest::from_bytes(manifest.payload()));
        assert_eq!(reparsed.references().len(), 3);
        assert!(std::str::from_utf8(manifest.payload()).unwrap().contains("\n   \"schemaVersion\""));
    }

    #[test]
    fn detects_type_from_body_when_header_is_generic() {
        let list = ManifestList {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
            manifests: vec![],
        };
        let raw = to_indented_json(&list).unwrap();
        let parsed = Manifest::parse(Some("application/json"), raw).unwrap();
        assert!(parsed.is_list());
    }

    #[test]
    fn signed_schema1_digest_ignores_signatures() {
        let payload = b"{\n   \"schemaVersion\": 1,\n   \"name\": \"a/b\",\n   \"tag\": \"v1\",\n   \"architecture\": \"amd64\",\n   \"fsLayers\": [],\n   \"history\": []\n}";
        let format_length = payload.len() - 2;
        let protected = URL_SAFE_NO_PAD.encode(format!(
            "{{\"formatLength\":{},\"formatTail\":\"{}\"}}",
            format_length,
            URL_SAFE_NO_PAD.encode(&payload[format_length..])
        ));
        let mut signed = payload[..format_length].to_vec();
        signed.extend_from_slice(
            format!(
                ",\n   \"signatures\": [{{\"signature\":\"x\",\"protected\":\"{}\"}}]\n}}",
                protected
            )
            .as_bytes(),
        );

        let manifest = Manifest::parse(Some(MEDIA_TYPE_SCHEMA1_SIGNED), signed).unwrap();
        assert_eq!(manifest.media_type(), MEDIA_TYPE_SCHEMA1_SIGNED);
        assert_eq!(manifest.digest(), Digest::from_bytes(payload));
    }

    #[test]
    fn descriptors_compare_by_digest() {
        let mut a = layer(b"same");
        let b = layer(b"same");
        a.media_type = "other".to_string();
        assert_eq!(a, b);
    }
}
