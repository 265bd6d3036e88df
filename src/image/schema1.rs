//! Down-conversion of schema2 images to signed schema1 manifests
//!
//! Legacy registries reject schema2 manifests with `MANIFEST_INVALID`. For
//! those the image is rewritten as a schema1 manifest whose history carries
//! v1 compatibility JSON, then signed as a JWS with a throwaway ECDSA P-256
//! key. Registries only check that the signature is valid for the embedded
//! key, so a fresh key per push is enough.

use crate::error::{RegistryError, Result};
use crate::image::digest::{Digest, GZIPPED_EMPTY_LAYER_DIGEST};
use crate::image::manifest::{
    Descriptor, FsLayer, Manifest, Schema1Manifest, V1History, to_indented_json,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Digest as _;

const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// DER prefix of a P-256 SubjectPublicKeyInfo, followed by the 65 byte point
const P256_SPKI_PREFIX: &[u8] = &[
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

#[derive(Deserialize)]
struct ConfigView {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    rootfs: Option<RootFsView>,
    #[serde(default)]
    history: Vec<HistoryView>,
}

#[derive(Deserialize)]
struct RootFsView {
    #[serde(default)]
    diff_ids: Vec<String>,
}

#[derive(Deserialize)]
struct HistoryView {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    author: String,
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    empty_layer: bool,
}

#[derive(Serialize)]
struct CompatCommand {
    #[serde(rename = "Cmd")]
    cmd: Vec<String>,
}

/// Compatibility entry written for every layer below the top one
#[derive(Serialize)]
struct V1Compatibility {
    id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    parent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    comment: String,
    created: String,
    container_config: CompatCommand,
    #[serde(skip_serializing_if = "String::is_empty")]
    author: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    throwaway: bool,
}

/// Result of a conversion, before signing
pub struct Converted {
    pub manifest: Schema1Manifest,
    /// The gzipped empty layer is referenced and must exist in the target repository
    pub uses_empty_layer: bool,
}

/// Rebuild `layers` and the raw config blob as a schema1 manifest
pub fn convert(config_json: &[u8], layers: &[Descriptor], name: &str, tag: &str) -> Result<Converted> {
    let config: ConfigView = serde_json::from_slice(config_json)?;
    if config.history.is_empty() {
        return Err(RegistryError::Validation(
            "empty history when trying to create schema1 manifest".to_string(),
        ));
    }
    let diff_ids = config.rootfs.map(|r| r.diff_ids).unwrap_or_default();
    if diff_ids.len() != layers.len() {
        return Err(RegistryError::Validation(format!(
            "number of descriptors and number of layers in rootfs must match: {} != {}",
            layers.len(),
            diff_ids.len()
        )));
    }

    let empty_layer = Digest::parse(GZIPPED_EMPTY_LAYER_DIGEST)?;
    let count = config.history.len();
    let mut fs_layers = Vec::with_capacity(count);
    let mut history = Vec::with_capacity(count);
    let mut parent = String::new();
    let mut next_layer = layers.iter();
    let mut uses_empty_layer = false;

    let mut blob_for = |entry: &HistoryView| -> Result<Digest> {
        if entry.empty_layer {
            uses_empty_layer = true;
            return Ok(empty_layer.clone());
        }
        next_layer
            .next()
            .map(|l| l.digest.clone())
            .ok_or_else(|| {
                RegistryError::Validation("too many non-empty layers in History section".to_string())
            })
    };

    for entry in &config.history[..count - 1] {
        let blob_sum = blob_for(entry)?;
        let v1_id = Digest::from_bytes(format!("{} {}", blob_sum.hex(), parent).as_bytes());
        let compat = V1Compatibility {
            id: v1_id.hex().to_string(),
            parent: parent.clone(),
            comment: entry.comment.clone(),
            created: entry.created.clone().unwrap_or_else(|| ZERO_TIME.to_string()),
            container_config: CompatCommand {
                cmd: vec![entry.created_by.clone()],
            },
            author: entry.author.clone(),
            throwaway: entry.empty_layer,
        };
        history.push(V1History {
            v1_compatibility: serde_json::to_string(&compat)?,
        });
        fs_layers.push(FsLayer { blob_sum });
        parent = v1_id.hex().to_string();
    }

    let latest = &config.history[count - 1];
    let blob_sum = blob_for(latest)?;
    let mut top_input = format!("{} {} ", blob_sum.hex(), parent).into_bytes();
    top_input.extend_from_slice(config_json);
    let top_id = Digest::from_bytes(&top_input);

    let mut top: Map<String, Value> = serde_json::from_slice(config_json)?;
    top.remove("rootfs");
    top.remove("history");
    top.insert("id".to_string(), Value::from(top_id.hex()));
    if !parent.is_empty() {
        top.insert("parent".to_string(), Value::from(parent.as_str()));
    }
    if latest.empty_layer {
        top.insert("throwaway".to_string(), Value::from(true));
    }
    history.push(V1History {
        v1_compatibility: serde_json::to_string(&top)?,
    });
    fs_layers.push(FsLayer { blob_sum });

    // schema1 lists the youngest layer first
    fs_layers.reverse();
    history.reverse();

    Ok(Converted {
        manifest: Schema1Manifest {
            schema_version: 1,
            name: name.to_string(),
            tag: tag.to_string(),
            architecture: config.architecture,
            fs_layers,
            history,
        },
        uses_empty_layer,
    })
}

#[derive(Serialize)]
struct Jwk {
    crv: &'static str,
    kid: String,
    kty: &'static str,
    x: String,
    y: String,
}

#[derive(Serialize)]
struct JwsHeader {
    jwk: Jwk,
    alg: &'static str,
}

#[derive(Serialize)]
struct JwsSignature {
    header: JwsHeader,
    signature: String,
    protected: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Protected {
    format_length: usize,
    format_tail: String,
    time: String,
}

/// Sign `manifest` with a freshly generated key, producing a pretty JWS
pub fn sign(manifest: Schema1Manifest) -> Result<Manifest> {
    let rng = SystemRandom::new();
    let signing_error = |what: &str| RegistryError::Validation(format!("schema1 signing failed: {}", what));
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|_| signing_error("key generation"))?;
    let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
        .map_err(|_| signing_error("key decoding"))?;

    let payload = to_indented_json(&manifest)?;
    let close = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .filter(|&i| payload[i] == b'}')
        .ok_or_else(|| signing_error("payload is not a JSON object"))?;
    let format_length = payload[..close]
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .ok_or_else(|| signing_error("payload is empty"))?;
    let tail = payload[format_length..].to_vec();

    let protected = serde_json::to_vec(&Protected {
        format_length,
        format_tail: URL_SAFE_NO_PAD.encode(&tail),
        time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })?;
    let protected = URL_SAFE_NO_PAD.encode(protected);
    let signing_input = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(&payload));
    let signature = key
        .sign(&rng, signing_input.as_bytes())
        .map_err(|_| signing_error("sign"))?;

    let point = key.public_key().as_ref();
    let signatures = vec![JwsSignature {
        header: JwsHeader {
            jwk: Jwk {
                crv: "P-256",
                kid: key_id(point),
                kty: "EC",
                x: URL_SAFE_NO_PAD.encode(&point[1..33]),
                y: URL_SAFE_NO_PAD.encode(&point[33..65]),
            },
            alg: "ES256",
        },
        signature: URL_SAFE_NO_PAD.encode(signature.as_ref()),
        protected,
    }];

    let encoded = String::from_utf8(to_indented_json(&signatures)?)
        .map_err(|_| signing_error("signature encoding"))?
        .replace('\n', "\n   ");
    let mut signed = payload[..format_length].to_vec();
    signed.extend_from_slice(b",\n   \"signatures\": ");
    signed.extend_from_slice(encoded.as_bytes());
    signed.extend_from_slice(b"\n}");

    Ok(Manifest::from_signed_schema1(manifest, signed, format_length, tail))
}

/// libtrust key id: base32 of the first 240 bits of sha256(SPKI DER), in
/// colon separated groups of four
fn key_id(point: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(P256_SPKI_PREFIX);
    hasher.update(point);
    let hash = hasher.finalize();
    let encoded = base32(&hash[..30]);
    encoded
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn base32(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 31) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::manifest::{MEDIA_TYPE_LAYER, MEDIA_TYPE_SCHEMA1_SIGNED};
    use ring::signature::{ECDSA_P256_SHA256_FIXED, UnparsedPublicKey};

    fn sample_config() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Cmd": ["/bin/sh"]},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:01", "sha256:02"]},
            "history": [
                {"created": "2020-01-01T00:00:00Z", "created_by": "ADD rootfs"},
                {"created": "2020-01-02T00:00:00Z", "created_by": "ENV A=1", "empty_layer": true},
                {"created": "2020-01-03T00:00:00Z", "created_by": "RUN make"}
            ]
        }))
        .unwrap()
    }

    fn layers() -> Vec<Descriptor> {
        vec![
            Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"base"), 4),
            Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"top"), 3),
        ]
    }

    #[test]
    fn converts_history_youngest_first() {
        let converted = convert(&sample_config(), &layers(), "team/app", "v1").unwrap();
        let m = converted.manifest;
        assert!(converted.uses_empty_layer);
        assert_eq!(m.fs_layers.len(), 3);
        assert_eq!(m.fs_layers[0].blob_sum, Digest::from_bytes(b"top"));
        assert_eq!(m.fs_layers[1].blob_sum.as_str(), GZIPPED_EMPTY_LAYER_DIGEST);
        assert_eq!(m.fs_layers[2].blob_sum, Digest::from_bytes(b"base"));

        let top: Value = serde_json::from_str(&m.history[0].v1_compatibility).unwrap();
        assert!(top.get("rootfs").is_none());
        assert_eq!(top["config"]["Cmd"][0], "/bin/sh");
        let middle: Value = serde_json::from_str(&m.history[1].v1_compatibility).unwrap();
        assert_eq!(middle["throwaway"], true);
        assert_eq!(top["parent"], middle["id"]);
    }

    #[test]
    fn rejects_mismatched_layer_counts() {
        let err = convert(&sample_config(), &layers()[..1], "team/app", "v1");
        assert!(matches!(err, Err(RegistryError::Validation(_))));
    }

    #[test]
    fn signature_verifies_against_embedded_key() {
        let converted = convert(&sample_config(), &layers(), "team/app", "v1").unwrap();
        let signed = sign(converted.manifest).unwrap();
        assert_eq!(signed.media_type(), MEDIA_TYPE_SCHEMA1_SIGNED);

        let reparsed = Manifest::parse(Some(MEDIA_TYPE_SCHEMA1_SIGNED), signed.payload().to_vec()).unwrap();
        assert_eq!(reparsed.digest(), signed.digest());

        let doc: Value = serde_json::from_slice(signed.payload()).unwrap();
        let sig = &doc["signatures"][0];
        let jwk = &sig["header"]["jwk"];
        let mut point = vec![4u8];
        point.extend(URL_SAFE_NO_PAD.decode(jwk["x"].as_str().unwrap()).unwrap());
        point.extend(URL_SAFE_NO_PAD.decode(jwk["y"].as_str().unwrap()).unwrap());
        assert_eq!(jwk["kid"].as_str().unwrap().split(':').count(), 12);

        let canonical = {
            let protected = crate::image::manifest::decode_base64url(sig["protected"].as_str().unwrap()).unwrap();
            let header: Value = serde_json::from_slice(&protected).unwrap();
            let len = header["formatLength"].as_u64().unwrap() as usize;
            let mut bytes = signed.payload()[..len].to_vec();
            bytes.extend(URL_SAFE_NO_PAD.decode(header["formatTail"].as_str().unwrap()).unwrap());
            bytes
        };
        assert_eq!(Digest::from_bytes(&canonical), signed.digest());

        let input = format!(
            "{}.{}",
            sig["protected"].as_str().unwrap(),
            URL_SAFE_NO_PAD.encode(&canonical)
        );
        let signature = URL_SAFE_NO_PAD.decode(sig["signature"].as_str().unwrap()).unwrap();
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &point)
            .verify(input.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn base32_matches_rfc4648() {
        assert_eq!(base32(b"foobar"), "MZXW6YTBOI");
        assert_eq!(base32(b"f"), "MY");
    }
}
