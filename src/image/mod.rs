//! Image model: references, digests, manifests and configs
//!
//! - [`reference`]: pull specs such as `quay.io/org/app:v1[~/usr]`
//! - [`digest`]: validated `sha256:` content addresses
//! - [`manifest`]: schema1, schema2 and manifest list documents that keep
//!   their exact bytes
//! - [`config`]: the image config blob
//! - [`resolve`]: tag/list resolution and compatible pushes
//! - [`schema1`]: schema2 to signed schema1 conversion

pub mod config;
pub mod digest;
pub mod manifest;
pub mod reference;
pub mod resolve;
pub mod schema1;

pub use config::ImageConfig;
pub use digest::Digest;
pub use manifest::{Descriptor, Manifest, Platform};
pub use reference::{ImageReference, LayerFilter};
pub use resolve::{Location, PlatformFilter};
