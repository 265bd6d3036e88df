//! Docker Image Mirror Library
//!
//! Copies, extracts and rebuilds Docker images directly against registries
//! speaking the Registry HTTP API v2, without a local daemon.
//!
//! - [`registry`]: authenticated, retrying registry access
//! - [`image`]: references, manifests, configs and manifest list resolution
//! - [`mirror`]: plans and executes registry to registry copies
//! - [`extract`] and [`append`]: move layers between registries and local disk
//! - [`cli`]: the command line front end

pub mod append;
pub mod cli;
pub mod concurrency;
pub mod error;
pub mod extract;
pub mod image;
pub mod logging;
pub mod mirror;
pub mod registry;
pub mod upload;

pub use error::{RegistryError, Result};
pub use logging::Logger;
