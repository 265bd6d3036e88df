//! Command line interface module
//!
//! Parses arguments into engine settings and runs one subcommand
//! (`mirror`, `extract`, `append` or `info`) against real registries.

pub mod args;
pub mod config;
pub mod runner;

pub use args::{Args, Command};
pub use config::{AuthConfig, SyncConfig};
pub use runner::Runner;
