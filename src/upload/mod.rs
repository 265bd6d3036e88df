//! Layer upload helpers
//!
//! [`streaming`] computes blob digests and diff IDs while layer bytes are
//! forwarded to a registry.

pub mod streaming;

pub use streaming::{DigestCopyResult, PendingDigest, digest_copy, digest_stream, file_stream, reader_stream};
