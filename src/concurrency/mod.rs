//! Concurrency primitives shared by the mirror scheduler and the appender

pub mod workqueue;

pub use workqueue::{Batch, TryBatch, WorkQueue};
