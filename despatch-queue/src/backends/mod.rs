//! Queue implementations.
//!
//! - [`FileQueue`]: one directory per domain, durable across restarts
//! - [`MemoryQueue`]: in-process, for tests and throwaway deployments

pub mod file;
pub mod memory;

pub use file::{FileQueue, FileQueueBuilder};
pub use memory::MemoryQueue;
