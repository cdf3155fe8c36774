use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{FileQueue, MemoryQueue, Queue, Result};

/// Which queue implementation to run with.
///
/// ```ron
/// queue: File(path: "/var/spool/despatch"),
/// ```
///
/// or, for throwaway deployments:
///
/// ```ron
/// queue: Memory,
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum QueueConfig {
    File { path: PathBuf },
    Memory,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::File {
            path: FileQueue::default().path().to_path_buf(),
        }
    }
}

impl QueueConfig {
    /// Initialise the configured backend.
    ///
    /// # Errors
    /// If a file queue's path is rejected or its directory cannot be prepared.
    pub fn into_queue(self) -> Result<Arc<dyn Queue>> {
        Ok(match self {
            Self::File { path } => {
                let queue = FileQueue::builder().path(path).build()?;
                queue.init()?;
                Arc::new(queue)
            }
            Self::Memory => Arc::new(MemoryQueue::new()),
        })
    }
}
