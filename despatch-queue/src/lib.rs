//! Outbound mail queue.
//!
//! Mail waiting for delivery is grouped by destination domain. The delivery
//! engine only ever lists, opens and deletes; [`Queue::enqueue`] is the entry
//! point for whatever accepts mail.

pub mod backends;
pub mod config;
pub mod error;
pub mod queue;
pub mod types;

pub use backends::{FileQueue, FileQueueBuilder, MemoryQueue};
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use queue::{OpenMail, Queue};
pub use types::{MailId, MailReference};
