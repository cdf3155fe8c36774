use async_trait::async_trait;
use tokio::io::AsyncBufRead;

use crate::{MailReference, Result};

/// A mail opened for reading.
pub struct OpenMail {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Box<dyn AsyncBufRead + Send + Unpin>,
}

impl std::fmt::Debug for OpenMail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenMail")
            .field("sender", &self.sender)
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

/// Storage for mail awaiting delivery, partitioned by destination domain.
#[async_trait]
pub trait Queue: Send + Sync + std::fmt::Debug {
    /// Domains that currently have at least one queued mail.
    async fn domains(&self) -> Result<Vec<String>>;

    /// All mail queued for `domain`, oldest first.
    async fn list(&self, domain: &str) -> Result<Vec<MailReference>>;

    async fn open(&self, mail: &MailReference) -> Result<OpenMail>;

    async fn delete(&self, mail: &MailReference) -> Result<()>;

    /// Queue `body` for delivery to `recipients` at `domain`.
    async fn enqueue(
        &self,
        domain: &str,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<MailReference>;
}
