use std::{
    collections::BTreeMap,
    io::Cursor,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    MailId, MailReference, OpenMail, Queue, QueueError, Result,
    types::{dedup_recipients, normalise_domain},
};

#[derive(Debug)]
struct StoredMail {
    reference: MailReference,
    body: Arc<[u8]>,
}

type Domains = BTreeMap<String, BTreeMap<MailId, StoredMail>>;

/// In-memory queue. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    mails: Arc<RwLock<Domains>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of queued mails across all domains.
    ///
    /// # Errors
    /// If the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.mails.read()?.values().map(BTreeMap::len).sum())
    }

    /// # Errors
    /// If the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn domains(&self) -> Result<Vec<String>> {
        Ok(self.mails.read()?.keys().cloned().collect())
    }

    async fn list(&self, domain: &str) -> Result<Vec<MailReference>> {
        let Some(domain) = normalise_domain(domain) else {
            return Err(QueueError::InvalidDomain(domain.to_string()));
        };

        Ok(self
            .mails
            .read()?
            .get(&domain)
            .map(|mails| mails.values().map(|m| m.reference.clone()).collect())
            .unwrap_or_default())
    }

    async fn open(&self, mail: &MailReference) -> Result<OpenMail> {
        let mails = self.mails.read()?;
        let stored = mails
            .get(&mail.domain)
            .and_then(|domain| domain.get(&mail.id))
            .ok_or(QueueError::NotFound(mail.id))?;

        Ok(OpenMail {
            sender: stored.reference.sender.clone(),
            recipients: stored.reference.recipients.clone(),
            body: Box::new(Cursor::new(Arc::clone(&stored.body))),
        })
    }

    async fn delete(&self, mail: &MailReference) -> Result<()> {
        let mut mails = self.mails.write()?;
        let domain = mails
            .get_mut(&mail.domain)
            .ok_or(QueueError::NotFound(mail.id))?;

        domain.remove(&mail.id).ok_or(QueueError::NotFound(mail.id))?;
        if domain.is_empty() {
            mails.remove(&mail.domain);
        }

        Ok(())
    }

    async fn enqueue(
        &self,
        domain: &str,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<MailReference> {
        let Some(domain) = normalise_domain(domain) else {
            return Err(QueueError::InvalidDomain(domain.to_string()));
        };
        let recipients = dedup_recipients(recipients);
        if recipients.is_empty() {
            return Err(QueueError::NoRecipients);
        }

        let reference = MailReference {
            id: MailId::generate(),
            domain: domain.clone(),
            sender: sender.to_string(),
            recipients,
        };

        self.mails.write()?.entry(domain).or_default().insert(
            reference.id,
            StoredMail {
                reference: reference.clone(),
                body: Arc::from(body),
            },
        );

        Ok(reference)
    }
}
