use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use despatch_common::internal;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::BufReader};

use crate::{
    MailId, MailReference, OpenMail, Queue, QueueError, Result,
    types::{dedup_recipients, normalise_domain},
};

/// File-based queue.
///
/// Mail is stored under one directory per destination domain:
/// - `{root}/{domain}/{id}.eml` holds the raw message
/// - `{root}/{domain}/{id}.meta` holds sender and recipients as bincode
///
/// Writes go to `.tmp_` files that are renamed into place, metadata last, so
/// a mail only becomes visible once both files are complete. Deletes rename
/// both files to a `.deleted` suffix before removing them; leftovers from
/// either operation are cleaned up by [`FileQueue::init`].
#[derive(Debug, Clone)]
pub struct FileQueue {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    sender: String,
    recipients: Vec<String>,
}

impl Default for FileQueue {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/despatch"),
        }
    }
}

impl FileQueue {
    /// Reject relative paths, `..` components and system directories.
    fn validate_path(path: &Path) -> Result<()> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(QueueError::InvalidPath(format!(
                "cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(QueueError::InvalidPath(format!(
                "must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(QueueError::InvalidPath(format!(
                "cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileQueueBuilder {
        FileQueueBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the queue directory if needed and remove files left behind by
    /// interrupted writes or deletes.
    ///
    /// # Errors
    /// If the directory cannot be created or read, or exists but is not a
    /// directory.
    pub fn init(&self) -> Result<()> {
        internal!("Initialising queue at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(QueueError::InvalidPath(format!(
                "expected {} to be a directory",
                self.path.display()
            )));
        }

        let mut cleaned = 0;
        for domain in std::fs::read_dir(&self.path)? {
            let domain = domain?;
            if !domain.file_type()?.is_dir() {
                continue;
            }

            for entry in std::fs::read_dir(domain.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".deleted") || name.starts_with(".tmp_") {
                    std::fs::remove_file(entry.path())?;
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from the queue"
            );
        }

        Ok(())
    }

    fn domain_dir(&self, domain: &str) -> Result<PathBuf> {
        normalise_domain(domain)
            .filter(|normalised| normalised == domain)
            .map(|domain| self.path.join(domain))
            .ok_or_else(|| QueueError::InvalidDomain(domain.to_string()))
    }

    fn mail_paths(&self, mail: &MailReference) -> Result<(PathBuf, PathBuf)> {
        let dir = self.domain_dir(&mail.domain)?;
        Ok((
            dir.join(format!("{}.meta", mail.id)),
            dir.join(format!("{}.eml", mail.id)),
        ))
    }

    async fn read_metadata(path: &Path) -> Result<Metadata> {
        let bytes = fs::read(path).await?;
        let (metadata, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(metadata)
    }

    async fn has_mail(dir: &Path) -> Result<bool> {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry
                .file_name()
                .to_str()
                .and_then(MailId::from_filename)
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Queue for FileQueue {
    async fn domains(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut domains = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };

            if normalise_domain(&name).as_deref() == Some(name.as_str())
                && Self::has_mail(&entry.path()).await?
            {
                domains.push(name);
            }
        }

        domains.sort();
        Ok(domains)
    }

    async fn list(&self, domain: &str) -> Result<Vec<MailReference>> {
        let dir = self.domain_dir(domain)?;
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir).await?;
        let mut mails = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".meta") {
                continue;
            }
            let Some(id) = MailId::from_filename(&name) else {
                continue;
            };

            match Self::read_metadata(&entry.path()).await {
                Ok(metadata) => mails.push(MailReference {
                    id,
                    domain: domain.to_string(),
                    sender: metadata.sender,
                    recipients: metadata.recipients,
                }),
                Err(err) => {
                    internal!(level = WARN, "Skipping unreadable queue entry {id}: {err}");
                }
            }
        }

        mails.sort_by_key(|mail| mail.id);

        internal!(
            level = DEBUG,
            "Found {} queued mails for {domain}",
            mails.len()
        );

        Ok(mails)
    }

    async fn open(&self, mail: &MailReference) -> Result<OpenMail> {
        let (meta_path, data_path) = self.mail_paths(mail)?;

        let metadata = match Self::read_metadata(&meta_path).await {
            Err(QueueError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(mail.id));
            }
            other => other?,
        };
        let body = fs::File::open(&data_path).await?;

        Ok(OpenMail {
            sender: metadata.sender,
            recipients: metadata.recipients,
            body: Box::new(BufReader::new(body)),
        })
    }

    async fn delete(&self, mail: &MailReference) -> Result<()> {
        let (meta_path, data_path) = self.mail_paths(mail)?;

        let deleted_meta_path = meta_path.with_extension("meta.deleted");
        let deleted_data_path = data_path.with_extension("eml.deleted");

        // Metadata first: once it is gone the mail is no longer listed.
        match fs::rename(&meta_path, &deleted_meta_path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(mail.id));
            }
            other => other?,
        }
        fs::rename(&data_path, &deleted_data_path).await?;

        fs::remove_file(&deleted_meta_path).await?;
        fs::remove_file(&deleted_data_path).await?;

        internal!(level = DEBUG, "Deleted mail {} from the queue", mail.id);

        Ok(())
    }

    async fn enqueue(
        &self,
        domain: &str,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<MailReference> {
        let domain = normalise_domain(domain)
            .ok_or_else(|| QueueError::InvalidDomain(domain.to_string()))?;
        let recipients = dedup_recipients(recipients);
        if recipients.is_empty() {
            return Err(QueueError::NoRecipients);
        }

        let reference = MailReference {
            id: MailId::generate(),
            domain,
            sender: sender.to_string(),
            recipients,
        };

        let dir = self.domain_dir(&reference.domain)?;
        fs::create_dir_all(&dir).await?;

        let (meta_path, data_path) = self.mail_paths(&reference)?;
        let temp_meta_path = dir.join(format!(".tmp_{}.meta", reference.id));
        let temp_data_path = dir.join(format!(".tmp_{}.eml", reference.id));

        let metadata = bincode::serde::encode_to_vec(
            Metadata {
                sender: reference.sender.clone(),
                recipients: reference.recipients.clone(),
            },
            bincode::config::standard(),
        )?;

        fs::write(&temp_data_path, body).await?;
        fs::write(&temp_meta_path, &metadata).await?;

        fs::rename(&temp_data_path, &data_path).await?;
        fs::rename(&temp_meta_path, &meta_path).await?;

        internal!(
            level = DEBUG,
            "Queued mail {} for {}",
            reference.id,
            reference.domain
        );

        Ok(reference)
    }
}

/// Builder for [`FileQueue`] that validates the path.
#[derive(Debug, Default)]
pub struct FileQueueBuilder {
    path: Option<PathBuf>,
}

impl FileQueueBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// # Errors
    /// If the path fails validation.
    pub fn build(self) -> Result<FileQueue> {
        let path = self.path.unwrap_or_else(|| FileQueue::default().path);
        FileQueue::validate_path(&path)?;
        Ok(FileQueue { path })
    }
}
