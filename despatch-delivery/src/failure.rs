//! Durable retry bookkeeping for mail that failed delivery.
//!
//! Persisted as a JSON object keyed by mail id:
//!
//! ```json
//! { "01ARZ3NDEKTSV4RRFFQ69G5FAV": { "FirstFailure": "2024-05-01T10:00:00Z", "Retries": 2 } }
//! ```
//!
//! The file is replaced atomically on save. An absent file is an empty store,
//! and saving an empty store removes the file.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use despatch_common::internal;
use despatch_queue::MailId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::retry;

#[derive(Debug, Error)]
pub enum FailureStoreError {
    #[error("I/O error on failure store {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Malformed failure store {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailureRecord {
    pub first_failure: DateTime<Utc>,
    pub retries: u32,
}

impl FailureRecord {
    #[must_use]
    pub const fn new(first_failure: DateTime<Utc>) -> Self {
        Self {
            first_failure,
            retries: 0,
        }
    }
}

/// Decision after a mail failed on every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Keep the mail queued; the record now holds `retries`.
    Retry { retries: u32 },
    /// The schedule is exhausted; the mail should be dropped.
    GiveUp,
}

/// Map from mail id to its [`FailureRecord`].
///
/// Owned by the scheduler and lent to whatever is delivering, so there is
/// exactly one writer.
#[derive(Debug, Default)]
pub struct FailureStore {
    path: Option<PathBuf>,
    records: BTreeMap<MailId, FailureRecord>,
}

impl FailureStore {
    /// A store that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store backed by `path`. A missing file yields an empty store.
    ///
    /// # Errors
    /// If the file exists but cannot be read or does not parse.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, FailureStoreError> {
        let path = path.into();

        let records: BTreeMap<MailId, FailureRecord> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                FailureStoreError::Json {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(FailureStoreError::Io { path, source }),
        };

        internal!(
            level = DEBUG,
            "Loaded {} failure records from {}",
            records.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            records,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn get(&self, id: &MailId) -> Option<&FailureRecord> {
        self.records.get(id)
    }

    pub fn insert(&mut self, id: MailId, record: FailureRecord) {
        self.records.insert(id, record);
    }

    pub fn remove(&mut self, id: &MailId) -> Option<FailureRecord> {
        self.records.remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `id` is due for another attempt at `now`.
    ///
    /// Mail without a record is always ready. Otherwise the time since the
    /// first failure must have reached the delay for the recorded retry count.
    /// A first failure in the future counts as no time elapsed.
    #[must_use]
    pub fn is_ready_to_send(&self, id: &MailId, now: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get(id) else {
            return true;
        };

        let lag = (now - record.first_failure)
            .to_std()
            .unwrap_or(Duration::ZERO);

        retry::delay(record.retries).is_none_or(|delay| lag >= delay)
    }

    /// Record another failed attempt for `id`, creating the record if needed.
    ///
    /// Returns [`Redelivery::GiveUp`] without touching the record once the
    /// schedule is exhausted; the caller drops both the mail and the record.
    pub fn should_attempt_redelivery(&mut self, id: &MailId, now: DateTime<Utc>) -> Redelivery {
        let record = self
            .records
            .entry(*id)
            .or_insert_with(|| FailureRecord::new(now));

        if retry::is_exhausted(record.retries) {
            return Redelivery::GiveUp;
        }

        record.retries += 1;
        Redelivery::Retry {
            retries: record.retries,
        }
    }

    /// Write the store back to its file, or remove the file if the store is
    /// empty. In-memory stores are a no-op.
    ///
    /// # Errors
    /// If writing, renaming or removing the file fails.
    pub async fn save(&self) -> Result<(), FailureStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_error = |source: io::Error| FailureStoreError::Io {
            path: path.clone(),
            source,
        };

        if self.records.is_empty() {
            return match fs::remove_file(path).await {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(err)),
                _ => Ok(()),
            };
        }

        let json = serde_json::to_vec_pretty(&self.records).map_err(|source| {
            FailureStoreError::Json {
                path: path.clone(),
                source,
            }
        })?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let temp = path.with_extension("json.tmp");
        fs::write(&temp, &json).await.map_err(io_error)?;
        fs::rename(&temp, path).await.map_err(io_error)?;

        internal!(
            level = DEBUG,
            "Saved {} failure records to {}",
            self.records.len(),
            path.display()
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    #[test]
    fn test_unknown_mail_is_ready() {
        let store = FailureStore::in_memory();
        assert!(store.is_ready_to_send(&MailId::generate(), at(0)));
    }

    #[test]
    fn test_readiness_uses_cumulative_delay() {
        let mut store = FailureStore::in_memory();
        let id = MailId::generate();
        store.insert(
            id,
            FailureRecord {
                first_failure: at(0),
                retries: 2,
            },
        );

        assert!(!store.is_ready_to_send(&id, at(29)));
        assert!(store.is_ready_to_send(&id, at(30)));
        assert!(store.is_ready_to_send(&id, at(31)));
    }

    #[test]
    fn test_clock_skew_is_not_ready() {
        let mut store = FailureStore::in_memory();
        let id = MailId::generate();
        store.insert(
            id,
            FailureRecord {
                first_failure: at(10),
                retries: 1,
            },
        );

        assert!(!store.is_ready_to_send(&id, at(0)));
    }

    #[test]
    fn test_first_failure_creates_record() {
        let mut store = FailureStore::in_memory();
        let id = MailId::generate();

        assert_eq!(
            store.should_attempt_redelivery(&id, at(0)),
            Redelivery::Retry { retries: 1 }
        );
        assert_eq!(
            store.get(&id),
            Some(&FailureRecord {
                first_failure: at(0),
                retries: 1
            })
        );

        // The first failure time is kept on later failures.
        store.should_attempt_redelivery(&id, at(60));
        assert_eq!(store.get(&id).map(|r| r.first_failure), Some(at(0)));
        assert_eq!(store.get(&id).map(|r| r.retries), Some(2));
    }

    #[test]
    fn test_gives_up_at_last_retry() {
        let mut store = FailureStore::in_memory();
        let id = MailId::generate();
        store.insert(
            id,
            FailureRecord {
                first_failure: at(0),
                retries: 10,
            },
        );

        assert_eq!(
            store.should_attempt_redelivery(&id, at(0)),
            Redelivery::Retry { retries: 11 }
        );
        assert_eq!(store.should_attempt_redelivery(&id, at(0)), Redelivery::GiveUp);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");

        let mut store = FailureStore::load(&path).await.unwrap();
        assert!(store.is_empty());

        for (minutes, retries) in [(0, 1), (5, 4), (90, 11)] {
            store.insert(
                MailId::generate(),
                FailureRecord {
                    first_failure: at(minutes),
                    retries,
                },
            );
        }
        store.save().await.unwrap();

        let reloaded = FailureStore::load(&path).await.unwrap();
        assert_eq!(reloaded.records, store.records);
    }

    #[tokio::test]
    async fn test_persisted_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");
        let id: MailId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();

        let mut store = FailureStore::load(&path).await.unwrap();
        store.insert(
            id,
            FailureRecord {
                first_failure: at(0),
                retries: 3,
            },
        );
        store.save().await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "01ARZ3NDEKTSV4RRFFQ69G5FAV": {
                    "FirstFailure": "2023-11-14T22:13:20Z",
                    "Retries": 3
                }
            })
        );
    }

    #[tokio::test]
    async fn test_empty_store_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");

        let mut store = FailureStore::load(&path).await.unwrap();
        let id = MailId::generate();
        store.insert(id, FailureRecord::new(at(0)));
        store.save().await.unwrap();
        assert!(path.exists());

        store.remove(&id);
        store.save().await.unwrap();
        assert!(!path.exists());

        // Saving again with nothing on disk is fine.
        store.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            FailureStore::load(&path).await,
            Err(FailureStoreError::Json { .. })
        ));
    }
}
