use serde::{Deserialize, Serialize};

/// Identifier for a queued mail.
///
/// A ULID, so ids sort by the time the mail was queued. The textual form is
/// also used as the on-disk file stem and as the key of the failure store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailId {
    id: ulid::Ulid,
}

impl MailId {
    /// Parse an id from a queue filename like `01ARZ3NDEKTSV4RRFFQ69G5FAV.meta`.
    ///
    /// Anything containing path separators, or whose stem is not a valid
    /// ULID, is rejected.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename
            .strip_suffix(".meta")
            .or_else(|| filename.strip_suffix(".eml"))?;

        stem.parse().ok()
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }
}

impl std::str::FromStr for MailId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl std::fmt::Display for MailId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Serialize for MailId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for MailId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Handle to one queued outbound mail.
///
/// The delivery engine never mutates a reference; it only asks the queue to
/// open or delete the mail it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailReference {
    pub id: MailId,
    /// Destination domain this mail is queued under.
    pub domain: String,
    pub sender: String,
    /// Recipients in the order they were given, without duplicates.
    pub recipients: Vec<String>,
}

/// Lowercase and check that `domain` is usable as a queue partition name.
pub(crate) fn normalise_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '[' | ']' | ':'));

    valid.then_some(domain)
}

/// Remove duplicate recipients, keeping the first occurrence.
pub(crate) fn dedup_recipients(recipients: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .iter()
        .filter(|r| seen.insert(r.to_ascii_lowercase()))
        .cloned()
        .collect()
}
