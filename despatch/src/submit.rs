//! Hand mail to the queue from outside the daemon.

use std::collections::BTreeMap;

use despatch_queue::{MailReference, Queue};

/// Queue `body` once per destination domain among `recipients`.
///
/// # Errors
///
/// Returns an error if a recipient has no domain part, or the queue refuses
/// the mail. Mail queued for earlier domains stays queued.
pub async fn submit(
    queue: &dyn Queue,
    sender: &str,
    recipients: &[String],
    body: &[u8],
) -> anyhow::Result<Vec<MailReference>> {
    let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for recipient in recipients {
        let Some((_, domain)) = recipient.rsplit_once('@').filter(|(local, domain)| {
            !local.is_empty() && !domain.is_empty()
        }) else {
            anyhow::bail!("Recipient {recipient:?} has no domain");
        };

        by_domain
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .push(recipient.clone());
    }

    let mut queued = Vec::with_capacity(by_domain.len());
    for (domain, recipients) in by_domain {
        queued.push(queue.enqueue(&domain, sender, &recipients, body).await?);
    }

    Ok(queued)
}
