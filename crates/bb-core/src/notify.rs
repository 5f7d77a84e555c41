//! Notification de-duplication.
//!
//! Unsyncable records are fingerprinted by their reason set; the notify
//! cache remembers the last emitted fingerprint per repo-key so an
//! unchanged verdict is announced at most once. Delivery is behind a
//! trait; failures are recorded in the cache and surfaced by `doctor`,
//! never retried synchronously.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::Duration;
use tracing::warn;

use bb_state::StateStore;
use bb_types::{Config, DeliveryFailure, NotifyCache, NotifyEntry, Reason, RepoRecord};

use crate::clock::Clock;

/// Sorted, `+`-joined reason list; the de-dup identity of a verdict.
pub fn fingerprint(reasons: &BTreeSet<Reason>) -> String {
    reasons
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

/// Delivery backend for unsyncable-repo notifications.
pub trait NotifySink {
    fn backend(&self) -> &str;
    fn deliver(&self, record: &RepoRecord, fingerprint: &str) -> Result<()>;
}

/// Fallback sink: the notification is a structured log line.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotifySink for LogSink {
    fn backend(&self) -> &str {
        "log"
    }

    fn deliver(&self, record: &RepoRecord, fingerprint: &str) -> Result<()> {
        warn!(
            repo_key = %record.repo_key,
            path = %record.path.display(),
            reasons = %fingerprint,
            "repository is not syncable"
        );
        Ok(())
    }
}

/// Outcome counts for one notification pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub emitted: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// Emit notifications for the final record set and persist the cache.
pub fn notify_unsyncable(
    store: &StateStore,
    config: &Config,
    records: &[RepoRecord],
    clock: &Clock,
    sink: &dyn NotifySink,
) -> Result<NotifySummary> {
    let mut cache = store.load_notify_cache()?;
    let mut summary = NotifySummary::default();
    let now = clock.now();

    for record in records.iter().filter(|r| !r.syncable) {
        let fp = fingerprint(&record.unsyncable_reasons);
        let emit = match cache.sent.get(&record.repo_key) {
            Some(entry) if entry.fingerprint == fp => {
                if config.notify.dedupe {
                    false
                } else if config.notify.throttle_minutes > 0 {
                    now - entry.sent_at
                        >= Duration::minutes(config.notify.throttle_minutes as i64)
                } else {
                    true
                }
            }
            _ => true,
        };

        if emit {
            if let Err(err) = sink.deliver(record, &fp) {
                summary.failed += 1;
                cache.delivery_failures.insert(
                    NotifyCache::failure_key(sink.backend(), &record.repo_key),
                    DeliveryFailure {
                        backend: sink.backend().to_string(),
                        repo_key: record.repo_key.clone(),
                        message: err.to_string(),
                        failed_at: now,
                    },
                );
            } else {
                summary.emitted += 1;
            }
        } else {
            summary.suppressed += 1;
        }

        // sent_at always advances, emitted or not.
        cache.sent.insert(
            record.repo_key.clone(),
            NotifyEntry {
                fingerprint: fp,
                sent_at: now,
            },
        );
    }

    store.store_notify_cache(&cache)?;
    Ok(summary)
}
