use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::DiaryRemote;
use crate::models::{DiaryEntryLocal, SyncState, UserRole};
use crate::policy::best_effort;
use crate::store::LocalStore;

/// Critical-path sync failures. Push-phase per-record failures are not here
/// on purpose: they are best-effort and reported through [`SyncReport`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("diary pull failed: {0:#}")]
    Pull(#[source] anyhow::Error),
    #[error("profile fetch failed: {0:#}")]
    Profile(#[source] anyhow::Error),
    #[error("local store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// What one sync cycle did. `push_failures` is non-empty on degraded success;
/// the failed records stay staged and retry on the next cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub pulled: usize,
    pub pushed: usize,
    pub push_failures: Vec<(String, String)>,
    pub watermark: i64,
}

/// Orchestrates the pull-then-push cycle against the remote feed, keeping
/// the local cache and the sync watermark consistent.
pub struct SyncEngine {
    remote: Arc<dyn DiaryRemote>,
    store: Arc<LocalStore>,
    // One cycle at a time; concurrent callers queue here instead of relying
    // on caller discipline.
    cycle: Mutex<()>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn DiaryRemote>, store: Arc<LocalStore>) -> Self {
        Self {
            remote,
            store,
            cycle: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Runs one full synchronization cycle.
    ///
    /// Pull strictly precedes push, and the watermark advances only after
    /// both phases settle. A pull-phase failure leaves the cache and the
    /// watermark untouched, so the next attempt re-fetches the same window.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.cycle.lock().await;

        let since = self.store.watermark().map_err(SyncError::Store)?;
        debug!("sync cycle starting, watermark={}", since);

        // The profile is pulled unconditionally; its class section scopes the
        // diary feed for students (servers return an unscoped feed otherwise).
        let profile = self
            .remote
            .fetch_profile()
            .await
            .map_err(SyncError::Profile)?
            .into_local();

        let scope = match profile.role {
            UserRole::Student => profile.class_section_id.clone(),
            _ => None,
        };

        let records = self
            .remote
            .pull_entries_since(since, scope.as_deref())
            .await
            .map_err(SyncError::Pull)?;

        let entries: Vec<DiaryEntryLocal> =
            records.into_iter().map(|r| r.into_local()).collect();
        let pulled = entries.len();
        let feed_max = entries.iter().map(|e| e.updated_at).max();

        self.store
            .apply_pull_batch(entries, Some(profile))
            .map_err(SyncError::Store)?;

        let (pushed, push_failures) = self.push_pending().await?;

        // Watermark only moves once the whole cycle has settled; an empty
        // feed leaves it where it was.
        if let Some(ts) = feed_max {
            self.store.advance_watermark(ts).map_err(SyncError::Store)?;
        }
        let watermark = self.store.watermark().map_err(SyncError::Store)?;

        info!(
            "sync cycle done: pulled={} pushed={} failures={} watermark={}",
            pulled,
            pushed,
            push_failures.len(),
            watermark
        );

        Ok(SyncReport {
            pulled,
            pushed,
            push_failures,
            watermark,
        })
    }

    /// Push phase: one independent call per staged record. A failing record
    /// never blocks the others; it stays staged for the next cycle.
    async fn push_pending(&self) -> Result<(usize, Vec<(String, String)>), SyncError> {
        let pending = self.store.pending_changes().map_err(SyncError::Store)?;

        let mut pushed = 0;
        let mut failures = Vec::new();

        for change in pending {
            let id = change.id.clone();
            let result = match change.sync_state {
                SyncState::Created => self.remote.create_entry(&change).await,
                SyncState::Updated => self.remote.update_entry(&change).await,
                SyncState::Deleted => self.remote.delete_entry(&id).await,
                SyncState::Synced => continue,
            };

            let label = format!("push diary entry {}", id);
            match best_effort(&label, result) {
                Ok(()) => {
                    self.store.mark_pushed(&id).map_err(SyncError::Store)?;
                    pushed += 1;
                }
                Err(msg) => {
                    failures.push((id, msg));
                }
            }
        }

        Ok((pushed, failures))
    }
}
