use anyhow::Result;
use chrono::Utc;
use native_db::{Builder, Database, Models};
use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::models::v1::DiaryEntryLocalKey;
use crate::models::{
    DiaryEntryLocal, SyncState, SyncWatermark, UserProfileLocal, SCHEMA_VERSION, WATERMARK_KEY,
};

static MODELS: Lazy<Models> = Lazy::new(|| {
    let mut models = Models::new();
    models
        .define::<DiaryEntryLocal>()
        .expect("diary entry model");
    models.define::<UserProfileLocal>().expect("profile model");
    models.define::<SyncWatermark>().expect("watermark model");
    models
});

/// Published after every committed mutation so a live feed query knows to
/// re-run. Coarse-grained on purpose: subscribers re-query, they do not diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    DiaryChanged,
    ProfileChanged,
}

/// Embedded cache holding the diary mirror, the profile mirror and the sync
/// watermark. All writes commit as a single transaction before any watcher
/// is notified, so readers never observe a half-merged feed.
pub struct LocalStore {
    db: Database<'static>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = Builder::new().create(&MODELS, path)?;
        Ok(Self::wrap(db))
    }

    pub fn in_memory() -> Result<Self> {
        let db = Builder::new().create_in_memory(&MODELS)?;
        Ok(Self::wrap(db))
    }

    fn wrap(db: Database<'static>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No live subscribers is the common case outside the UI.
        let _ = self.events.send(event);
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ===== PULL-SIDE RECONCILIATION =====

    /// Applies one pull batch atomically: diary upserts keyed by id with
    /// last-write-wins on `updated_at`, and a wholesale profile replacement.
    /// Either the whole batch commits or none of it does.
    pub fn apply_pull_batch(
        &self,
        entries: Vec<DiaryEntryLocal>,
        profile: Option<UserProfileLocal>,
    ) -> Result<()> {
        let diary_changed = !entries.is_empty();
        let profile_changed = profile.is_some();

        let rw = self.db.rw_transaction()?;

        for entry in entries {
            let existing: Option<DiaryEntryLocal> = rw.get().primary(entry.id.clone())?;
            if let Some(existing) = existing {
                if existing.updated_at > entry.updated_at {
                    continue;
                }
                rw.remove(existing)?;
            }
            rw.insert(entry)?;
        }

        if let Some(profile) = profile {
            let stale: Vec<UserProfileLocal> = rw
                .scan()
                .primary()?
                .all()?
                .collect::<Result<Vec<_>, _>>()?;
            for row in stale {
                rw.remove(row)?;
            }
            rw.insert(profile)?;
        }

        rw.commit()?;

        if diary_changed {
            self.notify(StoreEvent::DiaryChanged);
        }
        if profile_changed {
            self.notify(StoreEvent::ProfileChanged);
        }
        Ok(())
    }

    // ===== QUERIES =====

    /// The feed a diary screen subscribes to: entries for one calendar date
    /// in one class section. Rows staged for deletion are not shown.
    pub fn entries_for(&self, entry_date: &str, class_section_id: &str) -> Result<Vec<DiaryEntryLocal>> {
        let r = self.db.r_transaction()?;
        let mut entries: Vec<DiaryEntryLocal> = r
            .scan()
            .secondary(DiaryEntryLocalKey::entry_date)?
            .range(entry_date.to_string()..=entry_date.to_string())?
            .collect::<Result<Vec<_>, _>>()?;
        entries.retain(|e| {
            e.class_section_id == class_section_id && e.sync_state != SyncState::Deleted
        });
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    pub fn entry(&self, id: &str) -> Result<Option<DiaryEntryLocal>> {
        let r = self.db.r_transaction()?;
        Ok(r.get().primary(id.to_string())?)
    }

    pub fn profile(&self) -> Result<Option<UserProfileLocal>> {
        let r = self.db.r_transaction()?;
        let mut rows = r
            .scan()
            .primary::<UserProfileLocal>()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    pub fn diary_count(&self) -> Result<usize> {
        let r = self.db.r_transaction()?;
        let rows: Vec<DiaryEntryLocal> = r
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.len())
    }

    // ===== CHANGE TRACKING (PUSH SIDE) =====

    /// Stages a locally authored entry for push on the next sync.
    pub fn stage_create(&self, mut entry: DiaryEntryLocal) -> Result<()> {
        let now = Self::now_ms();
        entry.created_at = now;
        entry.updated_at = now;
        entry.sync_state = SyncState::Created;

        let rw = self.db.rw_transaction()?;
        rw.upsert(entry)?;
        rw.commit()?;
        self.notify(StoreEvent::DiaryChanged);
        Ok(())
    }

    /// Stages a local edit. An entry that was created locally and never
    /// pushed stays `Created`; anything else becomes `Updated`.
    pub fn stage_update(&self, mut entry: DiaryEntryLocal) -> Result<()> {
        let rw = self.db.rw_transaction()?;
        let existing: Option<DiaryEntryLocal> = rw.get().primary(entry.id.clone())?;
        entry.sync_state = match existing.as_ref().map(|e| e.sync_state) {
            Some(SyncState::Created) => SyncState::Created,
            _ => SyncState::Updated,
        };
        entry.updated_at = Self::now_ms();
        if let Some(existing) = existing {
            rw.remove(existing)?;
        }
        rw.insert(entry)?;
        rw.commit()?;
        self.notify(StoreEvent::DiaryChanged);
        Ok(())
    }

    /// Stages a deletion. A never-pushed local entry is dropped outright;
    /// a server-known entry is tombstoned until the delete call lands.
    pub fn stage_delete(&self, id: &str) -> Result<()> {
        let rw = self.db.rw_transaction()?;
        let existing: Option<DiaryEntryLocal> = rw.get().primary(id.to_string())?;
        match existing {
            None => return Ok(()),
            Some(entry) if entry.sync_state == SyncState::Created => {
                rw.remove(entry)?;
            }
            Some(mut entry) => {
                rw.remove(entry.clone())?;
                entry.sync_state = SyncState::Deleted;
                entry.updated_at = Self::now_ms();
                rw.insert(entry)?;
            }
        }
        rw.commit()?;
        self.notify(StoreEvent::DiaryChanged);
        Ok(())
    }

    /// Everything flagged since the last successful push, in staging order.
    pub fn pending_changes(&self) -> Result<Vec<DiaryEntryLocal>> {
        let r = self.db.r_transaction()?;
        let mut rows: Vec<DiaryEntryLocal> = r
            .scan()
            .primary()?
            .all()?
            .collect::<Result<Vec<_>, _>>()?;
        rows.retain(|e| e.sync_state != SyncState::Synced);
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(rows)
    }

    /// Acknowledges a pushed change: tombstones are removed, everything else
    /// settles back to `Synced`.
    pub fn mark_pushed(&self, id: &str) -> Result<()> {
        let rw = self.db.rw_transaction()?;
        let existing: Option<DiaryEntryLocal> = rw.get().primary(id.to_string())?;
        if let Some(entry) = existing {
            if entry.sync_state == SyncState::Deleted {
                rw.remove(entry)?;
            } else {
                let mut settled = entry.clone();
                settled.sync_state = SyncState::Synced;
                rw.remove(entry)?;
                rw.insert(settled)?;
            }
        }
        rw.commit()?;
        Ok(())
    }

    // ===== WATERMARK =====

    pub fn watermark(&self) -> Result<i64> {
        Ok(self.watermark_row()?.last_pulled_at)
    }

    pub fn watermark_row(&self) -> Result<SyncWatermark> {
        let r = self.db.r_transaction()?;
        let row: Option<SyncWatermark> = r.get().primary(WATERMARK_KEY.to_string())?;
        Ok(row.unwrap_or_default())
    }

    /// Monotonic advance: a stale or duplicate pull can never move the
    /// watermark backwards.
    pub fn advance_watermark(&self, pulled_at: i64) -> Result<()> {
        let mut row = self.watermark_row()?;
        row.last_pulled_at = row.last_pulled_at.max(pulled_at);
        row.schema_version = SCHEMA_VERSION;

        let rw = self.db.rw_transaction()?;
        rw.upsert(row)?;
        rw.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRole;

    fn entry(id: &str, date: &str, section: &str, updated_at: i64) -> DiaryEntryLocal {
        DiaryEntryLocal {
            id: id.to_string(),
            entry_date: date.to_string(),
            class_section_id: section.to_string(),
            content: format!("content for {}", id),
            created_at: updated_at,
            updated_at,
            ..Default::default()
        }
    }

    fn profile(id: &str) -> UserProfileLocal {
        UserProfileLocal {
            id: id.to_string(),
            email: Some(format!("{}@school.test", id)),
            first_name: None,
            last_name: None,
            display_name: None,
            role: UserRole::Student,
            photo_url: None,
            permissions: None,
            class_section_id: Some("cs-7a".to_string()),
        }
    }

    #[test]
    fn pull_merge_is_idempotent() {
        let store = LocalStore::in_memory().unwrap();
        let batch = vec![
            entry("d1", "2025-08-25", "cs-7a", 100),
            entry("d2", "2025-08-25", "cs-7a", 200),
        ];

        store
            .apply_pull_batch(batch.clone(), Some(profile("u1")))
            .unwrap();
        store.apply_pull_batch(batch, Some(profile("u1"))).unwrap();

        assert_eq!(store.diary_count().unwrap(), 2);
        let feed = store.entries_for("2025-08-25", "cs-7a").unwrap();
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn newer_cached_row_survives_stale_pull() {
        let store = LocalStore::in_memory().unwrap();
        let mut newer = entry("d1", "2025-08-25", "cs-7a", 500);
        newer.content = "newer".to_string();
        store.apply_pull_batch(vec![newer], None).unwrap();

        let mut stale = entry("d1", "2025-08-25", "cs-7a", 100);
        stale.content = "stale".to_string();
        store.apply_pull_batch(vec![stale], None).unwrap();

        let row = store.entry("d1").unwrap().unwrap();
        assert_eq!(row.content, "newer");
        assert_eq!(row.updated_at, 500);
    }

    #[test]
    fn feed_query_scopes_by_date_and_section() {
        let store = LocalStore::in_memory().unwrap();
        store
            .apply_pull_batch(
                vec![
                    entry("d1", "2025-08-25", "cs-7a", 100),
                    entry("d2", "2025-08-25", "cs-8b", 100),
                    entry("d3", "2025-08-26", "cs-7a", 100),
                ],
                None,
            )
            .unwrap();

        let feed = store.entries_for("2025-08-25", "cs-7a").unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id, "d1");
    }

    #[test]
    fn profile_is_replaced_wholesale() {
        let store = LocalStore::in_memory().unwrap();
        store
            .apply_pull_batch(Vec::new(), Some(profile("u1")))
            .unwrap();
        store
            .apply_pull_batch(Vec::new(), Some(profile("u2")))
            .unwrap();

        let current = store.profile().unwrap().unwrap();
        assert_eq!(current.id, "u2");
    }

    #[test]
    fn watermark_is_monotonic() {
        let store = LocalStore::in_memory().unwrap();
        assert_eq!(store.watermark().unwrap(), 0);

        store.advance_watermark(1000).unwrap();
        assert_eq!(store.watermark().unwrap(), 1000);

        store.advance_watermark(400).unwrap();
        assert_eq!(store.watermark().unwrap(), 1000);

        store.advance_watermark(2000).unwrap();
        assert_eq!(store.watermark().unwrap(), 2000);
    }

    #[test]
    fn change_tracking_lifecycle() {
        let store = LocalStore::in_memory().unwrap();

        store
            .stage_create(entry("local-1", "2025-08-25", "cs-7a", 0))
            .unwrap();
        let pending = store.pending_changes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_state, SyncState::Created);

        // Editing a never-pushed entry keeps it a create.
        let mut edited = pending.into_iter().next().unwrap();
        edited.content = "edited".to_string();
        store.stage_update(edited).unwrap();
        assert_eq!(
            store.pending_changes().unwrap()[0].sync_state,
            SyncState::Created
        );

        store.mark_pushed("local-1").unwrap();
        assert!(store.pending_changes().unwrap().is_empty());
        assert_eq!(
            store.entry("local-1").unwrap().unwrap().sync_state,
            SyncState::Synced
        );

        // Editing a synced entry stages an update.
        let mut synced = store.entry("local-1").unwrap().unwrap();
        synced.content = "edited again".to_string();
        store.stage_update(synced).unwrap();
        assert_eq!(
            store.pending_changes().unwrap()[0].sync_state,
            SyncState::Updated
        );

        // Deleting a server-known entry tombstones it and hides it from feeds.
        store.mark_pushed("local-1").unwrap();
        store.stage_delete("local-1").unwrap();
        assert_eq!(
            store.pending_changes().unwrap()[0].sync_state,
            SyncState::Deleted
        );
        assert!(store.entries_for("2025-08-25", "cs-7a").unwrap().is_empty());

        store.mark_pushed("local-1").unwrap();
        assert!(store.entry("local-1").unwrap().is_none());
    }

    #[test]
    fn deleting_a_never_pushed_entry_drops_it() {
        let store = LocalStore::in_memory().unwrap();
        store
            .stage_create(entry("local-2", "2025-08-25", "cs-7a", 0))
            .unwrap();
        store.stage_delete("local-2").unwrap();
        assert!(store.pending_changes().unwrap().is_empty());
        assert!(store.entry("local-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn watchers_are_notified_after_commit() {
        let store = LocalStore::in_memory().unwrap();
        let mut rx = store.subscribe();

        store
            .apply_pull_batch(
                vec![entry("d1", "2025-08-25", "cs-7a", 100)],
                Some(profile("u1")),
            )
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), StoreEvent::DiaryChanged);
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::ProfileChanged);
    }
}
