//! In-memory set of tracked collections and their items.
//!
//! Two independent locks: one over the collection map, one per collection
//! over its item map. Callers take a snapshot of `Arc` handles under the
//! collection-map lock, release it, and only then lock a single collection.
//! Neither lock is ever held across an `.await`.
//!
//! Removal is always two-phase: an entry is first flagged deleted and only
//! dropped by a later pass once the grace window has elapsed, so tasks that
//! still hold a handle never observe it vanishing mid-pass.

use crate::models::{Counters, WarmCollection};
use crate::utils::is_older_than;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedItem {
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub duration_secs: Option<i64>,
    pub counters: Counters,
    /// Last time a metric point was persisted for this item.
    pub time_count: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub time_deleted: Option<DateTime<Utc>>,
}

impl TrackedItem {
    pub fn new(published_at: DateTime<Utc>, title: impl Into<String>) -> Self {
        TrackedItem {
            published_at,
            title: title.into(),
            duration_secs: None,
            counters: Counters::default(),
            time_count: None,
            deleted: false,
            time_deleted: None,
        }
    }

    pub fn with_duration(mut self, duration_secs: Option<i64>) -> Self {
        self.duration_secs = duration_secs;
        self
    }
}

/// Outcome of one elapsed-check pass over a collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedReport {
    pub total: usize,
    pub stopped: usize,
    pub removed: usize,
}

pub struct TrackedCollection {
    id: String,
    items: Mutex<HashMap<String, TrackedItem>>,
    uploads_id: Mutex<Option<String>>,
}

impl TrackedCollection {
    fn new(id: &str) -> Self {
        TrackedCollection {
            id: id.to_string(),
            items: Mutex::new(HashMap::new()),
            uploads_id: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Upstream listing id resolved from collection metadata, if any.
    pub fn uploads_id(&self) -> Option<String> {
        self.uploads_id.lock().clone()
    }

    pub fn set_uploads_id(&self, uploads_id: String) {
        *self.uploads_id.lock() = Some(uploads_id);
    }

    pub fn append(&self, id: &str, item: TrackedItem) {
        self.items.lock().insert(id.to_string(), item);
    }

    pub fn delete(&self, id: &str) {
        self.items.lock().remove(id);
    }

    pub fn set_deleted(&self, id: &str, now: DateTime<Utc>) -> bool {
        match self.items.lock().get_mut(id) {
            Some(item) => {
                item.deleted = true;
                item.time_deleted = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn cancel_deleted(&self, id: &str) -> bool {
        match self.items.lock().get_mut(id) {
            Some(item) => {
                item.deleted = false;
                item.time_deleted = None;
                true
            }
            None => false,
        }
    }

    pub fn item(&self, id: &str) -> Option<TrackedItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Copies of all items not flagged deleted, sorted by id.
    pub fn requestable_items(&self) -> Vec<(String, TrackedItem)> {
        let mut items: Vec<(String, TrackedItem)> = self
            .items
            .lock()
            .iter()
            .filter(|(_, item)| !item.deleted)
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    /// Corrects the mutable description fields of a known item.
    pub fn update_details(&self, id: &str, title: &str, duration_secs: Option<i64>) {
        if let Some(item) = self.items.lock().get_mut(id) {
            item.title = title.to_string();
            if duration_secs.is_some() {
                item.duration_secs = duration_secs;
            }
        }
    }

    /// Records counters that were just persisted.
    pub fn record_metrics(&self, id: &str, counters: Counters, now: DateTime<Utc>) {
        if let Some(item) = self.items.lock().get_mut(id) {
            item.counters = counters;
            item.time_count = Some(now);
        }
    }

    /// Ages every item against the collection window: live items past the
    /// window are flagged deleted, flagged items past the grace window are
    /// removed.
    pub fn check_elapsed(
        &self,
        now: DateTime<Utc>,
        collection_window: Duration,
        grace: Duration,
    ) -> ElapsedReport {
        let mut items = self.items.lock();
        let mut report = ElapsedReport {
            total: items.len(),
            ..Default::default()
        };

        items.retain(|id, item| {
            if item.deleted {
                report.stopped += 1;
                let expired = item
                    .time_deleted
                    .map(|at| is_older_than(at, now, grace))
                    .unwrap_or(true);
                if expired {
                    log::info!("col: {}, item: {id}, stop processing", self.id);
                    report.removed += 1;
                    return false;
                }
            } else if is_older_than(item.published_at, now, collection_window) {
                item.deleted = true;
                item.time_deleted = Some(now);
                log::info!("col: {}, item: {id}, set stop processing", self.id);
            }
            true
        });

        report
    }

    fn snapshot(&self) -> Vec<(String, TrackedItem)> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .iter()
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }
}

struct CollectionEntry {
    handle: Arc<TrackedCollection>,
    deleted: bool,
    time_deleted: Option<DateTime<Utc>>,
}

impl CollectionEntry {
    fn new(id: &str) -> Self {
        CollectionEntry {
            handle: Arc::new(TrackedCollection::new(id)),
            deleted: false,
            time_deleted: None,
        }
    }
}

/// Outcome of reconciling the registry with the enabled set from storage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub appended: Vec<String>,
    pub flagged: Vec<String>,
    pub restored: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub id: String,
    pub deleted: bool,
    pub time_deleted: Option<DateTime<Utc>>,
    pub uploads_id: Option<String>,
    pub items: Vec<ItemStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStatus {
    pub id: String,
    #[serde(flatten)]
    pub item: TrackedItem,
}

#[derive(Default)]
pub struct Registry {
    collections: Mutex<HashMap<String, CollectionEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the registry from the storage snapshot taken at startup.
    pub fn warm(&self, snapshot: Vec<WarmCollection>) {
        let mut collections = self.collections.lock();
        for warm in snapshot {
            let entry = collections
                .entry(warm.id.clone())
                .or_insert_with(|| CollectionEntry::new(&warm.id));
            for item in warm.items {
                entry.handle.append(
                    &item.id,
                    TrackedItem::new(item.published_at, item.title).with_duration(item.duration_secs),
                );
            }
        }
    }

    pub fn append(&self, id: &str) {
        self.collections
            .lock()
            .insert(id.to_string(), CollectionEntry::new(id));
    }

    pub fn delete(&self, id: &str) {
        self.collections.lock().remove(id);
    }

    pub fn set_deleted(&self, id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.collections.lock().get_mut(id) {
            entry.deleted = true;
            entry.time_deleted = Some(now);
        }
    }

    pub fn cancel_deleted(&self, id: &str) {
        if let Some(entry) = self.collections.lock().get_mut(id) {
            entry.deleted = false;
            entry.time_deleted = None;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedCollection>> {
        self.collections.lock().get(id).map(|e| e.handle.clone())
    }

    pub fn is_deleted(&self, id: &str) -> Option<bool> {
        self.collections.lock().get(id).map(|e| e.deleted)
    }

    pub fn len(&self) -> usize {
        self.collections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.lock().is_empty()
    }

    /// Handles of every collection not flagged deleted, sorted by id.
    pub fn requestable(&self) -> Vec<Arc<TrackedCollection>> {
        let mut handles: Vec<_> = self
            .collections
            .lock()
            .values()
            .filter(|e| !e.deleted)
            .map(|e| e.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Three-way diff against the authoritative enabled set.
    ///
    /// Missing ids are flagged first and dropped once the grace window has
    /// passed; ids that come back within the window keep their items. An id
    /// that comes back after the window starts over with an empty item set.
    pub fn reconcile(
        &self,
        enabled: &HashSet<String>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut collections = self.collections.lock();

        collections.retain(|id, entry| {
            let grace_elapsed = entry
                .time_deleted
                .map(|at| is_older_than(at, now, grace))
                .unwrap_or(false);

            if !enabled.contains(id) {
                if !entry.deleted {
                    entry.deleted = true;
                    entry.time_deleted = Some(now);
                    report.flagged.push(id.clone());
                } else if grace_elapsed {
                    report.removed.push(id.clone());
                    return false;
                }
            } else if entry.deleted {
                if grace_elapsed {
                    report.removed.push(id.clone());
                    return false;
                }
                entry.deleted = false;
                entry.time_deleted = None;
                report.restored.push(id.clone());
            }
            true
        });

        for id in enabled {
            if !collections.contains_key(id) {
                collections.insert(id.clone(), CollectionEntry::new(id));
                report.appended.push(id.clone());
            }
        }

        report.appended.sort();
        report.flagged.sort();
        report.restored.sort();
        report.removed.sort();
        report
    }

    /// Diagnostic dump of every collection and item.
    pub fn status(&self) -> Vec<CollectionStatus> {
        let entries: Vec<(Arc<TrackedCollection>, bool, Option<DateTime<Utc>>)> = self
            .collections
            .lock()
            .values()
            .map(|e| (e.handle.clone(), e.deleted, e.time_deleted))
            .collect();

        let mut status: Vec<CollectionStatus> = entries
            .into_iter()
            .map(|(handle, deleted, time_deleted)| CollectionStatus {
                id: handle.id.clone(),
                deleted,
                time_deleted,
                uploads_id: handle.uploads_id(),
                items: handle
                    .snapshot()
                    .into_iter()
                    .map(|(id, item)| ItemStatus { id, item })
                    .collect(),
            })
            .collect();
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WarmItem;
    use chrono::TimeZone;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86400);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reconcile_appends_new_and_flags_missing() {
        let registry = Registry::new();
        registry.append("A");

        let report = registry.reconcile(&ids(&["B"]), t0(), DAY);
        assert_eq!(report.appended, vec!["B".to_string()]);
        assert_eq!(report.flagged, vec!["A".to_string()]);
        assert_eq!(registry.is_deleted("A"), Some(true));

        let requestable: Vec<_> = registry
            .requestable()
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(requestable, vec!["B".to_string()]);
    }

    #[test]
    fn flapping_within_grace_keeps_items() {
        let registry = Registry::new();
        registry.append("A");
        registry
            .get("A")
            .unwrap()
            .append("v1", TrackedItem::new(t0(), "first"));

        registry.reconcile(&ids(&[]), t0(), DAY);
        assert_eq!(registry.is_deleted("A"), Some(true));

        let report = registry.reconcile(&ids(&["A"]), t0() + chrono::Duration::hours(2), DAY);
        assert_eq!(report.restored, vec!["A".to_string()]);
        assert!(report.appended.is_empty());
        assert_eq!(registry.is_deleted("A"), Some(false));
        assert!(registry.get("A").unwrap().contains("v1"));
    }

    #[test]
    fn readded_after_grace_starts_empty() {
        let registry = Registry::new();
        registry.append("A");
        registry
            .get("A")
            .unwrap()
            .append("v1", TrackedItem::new(t0(), "first"));

        registry.reconcile(&ids(&[]), t0(), DAY);
        let later = t0() + chrono::Duration::hours(25);
        let report = registry.reconcile(&ids(&["A"]), later, DAY);

        assert_eq!(report.removed, vec!["A".to_string()]);
        assert_eq!(report.appended, vec!["A".to_string()]);
        let fresh = registry.get("A").unwrap();
        assert!(fresh.is_empty());
        assert_eq!(registry.is_deleted("A"), Some(false));
    }

    #[test]
    fn missing_after_grace_is_removed() {
        let registry = Registry::new();
        registry.append("A");
        registry.reconcile(&ids(&["B"]), t0(), DAY);

        let report = registry.reconcile(&ids(&["B"]), t0() + chrono::Duration::hours(1), DAY);
        assert!(report.removed.is_empty());
        assert!(registry.get("A").is_some());

        let report = registry.reconcile(&ids(&["B"]), t0() + chrono::Duration::hours(25), DAY);
        assert_eq!(report.removed, vec!["A".to_string()]);
        assert!(registry.get("A").is_none());
    }

    #[test]
    fn held_handle_survives_hard_removal() {
        let registry = Registry::new();
        registry.append("A");
        let handle = registry.get("A").unwrap();
        registry.delete("A");

        handle.append("v1", TrackedItem::new(t0(), "still usable"));
        assert!(handle.contains("v1"));
        assert!(registry.get("A").is_none());
    }

    #[test]
    fn elapsed_check_flags_then_reaps() {
        let collection = TrackedCollection::new("A");
        let now = t0();
        collection.append("old", TrackedItem::new(now - chrono::Duration::days(15), "old"));
        collection.append("new", TrackedItem::new(now - chrono::Duration::hours(1), "new"));

        let window = 14 * DAY;
        let report = collection.check_elapsed(now, window, DAY);
        assert_eq!(report, ElapsedReport { total: 2, stopped: 0, removed: 0 });
        assert!(collection.item("old").unwrap().deleted);
        let live: Vec<_> = collection.requestable_items().into_iter().map(|(id, _)| id).collect();
        assert_eq!(live, vec!["new".to_string()]);

        let report = collection.check_elapsed(now + chrono::Duration::hours(2), window, DAY);
        assert_eq!(report.removed, 0);
        assert!(collection.contains("old"));

        let report = collection.check_elapsed(now + chrono::Duration::hours(25), window, DAY);
        assert_eq!(report.removed, 1);
        assert!(!collection.contains("old"));
        assert!(collection.contains("new"));
    }

    #[test]
    fn cancelled_item_is_requestable_again() {
        let collection = TrackedCollection::new("A");
        collection.append("v1", TrackedItem::new(t0(), "v"));

        assert!(collection.set_deleted("v1", t0()));
        assert!(collection.requestable_items().is_empty());

        assert!(collection.cancel_deleted("v1"));
        let item = collection.item("v1").unwrap();
        assert!(!item.deleted);
        assert_eq!(item.time_deleted, None);
        assert_eq!(collection.requestable_items().len(), 1);

        let report = collection.check_elapsed(t0() + 2 * DAY, 14 * DAY, DAY);
        assert_eq!(report.removed, 0);
        assert!(!collection.cancel_deleted("missing"));
    }

    #[test]
    fn record_metrics_updates_bookkeeping() {
        let collection = TrackedCollection::new("A");
        collection.append("v1", TrackedItem::new(t0(), "v"));
        let counters = Counters { view: 10, ..Default::default() };
        collection.record_metrics("v1", counters, t0() + HOUR);

        let item = collection.item("v1").unwrap();
        assert_eq!(item.counters, counters);
        assert_eq!(item.time_count, Some(t0() + HOUR));
    }

    #[test]
    fn warm_seeds_collections_and_items() {
        let registry = Registry::new();
        registry.warm(vec![
            WarmCollection {
                id: "A".into(),
                items: vec![WarmItem {
                    id: "v1".into(),
                    published_at: t0(),
                    title: "t".into(),
                    duration_secs: Some(60),
                }],
            },
            WarmCollection { id: "B".into(), items: vec![] },
        ]);

        assert_eq!(registry.len(), 2);
        let item = registry.get("A").unwrap().item("v1").unwrap();
        assert_eq!(item.duration_secs, Some(60));
        assert!(registry.get("B").unwrap().is_empty());

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].items.len(), 1);
    }
}
