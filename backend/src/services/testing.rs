//! In-test doubles for the catalog and storage seams.

use crate::error::{Error, Result};
use crate::models::{
    CollectionInput, CollectionRecord, Counters, ItemDescription, ItemSummary, MetricRecord,
    MetricsHistory, NewItem, WarmCollection,
};
use crate::services::catalog::{CatalogApi, CatalogItem, CollectionMetadata, ItemCounters};
use crate::services::storage::{SqliteStorage, Storage, StorageCounts};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub async fn memory_storage() -> SqliteStorage {
    let storage = SqliteStorage::connect("sqlite::memory:", 1).await.unwrap();
    storage.migrate().await.unwrap();
    storage
}

pub fn catalog_item(id: &str, title: &str, published_at: DateTime<Utc>) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        title: title.to_string(),
        published_at: published_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        description: String::new(),
        live: false,
    }
}

/// Pauses a call until the test releases it.
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    released: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Gate::default())
    }

    async fn pass(&self) {
        self.reached.notify_one();
        self.released.notified().await;
    }

    /// Resolves once a call is parked at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Scripted catalog. Items without scripted counters report all-zero
/// statistics.
#[derive(Default)]
pub struct FakeCatalog {
    uploads_id: Option<String>,
    listing: Mutex<Vec<CatalogItem>>,
    counters: Mutex<HashMap<String, Option<Counters>>>,
    durations: Mutex<HashMap<String, Option<i64>>>,
    listed_ids: Mutex<Vec<String>>,
    counter_calls: Mutex<Vec<Vec<String>>>,
    failing_counter_calls: AtomicUsize,
    list_gate: Mutex<Option<Arc<Gate>>>,
    duration_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn with_uploads(uploads_id: &str) -> Self {
        FakeCatalog {
            uploads_id: Some(uploads_id.to_string()),
            ..Default::default()
        }
    }

    pub fn set_listing(&self, items: Vec<CatalogItem>) {
        *self.listing.lock() = items;
    }

    pub fn set_counters(&self, id: &str, counters: Option<Counters>) {
        self.counters.lock().insert(id.to_string(), counters);
    }

    pub fn set_duration(&self, id: &str, duration_secs: Option<i64>) {
        self.durations.lock().insert(id.to_string(), duration_secs);
    }

    /// The next `n` counter requests fail upstream.
    pub fn fail_counter_calls(&self, n: usize) {
        self.failing_counter_calls.store(n, Ordering::SeqCst);
    }

    /// Parks every listing call at `gate` after it is recorded.
    pub fn gate_listing(&self, gate: Arc<Gate>) {
        *self.list_gate.lock() = Some(gate);
    }

    pub fn counter_calls(&self) -> Vec<Vec<String>> {
        self.counter_calls.lock().clone()
    }

    pub fn listed_ids(&self) -> Vec<String> {
        self.listed_ids.lock().clone()
    }

    pub fn duration_calls(&self) -> usize {
        self.duration_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    fn needs_uploads_id(&self) -> bool {
        self.uploads_id.is_some()
    }

    async fn list_items(&self, listing_id: &str, _max_results: u32) -> Result<Vec<CatalogItem>> {
        self.listed_ids.lock().push(listing_id.to_string());
        let gate = self.list_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(self.listing.lock().clone())
    }

    async fn get_counters(&self, item_ids: &[String]) -> Result<Vec<ItemCounters>> {
        self.counter_calls.lock().push(item_ids.to_vec());
        let fail = self
            .failing_counter_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::UpstreamResponse("quota exceeded".into()));
        }
        let counters = self.counters.lock();
        Ok(item_ids
            .iter()
            .map(|id| ItemCounters {
                id: id.clone(),
                statistics: counters.get(id).copied().unwrap_or(Some(Counters::default())),
            })
            .collect())
    }

    async fn get_item_duration(&self, item_id: &str) -> Result<Option<i64>> {
        self.duration_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.durations.lock().get(item_id).copied().flatten())
    }

    async fn get_collection_metadata(&self, collection_id: &str) -> Result<CollectionMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.uploads_id
            .clone()
            .map(|uploads_id| CollectionMetadata { uploads_id })
            .ok_or_else(|| Error::not_found("collection", collection_id))
    }
}

/// SQLite storage that counts calls per operation and can be told to fail.
pub struct CountingStorage {
    inner: SqliteStorage,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: AtomicBool,
    collections_gate: Mutex<Option<Arc<Gate>>>,
}

impl CountingStorage {
    pub async fn new() -> Self {
        CountingStorage {
            inner: memory_storage().await,
            calls: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            collections_gate: Mutex::new(None),
        }
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Parks every collections read at `gate` after the rows were read.
    pub fn gate_collections(&self, gate: Arc<Gate>) {
        *self.collections_gate.lock() = Some(gate);
    }

    fn hit(&self, operation: &'static str) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn enabled_collection_ids(&self) -> Result<HashSet<String>> {
        self.hit("enabled_collection_ids")?;
        self.inner.enabled_collection_ids().await
    }

    async fn collections_with_recent_items(&self, since: DateTime<Utc>) -> Result<Vec<WarmCollection>> {
        self.hit("collections_with_recent_items")?;
        self.inner.collections_with_recent_items(since).await
    }

    async fn upsert_item(&self, item: &NewItem) -> Result<()> {
        self.hit("upsert_item")?;
        self.inner.upsert_item(item).await
    }

    async fn update_item(&self, id: &str, title: &str, duration_secs: Option<i64>) -> Result<()> {
        self.hit("update_item")?;
        self.inner.update_item(id, title, duration_secs).await
    }

    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        self.hit("insert_metrics")?;
        self.inner.insert_metrics(records).await
    }

    async fn item_description(&self, id: &str) -> Result<ItemDescription> {
        self.hit("item_description")?;
        self.inner.item_description(id).await
    }

    async fn metrics_history(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<MetricsHistory> {
        self.hit("metrics_history")?;
        self.inner.metrics_history(id, from, to).await
    }

    async fn item_page(&self, collection_id: Option<&str>, offset: i64, limit: i64) -> Result<Vec<ItemSummary>> {
        self.hit("item_page")?;
        self.inner.item_page(collection_id, offset, limit).await
    }

    async fn collections(&self, only_enabled: bool) -> Result<Vec<CollectionRecord>> {
        self.hit("collections")?;
        let rows = self.inner.collections(only_enabled).await?;
        let gate = self.collections_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(rows)
    }

    async fn global_counts(&self) -> Result<StorageCounts> {
        self.hit("global_counts")?;
        self.inner.global_counts().await
    }

    async fn add_collection(&self, input: &CollectionInput) -> Result<()> {
        self.hit("add_collection")?;
        self.inner.add_collection(input).await
    }

    async fn update_collection(&self, id: &str, input: &CollectionInput) -> Result<()> {
        self.hit("update_collection")?;
        self.inner.update_collection(id, input).await
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        self.hit("delete_collection")?;
        self.inner.delete_collection(id).await
    }
}
