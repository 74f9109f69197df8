//! Freshness-gated caches in front of storage for the read API.
//!
//! Every entry carries the time it was last refreshed from storage and is
//! served while fresh. Item entries additionally freeze: once the item is
//! past the collection window its metrics no longer change, so a cached
//! facet is served forever. moka only bounds capacity; freshness is decided
//! here against an explicit `now`.

use crate::error::{Error, Result};
use crate::models::{
    CollectionsResponse, GlobalCounts, ItemDescription, ItemSummary, MetricsHistory,
};
use crate::services::storage::Storage;
use crate::utils::{is_older_than, is_within};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use moka::sync::Cache as MokaCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Freshness of item description and metrics facets.
    pub period_meter_cache: Duration,
    /// Items published longer ago than this are frozen.
    pub period_collection_cache: Duration,
    /// Freshness of item pages and global counts.
    pub period_video_cache: Duration,
    pub period_collection_list_cache: Duration,
    pub item_capacity: u64,
    pub page_capacity: u64,
    pub max_view_items: i64,
    pub listen_admin: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            period_meter_cache: Duration::from_secs(60),
            period_collection_cache: Duration::from_secs(14 * 24 * 3600),
            period_video_cache: Duration::from_secs(60),
            period_collection_list_cache: Duration::from_secs(60),
            item_capacity: 1000,
            page_capacity: 1000,
            max_view_items: 30,
            listen_admin: false,
        }
    }
}

struct Facet<T> {
    value: Arc<T>,
    refreshed_at: DateTime<Utc>,
}

impl<T> Facet<T> {
    fn new(value: Arc<T>, refreshed_at: DateTime<Utc>) -> Self {
        Facet {
            value,
            refreshed_at,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_within(self.refreshed_at, now, ttl)
    }
}

impl<T> Clone for Facet<T> {
    fn clone(&self) -> Self {
        Facet {
            value: self.value.clone(),
            refreshed_at: self.refreshed_at,
        }
    }
}

/// Description and metrics refresh independently.
#[derive(Default)]
struct ItemEntry {
    published_at: Option<DateTime<Utc>>,
    description: Option<Facet<ItemDescription>>,
    metrics: Option<Facet<MetricsHistory>>,
}

type PageKey = (String, i64);

/// The enabled-collections singleton. `generation` moves on every admin
/// change so a refresh that started before it cannot store its result.
#[derive(Default)]
struct CollectionsSlot {
    facet: Option<Facet<CollectionsResponse>>,
    generation: u64,
}

pub struct ReadCache {
    storage: Arc<dyn Storage>,
    settings: CacheSettings,
    items: MokaCache<String, Arc<Mutex<ItemEntry>>>,
    pages: MokaCache<PageKey, Facet<Vec<ItemSummary>>>,
    collections: Mutex<CollectionsSlot>,
    counts: Mutex<Option<Facet<GlobalCounts>>>,
}

impl ReadCache {
    pub fn new(storage: Arc<dyn Storage>, settings: CacheSettings) -> Self {
        ReadCache {
            items: MokaCache::builder()
                .max_capacity(settings.item_capacity)
                .build(),
            pages: MokaCache::builder()
                .max_capacity(settings.page_capacity)
                .build(),
            collections: Mutex::new(CollectionsSlot::default()),
            counts: Mutex::new(None),
            storage,
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn servable<T>(&self, facet: &Facet<T>, published_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let frozen = published_at
            .map(|published_at| is_older_than(published_at, now, self.settings.period_collection_cache))
            .unwrap_or(false);
        frozen || facet.is_fresh(now, self.settings.period_meter_cache)
    }

    fn item_entry(&self, id: &str) -> Arc<Mutex<ItemEntry>> {
        self.items
            .get_with(id.to_string(), || Arc::new(Mutex::new(ItemEntry::default())))
    }

    pub async fn item_description(&self, id: &str, now: DateTime<Utc>) -> Result<Arc<ItemDescription>> {
        if !self.settings.enabled {
            return Ok(Arc::new(self.storage.item_description(id).await?));
        }

        if let Some(entry) = self.items.get(id) {
            let entry = entry.lock();
            if let Some(facet) = &entry.description {
                if self.servable(facet, entry.published_at, now) {
                    debug!("item: {id}, description from cache");
                    return Ok(facet.value.clone());
                }
            }
        }

        let description = Arc::new(self.storage.item_description(id).await?);
        let entry = self.item_entry(id);
        let mut entry = entry.lock();
        entry.published_at = Some(description.published_at);
        entry.description = Some(Facet::new(description.clone(), now));
        Ok(description)
    }

    /// A bounded range always reads through to storage.
    pub async fn metrics_history(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Arc<MetricsHistory>> {
        if !self.settings.enabled || from.is_some() || to.is_some() {
            return Ok(Arc::new(self.storage.metrics_history(id, from, to).await?));
        }

        if let Some(entry) = self.items.get(id) {
            let entry = entry.lock();
            if let Some(facet) = &entry.metrics {
                if self.servable(facet, entry.published_at, now) {
                    debug!("item: {id}, metrics from cache");
                    return Ok(facet.value.clone());
                }
            }
        }

        let history = Arc::new(self.storage.metrics_history(id, None, None).await?);
        let entry = self.item_entry(id);
        let mut entry = entry.lock();
        entry.published_at = Some(history.published_at);
        entry.metrics = Some(Facet::new(history.clone(), now));
        Ok(history)
    }

    /// One page of newest items, of a single collection or of all enabled ones.
    pub async fn item_page(
        &self,
        collection_id: Option<&str>,
        offset: i64,
        now: DateTime<Utc>,
    ) -> Result<Arc<Vec<ItemSummary>>> {
        if offset < 0 {
            return Err(Error::validation(format!("negative offset {offset}")));
        }
        let limit = self.settings.max_view_items;
        if !self.settings.enabled {
            return Ok(Arc::new(self.storage.item_page(collection_id, offset, limit).await?));
        }

        let key = (collection_id.unwrap_or_default().to_string(), offset);
        if let Some(facet) = self.pages.get(&key) {
            if facet.is_fresh(now, self.settings.period_video_cache) {
                return Ok(facet.value);
            }
        }

        let page = Arc::new(self.storage.item_page(collection_id, offset, limit).await?);
        self.pages.insert(key, Facet::new(page.clone(), now));
        Ok(page)
    }

    /// Enabled collections are cached; the full admin list always reads
    /// storage.
    pub async fn collections(&self, only_enabled: bool, now: DateTime<Utc>) -> Result<Arc<CollectionsResponse>> {
        if !only_enabled || !self.settings.enabled {
            return Ok(Arc::new(self.load_collections(only_enabled).await?));
        }

        let generation = {
            let slot = self.collections.lock();
            if let Some(facet) = &slot.facet {
                if facet.is_fresh(now, self.settings.period_collection_list_cache) {
                    return Ok(facet.value.clone());
                }
            }
            slot.generation
        };

        let response = Arc::new(self.load_collections(true).await?);
        let mut slot = self.collections.lock();
        if slot.generation == generation {
            slot.facet = Some(Facet::new(response.clone(), now));
        } else {
            debug!("collections changed during refresh, result not cached");
        }
        Ok(response)
    }

    async fn load_collections(&self, only_enabled: bool) -> Result<CollectionsResponse> {
        Ok(CollectionsResponse {
            max_item_count: self.settings.max_view_items,
            collections: self.storage.collections(only_enabled).await?,
        })
    }

    /// Forces the next enabled-collections read to go to storage.
    pub fn invalidate_collections(&self) {
        let mut slot = self.collections.lock();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(facet) = slot.facet.as_mut() {
            facet.refreshed_at = DateTime::<Utc>::MIN_UTC;
        }
    }

    /// Keeps serving the last good value when a refresh fails.
    pub async fn global_counts(&self, now: DateTime<Utc>) -> Result<Arc<GlobalCounts>> {
        let cached = self.counts.lock().clone();
        if self.settings.enabled {
            if let Some(facet) = &cached {
                if facet.is_fresh(now, self.settings.period_video_cache) {
                    return Ok(facet.value.clone());
                }
            }
        }

        let counts = match self.storage.global_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                return match cached {
                    Some(facet) => {
                        warn!("Serving stale counts after refresh error: {e}");
                        Ok(facet.value)
                    }
                    None => Err(e),
                };
            }
        };

        let value = Arc::new(GlobalCounts {
            time_update: now,
            collection_count: counts.collection_count,
            item_count: counts.item_count,
            max_item_count: self.settings.max_view_items,
            period_video_cache_secs: self.settings.period_video_cache.as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_admin: self.settings.listen_admin,
        });
        *self.counts.lock() = Some(Facet::new(value.clone(), now));
        Ok(value)
    }
}
