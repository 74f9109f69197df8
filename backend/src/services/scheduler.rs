use crate::error::Result;
use crate::models::NewItem;
use crate::registry::{ReconcileReport, Registry, TrackedCollection, TrackedItem};
use crate::services::catalog::{CatalogApi, CatalogItem};
use crate::services::collector::CollectorSettings;
use crate::services::storage::Storage;
use crate::utils::{is_older_than, parse_published_at};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub listed: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Keeps the registry in line with storage and the catalog: collection sync
/// and item discovery.
pub struct Reconciler {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    catalog: Arc<dyn CatalogApi>,
    settings: CollectorSettings,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn CatalogApi>,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Reconciler {
            registry,
            storage,
            catalog,
            settings,
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Diffs the registry against the enabled collections in storage.
    /// An empty enabled set is treated as a bad read and changes nothing.
    pub async fn sync_collections(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let enabled = self.storage.enabled_collection_ids().await?;
        if enabled.is_empty() {
            warn!("No enabled collections returned from storage, registry left as is");
            return Ok(ReconcileReport::default());
        }

        let report = self
            .registry
            .reconcile(&enabled, now, self.settings.period_deleted);
        for id in &report.appended {
            info!("col: {id}, append");
        }
        for id in &report.flagged {
            info!("col: {id}, set deleted");
        }
        for id in &report.restored {
            info!("col: {id}, cancel deleted");
        }
        for id in &report.removed {
            info!("col: {id}, delete");
        }
        debug!("collections in registry: {}", self.registry.len());
        Ok(report)
    }

    /// One discovery pass over a single collection.
    pub async fn discover_items(
        &self,
        collection: &TrackedCollection,
        now: DateTime<Utc>,
    ) -> Result<DiscoveryReport> {
        let col = collection.id();
        let elapsed = collection.check_elapsed(
            now,
            self.settings.period_collection,
            self.settings.period_deleted,
        );
        debug!(
            "col: {col}, items: {}, stopped: {}, removed: {}",
            elapsed.total, elapsed.stopped, elapsed.removed
        );

        let listing_id = self.listing_id(collection).await?;
        let listed = self
            .catalog
            .list_items(&listing_id, self.settings.max_request_videos)
            .await?;

        let mut report = DiscoveryReport {
            listed: listed.len(),
            ..Default::default()
        };
        for item in listed {
            if self.cancel.is_cancelled() {
                info!("col: {col}, discovery cancelled");
                break;
            }
            if item.id.is_empty() {
                warn!("col: {col}, listed item without id: {}", item.title);
                report.skipped += 1;
                continue;
            }

            let changed = match collection.item(&item.id) {
                Some(known) => self.update_known(collection, &item, &known).await?,
                None => self.add_new(collection, &item, now).await?,
            };
            match changed {
                Change::Added => report.added += 1,
                Change::Updated => report.updated += 1,
                Change::Skipped => report.skipped += 1,
                Change::Unchanged => {}
            }
        }

        info!(
            "col: {col}, listed: {}, added: {}, updated: {}, skipped: {}",
            report.listed, report.added, report.updated, report.skipped
        );
        Ok(report)
    }

    async fn listing_id(&self, collection: &TrackedCollection) -> Result<String> {
        if !self.catalog.needs_uploads_id() {
            return Ok(collection.id().to_string());
        }
        if let Some(uploads_id) = collection.uploads_id() {
            return Ok(uploads_id);
        }
        let metadata = self
            .catalog
            .get_collection_metadata(collection.id())
            .await?;
        info!("col: {}, set uploads: {}", collection.id(), metadata.uploads_id);
        collection.set_uploads_id(metadata.uploads_id.clone());
        Ok(metadata.uploads_id)
    }

    async fn add_new(
        &self,
        collection: &TrackedCollection,
        item: &CatalogItem,
        now: DateTime<Utc>,
    ) -> Result<Change> {
        let col = collection.id();
        let published_at = match parse_published_at(&item.published_at) {
            Ok(published_at) => published_at,
            Err(e) => {
                warn!("col: {col}, item: {}, {e}", item.id);
                return Ok(Change::Skipped);
            }
        };
        if is_older_than(published_at, now, self.settings.period_collection) {
            debug!("col: {col}, item: {}, outside collection window", item.id);
            return Ok(Change::Skipped);
        }

        let duration_secs = if item.live {
            None
        } else {
            self.catalog.get_item_duration(&item.id).await?
        };

        let new_item = NewItem {
            id: item.id.clone(),
            collection_id: col.to_string(),
            published_at,
            title: item.title.clone(),
            description: item.description.clone(),
            duration_secs,
        };
        if let Err(e) = self.storage.upsert_item(&new_item).await {
            error!("col: {col}, item: {}, cannot store item: {e}", item.id);
            return Ok(Change::Skipped);
        }

        collection.append(
            &item.id,
            TrackedItem::new(published_at, item.title.clone()).with_duration(duration_secs),
        );
        info!("col: {col}, item: {}, added: {}", item.id, item.title);
        Ok(Change::Added)
    }

    async fn update_known(
        &self,
        collection: &TrackedCollection,
        item: &CatalogItem,
        known: &TrackedItem,
    ) -> Result<Change> {
        if known.deleted {
            return Ok(Change::Unchanged);
        }
        let needs_duration = known.duration_secs.is_none() && !item.live;
        if known.title == item.title && !needs_duration {
            return Ok(Change::Unchanged);
        }

        let duration_secs = if needs_duration {
            self.catalog.get_item_duration(&item.id).await?
        } else {
            known.duration_secs
        };
        if known.title == item.title && duration_secs.is_none() {
            return Ok(Change::Unchanged);
        }

        let col = collection.id();
        if let Err(e) = self
            .storage
            .update_item(&item.id, &item.title, duration_secs)
            .await
        {
            error!("col: {col}, item: {}, cannot update item: {e}", item.id);
            return Ok(Change::Skipped);
        }
        collection.update_details(&item.id, &item.title, duration_secs);
        info!("col: {col}, item: {}, updated: {}", item.id, item.title);
        Ok(Change::Updated)
    }
}

enum Change {
    Added,
    Updated,
    Skipped,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectionInput;
    use crate::services::testing::{catalog_item, memory_storage, FakeCatalog};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    async fn setup(catalog: FakeCatalog) -> (Reconciler, Arc<FakeCatalog>) {
        let storage = memory_storage().await;
        storage
            .add_collection(&CollectionInput {
                id: "P1".into(),
                title: "first".into(),
                enabled: true,
            })
            .await
            .unwrap();
        let catalog = Arc::new(catalog);
        let reconciler = Reconciler::new(
            Arc::new(Registry::new()),
            Arc::new(storage),
            catalog.clone(),
            CollectorSettings::default(),
            CancellationToken::new(),
        );
        (reconciler, catalog)
    }

    #[tokio::test]
    async fn sync_appends_enabled_collections() {
        let (reconciler, _) = setup(FakeCatalog::default()).await;
        let report = reconciler.sync_collections(now()).await.unwrap();
        assert_eq!(report.appended, vec!["P1".to_string()]);
        assert!(reconciler.registry().get("P1").is_some());

        let report = reconciler.sync_collections(now()).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn discovery_adds_recent_and_skips_old_items() {
        let catalog = FakeCatalog::default();
        catalog.set_listing(vec![
            catalog_item("V1", "new one", now() - chrono::Duration::hours(1)),
            catalog_item("V2", "too old", now() - chrono::Duration::days(20)),
            catalog_item("", "no id", now()),
        ]);
        catalog.set_duration("V1", Some(300));
        let (reconciler, catalog) = setup(catalog).await;
        reconciler.sync_collections(now()).await.unwrap();

        let collection = reconciler.registry().get("P1").unwrap();
        let report = reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(report, DiscoveryReport { listed: 3, added: 1, updated: 0, skipped: 2 });

        let item = collection.item("V1").unwrap();
        assert_eq!(item.duration_secs, Some(300));
        assert!(!collection.contains("V2"));
        assert_eq!(catalog.duration_calls(), 1);
    }

    #[tokio::test]
    async fn discovery_updates_changed_titles_once() {
        let catalog = FakeCatalog::default();
        catalog.set_listing(vec![catalog_item("V1", "draft", now() - chrono::Duration::hours(1))]);
        catalog.set_duration("V1", Some(60));
        let (reconciler, catalog) = setup(catalog).await;
        reconciler.sync_collections(now()).await.unwrap();
        let collection = reconciler.registry().get("P1").unwrap();
        reconciler.discover_items(&collection, now()).await.unwrap();

        catalog.set_listing(vec![catalog_item("V1", "final", now() - chrono::Duration::hours(1))]);
        let report = reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(collection.item("V1").unwrap().title, "final");

        let report = reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.added, 0);
        assert_eq!(catalog.duration_calls(), 1);
    }

    #[tokio::test]
    async fn live_items_get_duration_later() {
        let catalog = FakeCatalog::default();
        let mut live = catalog_item("V1", "stream", now() - chrono::Duration::hours(1));
        live.live = true;
        catalog.set_listing(vec![live.clone()]);
        catalog.set_duration("V1", Some(7200));
        let (reconciler, catalog) = setup(catalog).await;
        reconciler.sync_collections(now()).await.unwrap();
        let collection = reconciler.registry().get("P1").unwrap();

        reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(collection.item("V1").unwrap().duration_secs, None);
        assert_eq!(catalog.duration_calls(), 0);

        live.live = false;
        catalog.set_listing(vec![live]);
        let report = reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(collection.item("V1").unwrap().duration_secs, Some(7200));
    }

    #[tokio::test]
    async fn uploads_id_is_resolved_once() {
        let catalog = FakeCatalog::with_uploads("UU1");
        catalog.set_listing(vec![catalog_item("V1", "v", now())]);
        let (reconciler, catalog) = setup(catalog).await;
        reconciler.sync_collections(now()).await.unwrap();
        let collection = reconciler.registry().get("P1").unwrap();

        reconciler.discover_items(&collection, now()).await.unwrap();
        reconciler.discover_items(&collection, now()).await.unwrap();
        assert_eq!(collection.uploads_id(), Some("UU1".to_string()));
        assert_eq!(catalog.metadata_calls(), 1);
        assert_eq!(catalog.listed_ids(), vec!["UU1".to_string(), "UU1".to_string()]);
    }
}
