use crate::registry::Registry;
use crate::services::catalog::{CatalogApi, MAX_IDS_PER_REQUEST};
use crate::services::poller::MetricsPoller;
use crate::services::scheduler::Reconciler;
use crate::services::storage::Storage;
use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Periods and limits of the background collector.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub period_collection_sync: Duration,
    pub period_video: Duration,
    pub period_meter: Duration,
    /// Longest gap between two metric points of an unchanged item.
    pub period_count: Duration,
    /// Grace window between soft-delete and removal.
    pub period_deleted: Duration,
    /// Collection window: how long after publication an item is polled.
    pub period_collection: Duration,
    pub max_request_count_ids: usize,
    pub max_request_videos: u32,
    pub shutdown_timeout: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        CollectorSettings {
            period_collection_sync: Duration::from_secs(600),
            period_video: Duration::from_secs(60),
            period_meter: Duration::from_secs(60),
            period_count: Duration::from_secs(3600),
            period_deleted: Duration::from_secs(24 * 3600),
            period_collection: Duration::from_secs(14 * 24 * 3600),
            max_request_count_ids: MAX_IDS_PER_REQUEST,
            max_request_videos: 50,
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Owns the three periodic jobs and every task they spawn.
pub struct Collector {
    scheduler: JobScheduler,
    tracker: TaskTracker,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Collector {
    /// Seeds the registry from storage, runs a first sync and discovery
    /// pass, then schedules the repeated jobs.
    pub async fn start(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn CatalogApi>,
        settings: CollectorSettings,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let window = chrono::Duration::from_std(settings.period_collection)?;
        let snapshot = storage
            .collections_with_recent_items(Utc::now() - window)
            .await?;
        let item_count: usize = snapshot.iter().map(|c| c.items.len()).sum();
        registry.warm(snapshot);
        info!(
            "Registry warmed with {} collections and {item_count} items",
            registry.len()
        );

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            storage.clone(),
            catalog.clone(),
            settings.clone(),
            cancel.clone(),
        ));
        let poller = Arc::new(MetricsPoller::new(
            storage,
            catalog,
            settings.clone(),
            cancel.clone(),
        ));

        sync_collections(&reconciler).await;
        spawn_discovery(&reconciler, &tracker, &cancel);

        let scheduler = JobScheduler::new().await?;

        let sync_job = {
            let reconciler = reconciler.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            Job::new_repeated_async(settings.period_collection_sync, move |_uuid, _l| {
                let reconciler = reconciler.clone();
                let tracker = tracker.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracker.spawn(async move { sync_collections(&reconciler).await });
                })
            })?
        };

        let discovery_job = {
            let reconciler = reconciler.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            Job::new_repeated_async(settings.period_video, move |_uuid, _l| {
                let reconciler = reconciler.clone();
                let tracker = tracker.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    spawn_discovery(&reconciler, &tracker, &cancel);
                })
            })?
        };

        let meter_job = {
            let registry = registry.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            Job::new_repeated_async(settings.period_meter, move |_uuid, _l| {
                let registry = registry.clone();
                let poller = poller.clone();
                let tracker = tracker.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    spawn_polls(&registry, &poller, &tracker, &cancel);
                })
            })?
        };

        scheduler.add(sync_job).await?;
        scheduler.add(discovery_job).await?;
        scheduler.add(meter_job).await?;
        scheduler.start().await?;
        info!(
            "Collector scheduler started: sync every {:?}, discovery every {:?}, metrics every {:?}",
            settings.period_collection_sync, settings.period_video, settings.period_meter
        );

        Ok(Collector {
            scheduler,
            tracker,
            cancel,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// Stops scheduling, cancels running passes and waits for them to return.
    pub async fn shutdown(mut self) {
        info!("Stopping collector...");
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Collector scheduler did not shut down cleanly: {e}");
        }
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} collector tasks still running after {:?}",
                self.tracker.len(),
                self.shutdown_timeout
            );
        } else {
            info!("Collector stopped.");
        }
    }
}

async fn sync_collections(reconciler: &Reconciler) {
    if let Err(e) = reconciler.sync_collections(Utc::now()).await {
        error!("Collection sync failed: {e}");
    }
}

fn spawn_discovery(reconciler: &Arc<Reconciler>, tracker: &TaskTracker, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    let now = Utc::now();
    for collection in reconciler.registry().requestable() {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = reconciler.discover_items(&collection, now).await {
                error!("col: {}, discovery failed: {e}", collection.id());
            }
        });
    }
}

fn spawn_polls(
    registry: &Registry,
    poller: &Arc<MetricsPoller>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }
    let now = Utc::now();
    for collection in registry.requestable() {
        let poller = poller.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = poller.poll_collection(&collection, now).await {
                error!("col: {}, metrics poll failed: {e}", collection.id());
            }
        });
    }
}
