use crate::error::Result;
use crate::models::{Counters, MetricRecord};
use crate::registry::{TrackedCollection, TrackedItem};
use crate::services::catalog::{CatalogApi, MAX_IDS_PER_REQUEST};
use crate::services::collector::CollectorSettings;
use crate::services::storage::Storage;
use crate::utils::is_older_than;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub requests: usize,
    pub saved: usize,
    pub skipped: usize,
    pub stopped: usize,
    /// Batches abandoned on an upstream or storage error.
    pub failed: usize,
}

impl PollReport {
    fn add(&mut self, other: PollReport) {
        self.requests += other.requests;
        self.saved += other.saved;
        self.skipped += other.skipped;
        self.stopped += other.stopped;
        self.failed += other.failed;
    }
}

/// A metric point is written when `period_count` has passed since the last
/// one, or when any counter moved.
pub fn should_persist(
    item: &TrackedItem,
    counters: &Counters,
    now: DateTime<Utc>,
    period_count: Duration,
) -> bool {
    let period_elapsed = item
        .time_count
        .map(|at| is_older_than(at, now, period_count))
        .unwrap_or(true);
    period_elapsed || item.counters != *counters
}

pub struct MetricsPoller {
    storage: Arc<dyn Storage>,
    catalog: Arc<dyn CatalogApi>,
    settings: CollectorSettings,
    cancel: CancellationToken,
}

impl MetricsPoller {
    pub fn new(
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn CatalogApi>,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> Self {
        MetricsPoller {
            storage,
            catalog,
            settings,
            cancel,
        }
    }

    fn batch_size(&self) -> usize {
        self.settings.max_request_count_ids.clamp(1, MAX_IDS_PER_REQUEST)
    }

    /// Polls every requestable item of a collection, one batch at a time.
    /// A failing batch is logged and counted; the remaining batches still run.
    pub async fn poll_collection(
        &self,
        collection: &TrackedCollection,
        now: DateTime<Utc>,
    ) -> Result<PollReport> {
        let col = collection.id();
        let items = collection.requestable_items();
        if items.is_empty() {
            debug!("col: {col}, nothing to poll");
            return Ok(PollReport::default());
        }

        let mut report = PollReport::default();
        for batch in items.chunks(self.batch_size()) {
            if self.cancel.is_cancelled() {
                info!("col: {col}, metrics poll cancelled");
                break;
            }
            match self.poll_batch(collection, batch, now).await {
                Ok(batch_report) => report.add(batch_report),
                Err(e) => {
                    error!("col: {col}, metrics batch of {} items failed: {e}", batch.len());
                    report.failed += 1;
                }
            }
        }

        info!(
            "col: {col}, metrics - requests: {}, save: {}, skip: {}, stopped: {}, failed: {}",
            report.requests, report.saved, report.skipped, report.stopped, report.failed
        );
        Ok(report)
    }

    async fn poll_batch(
        &self,
        collection: &TrackedCollection,
        batch: &[(String, TrackedItem)],
        now: DateTime<Utc>,
    ) -> Result<PollReport> {
        let col = collection.id();
        let ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
        let requested: HashMap<&str, &TrackedItem> =
            batch.iter().map(|(id, item)| (id.as_str(), item)).collect();

        let response = self.catalog.get_counters(&ids).await?;
        let mut report = PollReport {
            requests: 1,
            ..Default::default()
        };

        let mut records = Vec::new();
        for reported in response {
            let Some(item) = requested.get(reported.id.as_str()) else {
                error!("col: {col}, unrequested item in response: {}", reported.id);
                continue;
            };
            let Some(counters) = reported.statistics else {
                collection.set_deleted(&reported.id, now);
                info!("col: {col}, item: {}, set deleted because statistics is null", reported.id);
                report.stopped += 1;
                continue;
            };

            debug!(
                "col: {col}, item: {}, comment: {}, like: {}, dislike: {}, view: {}",
                reported.id, counters.comment, counters.like, counters.dislike, counters.view
            );
            if should_persist(item, &counters, now, self.settings.period_count) {
                records.push(MetricRecord {
                    item_id: reported.id,
                    counters,
                    recorded_at: now,
                });
            }
        }

        if !records.is_empty() {
            if let Err(e) = self.storage.insert_metrics(&records).await {
                warn!("col: {col}, cannot save {} metric rows: {e}", records.len());
                return Err(e);
            }
            for record in &records {
                collection.record_metrics(&record.item_id, record.counters, now);
            }
        }

        report.saved = records.len();
        report.skipped = batch.len().saturating_sub(records.len() + report.stopped);
        Ok(report)
    }
}
