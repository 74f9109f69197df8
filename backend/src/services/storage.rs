//! Relational persistence for collections, items and metric points.

use crate::error::{Error, Result};
use crate::models::{
    CollectionInput, CollectionRecord, Counters, ItemDescription, ItemSummary, MetricPoint,
    MetricRecord, MetricsHistory, NewItem, WarmCollection, WarmItem,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS collection (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 1,
        added_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS item (
        id TEXT PRIMARY KEY NOT NULL,
        collection_id TEXT NOT NULL,
        published_at INTEGER NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        duration_secs INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_item_collection ON item (collection_id, published_at)",
    "CREATE TABLE IF NOT EXISTS metric (
        item_id TEXT NOT NULL,
        comment_count INTEGER NOT NULL,
        like_count INTEGER NOT NULL,
        dislike_count INTEGER NOT NULL,
        view_count INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_metric_item ON metric (item_id, recorded_at)",
];

/// Totals over enabled collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCounts {
    pub collection_count: i64,
    pub item_count: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn enabled_collection_ids(&self) -> Result<HashSet<String>>;

    /// Enabled collections with their items published after `since`.
    async fn collections_with_recent_items(&self, since: DateTime<Utc>) -> Result<Vec<WarmCollection>>;

    async fn upsert_item(&self, item: &NewItem) -> Result<()>;

    async fn update_item(&self, id: &str, title: &str, duration_secs: Option<i64>) -> Result<()>;

    /// Writes all records in one transaction.
    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<()>;

    async fn item_description(&self, id: &str) -> Result<ItemDescription>;

    async fn metrics_history(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<MetricsHistory>;

    /// Newest items first; `collection_id = None` lists all enabled collections.
    async fn item_page(&self, collection_id: Option<&str>, offset: i64, limit: i64) -> Result<Vec<ItemSummary>>;

    async fn collections(&self, only_enabled: bool) -> Result<Vec<CollectionRecord>>;

    async fn global_counts(&self) -> Result<StorageCounts>;

    async fn add_collection(&self, input: &CollectionInput) -> Result<()>;

    async fn update_collection(&self, id: &str, input: &CollectionInput) -> Result<()>;

    async fn delete_collection(&self, id: &str) -> Result<()>;
}

#[derive(FromRow)]
struct CollectionRow {
    id: String,
    title: String,
    enabled: bool,
    added_at: i64,
    item_count: i64,
}

impl From<CollectionRow> for CollectionRecord {
    fn from(row: CollectionRow) -> Self {
        CollectionRecord {
            id: row.id.trim().to_string(),
            title: row.title.trim().to_string(),
            enabled: row.enabled,
            added_at: from_unix(row.added_at),
            item_count: row.item_count,
        }
    }
}

#[derive(FromRow)]
struct WarmRow {
    collection_id: String,
    item_id: Option<String>,
    published_at: Option<i64>,
    title: Option<String>,
    duration_secs: Option<i64>,
}

#[derive(FromRow)]
struct DescriptionRow {
    id: String,
    collection_id: String,
    collection_title: String,
    title: String,
    description: String,
    published_at: i64,
    duration_secs: Option<i64>,
    metric_count: i64,
    min_metric_time: Option<i64>,
    max_metric_time: Option<i64>,
}

#[derive(FromRow)]
struct MetricRow {
    comment_count: i64,
    like_count: i64,
    dislike_count: i64,
    view_count: i64,
    recorded_at: i64,
}

#[derive(FromRow)]
struct SummaryRow {
    id: String,
    title: String,
    published_at: i64,
    collection_id: String,
    collection_title: String,
    duration_secs: Option<i64>,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// SQLite implementation of [`Storage`].
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30));
        // an in-memory database lives only as long as its connection
        if database_url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        info!("Opened database {database_url} with {} connections", pool.size());
        Ok(SqliteStorage { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        info!("Closing database with {} open connections", self.pool.size());
        self.pool.close().await;
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn enabled_collection_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM collection WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id.trim().to_string()).collect())
    }

    async fn collections_with_recent_items(&self, since: DateTime<Utc>) -> Result<Vec<WarmCollection>> {
        let rows = sqlx::query_as::<_, WarmRow>(
            "SELECT c.id AS collection_id, i.id AS item_id, i.published_at, i.title, i.duration_secs
             FROM collection c
             LEFT JOIN item i ON i.collection_id = c.id AND i.published_at > ?
             WHERE c.enabled = 1
             ORDER BY c.id",
        )
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut collections: Vec<WarmCollection> = Vec::new();
        for row in rows {
            let collection_id = row.collection_id.trim().to_string();
            if collections.last().map(|c| c.id != collection_id).unwrap_or(true) {
                collections.push(WarmCollection {
                    id: collection_id,
                    items: Vec::new(),
                });
            }
            if let (Some(item_id), Some(published_at), Some(current)) =
                (row.item_id, row.published_at, collections.last_mut())
            {
                current.items.push(WarmItem {
                    id: item_id,
                    published_at: from_unix(published_at),
                    title: row.title.unwrap_or_default(),
                    duration_secs: row.duration_secs,
                });
            }
        }
        Ok(collections)
    }

    async fn upsert_item(&self, item: &NewItem) -> Result<()> {
        if item.id.is_empty() {
            return Err(Error::validation("add item: id is empty"));
        }
        if item.collection_id.is_empty() {
            return Err(Error::validation("add item: collection id is empty"));
        }

        sqlx::query(
            "INSERT INTO item (id, collection_id, published_at, title, description, duration_secs)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                duration_secs = excluded.duration_secs",
        )
        .bind(&item.id)
        .bind(&item.collection_id)
        .bind(item.published_at.timestamp())
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.duration_secs)
        .execute(&self.pool)
        .await?;

        debug!(
            "insert item: id={}, collection={}, published_at={}, title={}",
            item.id, item.collection_id, item.published_at, item.title
        );
        Ok(())
    }

    async fn update_item(&self, id: &str, title: &str, duration_secs: Option<i64>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE item SET title = ?, duration_secs = COALESCE(?, duration_secs) WHERE id = ?",
        )
        .bind(title)
        .bind(duration_secs)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("item", id));
        }
        Ok(())
    }

    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO metric (item_id, comment_count, like_count, dislike_count, view_count, recorded_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.item_id)
                .push_bind(record.counters.comment)
                .push_bind(record.counters.like)
                .push_bind(record.counters.dislike)
                .push_bind(record.counters.view)
                .push_bind(record.recorded_at.timestamp());
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        debug!("insert {} metric rows", records.len());
        Ok(())
    }

    async fn item_description(&self, id: &str) -> Result<ItemDescription> {
        let row = sqlx::query_as::<_, DescriptionRow>(
            "SELECT i.id, i.collection_id, COALESCE(c.title, '') AS collection_title,
                    i.title, i.description, i.published_at, i.duration_secs,
                    (SELECT COUNT(*) FROM metric m WHERE m.item_id = i.id) AS metric_count,
                    (SELECT MIN(recorded_at) FROM metric m WHERE m.item_id = i.id) AS min_metric_time,
                    (SELECT MAX(recorded_at) FROM metric m WHERE m.item_id = i.id) AS max_metric_time
             FROM item i
             LEFT JOIN collection c ON c.id = i.collection_id
             WHERE i.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("item", id))?;

        Ok(ItemDescription {
            id: row.id,
            collection_id: row.collection_id,
            collection_title: row.collection_title.trim().to_string(),
            title: row.title.trim().to_string(),
            description: row.description,
            published_at: from_unix(row.published_at),
            duration_secs: row.duration_secs,
            metric_count: row.metric_count,
            min_metric_time: row.min_metric_time.map(from_unix),
            max_metric_time: row.max_metric_time.map(from_unix),
        })
    }

    async fn metrics_history(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<MetricsHistory> {
        let (published_at,): (i64,) = sqlx::query_as("SELECT published_at FROM item WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("item", id))?;

        let rows = sqlx::query_as::<_, MetricRow>(
            "SELECT comment_count, like_count, dislike_count, view_count, recorded_at
             FROM metric
             WHERE item_id = ? AND recorded_at >= ? AND recorded_at <= ?
             ORDER BY recorded_at",
        )
        .bind(id)
        .bind(from.map(|t| t.timestamp()).unwrap_or(i64::MIN))
        .bind(to.map(|t| t.timestamp()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(MetricsHistory {
            item_id: id.to_string(),
            published_at: from_unix(published_at),
            metrics: rows
                .into_iter()
                .map(|row| MetricPoint {
                    counters: Counters {
                        comment: row.comment_count,
                        like: row.like_count,
                        dislike: row.dislike_count,
                        view: row.view_count,
                    },
                    time: from_unix(row.recorded_at),
                })
                .collect(),
        })
    }

    async fn item_page(&self, collection_id: Option<&str>, offset: i64, limit: i64) -> Result<Vec<ItemSummary>> {
        let rows = match collection_id {
            Some(collection_id) => {
                sqlx::query_as::<_, SummaryRow>(
                    "SELECT i.id, i.title, i.published_at, i.collection_id,
                            COALESCE(c.title, '') AS collection_title, i.duration_secs
                     FROM item i
                     LEFT JOIN collection c ON c.id = i.collection_id
                     WHERE i.collection_id = ?
                     ORDER BY i.published_at DESC LIMIT ? OFFSET ?",
                )
                .bind(collection_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SummaryRow>(
                    "SELECT i.id, i.title, i.published_at, i.collection_id,
                            c.title AS collection_title, i.duration_secs
                     FROM item i
                     JOIN collection c ON c.id = i.collection_id
                     WHERE c.enabled = 1
                     ORDER BY i.published_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| ItemSummary {
                id: row.id,
                title: row.title.trim().to_string(),
                published_at: from_unix(row.published_at),
                collection_id: row.collection_id,
                collection_title: row.collection_title.trim().to_string(),
                duration_secs: row.duration_secs,
            })
            .collect())
    }

    async fn collections(&self, only_enabled: bool) -> Result<Vec<CollectionRecord>> {
        let filter = if only_enabled { "WHERE c.enabled = 1" } else { "" };
        let query = format!(
            "SELECT c.id, c.title, c.enabled, c.added_at,
                    (SELECT COUNT(*) FROM item i WHERE i.collection_id = c.id) AS item_count
             FROM collection c {filter}
             ORDER BY c.title, c.id"
        );
        let rows = sqlx::query_as::<_, CollectionRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(CollectionRecord::from).collect())
    }

    async fn global_counts(&self) -> Result<StorageCounts> {
        let (collection_count, item_count): (i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM collection WHERE enabled = 1),
                (SELECT COUNT(*) FROM item i JOIN collection c ON c.id = i.collection_id
                 WHERE c.enabled = 1)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StorageCounts {
            collection_count,
            item_count,
        })
    }

    async fn add_collection(&self, input: &CollectionInput) -> Result<()> {
        if input.id.is_empty() {
            return Err(Error::validation("collection id is empty"));
        }
        let result = sqlx::query(
            "INSERT INTO collection (id, title, enabled, added_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&input.id)
        .bind(&input.title)
        .bind(input.enabled)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    "insert collection: id={}, title={}, enabled={}",
                    input.id, input.title, input.enabled
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                Error::validation(format!("collection {} already exists", input.id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_collection(&self, id: &str, input: &CollectionInput) -> Result<()> {
        let result = sqlx::query("UPDATE collection SET title = ?, enabled = ? WHERE id = ?")
            .bind(&input.title)
            .bind(input.enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("collection", id));
        }
        debug!("update collection: id={id}, title={}, enabled={}", input.title, input.enabled);
        Ok(())
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM collection WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("collection", id));
        }
        debug!("deleted collection: id={id}");
        Ok(())
    }
}
