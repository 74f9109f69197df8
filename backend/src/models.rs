use crate::error::Error;
use chrono::{DateTime, Utc};
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::Responder;
use rocket::{response, Response};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminToken(pub String);

/// Engagement counters reported by the catalog for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub comment: i64,
    pub like: i64,
    pub dislike: i64,
    pub view: i64,
}

/// A tracked collection (channel or playlist) as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRecord {
    pub id: String,
    pub title: String,
    pub enabled: bool,
    pub added_at: DateTime<Utc>,
    pub item_count: i64,
}

/// Body of the admin create/update requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInput {
    /// Collection id or a YouTube channel/playlist URL.
    pub id: String,
    pub title: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionsResponse {
    pub max_item_count: i64,
    pub collections: Vec<CollectionRecord>,
}

/// Registry seed row loaded at startup: an enabled collection and its
/// items that are still inside the collection window.
#[derive(Debug, Clone, Default)]
pub struct WarmCollection {
    pub id: String,
    pub items: Vec<WarmItem>,
}

#[derive(Debug, Clone)]
pub struct WarmItem {
    pub id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: String,
    pub collection_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub item_id: String,
    pub counters: Counters,
    pub recorded_at: DateTime<Utc>,
}

/// Full description of one item, served by `/video/item/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemDescription {
    pub id: String,
    pub collection_id: String,
    pub collection_title: String,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
    pub metric_count: i64,
    pub min_metric_time: Option<DateTime<Utc>>,
    pub max_metric_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    #[serde(flatten)]
    pub counters: Counters,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsHistory {
    pub item_id: String,
    pub published_at: DateTime<Utc>,
    pub metrics: Vec<MetricPoint>,
}

/// One row of a paginated item list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSummary {
    pub id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub collection_id: String,
    pub collection_title: String,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalCounts {
    pub time_update: DateTime<Utc>,
    pub collection_count: i64,
    pub item_count: i64,
    pub max_item_count: i64,
    pub period_video_cache_secs: u64,
    pub version: String,
    pub listen_admin: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status: Status,
    pub error: String,
    pub message: String,
}

impl From<Error> for ErrorResponse {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => Status::BadRequest,
            Error::NotFound { .. } => Status::NotFound,
            Error::Upstream(_) | Error::UpstreamResponse(_) => Status::BadGateway,
            _ => Status::InternalServerError,
        };
        ErrorResponse {
            status,
            error: status.reason().unwrap_or("Error").to_string(),
            message: err.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ErrorResponse {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let json = serde_json::to_string(&self).map_err(|_| Status::InternalServerError)?;
        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}
