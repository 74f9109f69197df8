use crate::error::{Error, Result};
use crate::models::Counters;
use crate::utils::parse_iso8601_duration_to_seconds;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use log::debug;
use reqwest::Client;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3/";
const LIVE_BROADCAST_CONTENT: &str = "live";

/// Hard ceiling of ids per `videos.list` call.
pub const MAX_IDS_PER_REQUEST: usize = 50;

/// An item as reported by a collection listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub title: String,
    /// Raw ISO8601 string; validated by the caller.
    pub published_at: String,
    pub description: String,
    /// Live broadcasts have no duration yet.
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemCounters {
    pub id: String,
    /// `None` when the catalog no longer reports statistics for the item.
    pub statistics: Option<Counters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMetadata {
    pub uploads_id: String,
}

/// How new items of a collection are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// The collection id is a playlist id listed with `playlistItems.list`.
    Playlist,
    /// The collection id is a channel id; its uploads playlist is resolved
    /// first and then listed with `playlistItems.list`.
    Uploads,
    /// The collection id is a channel id queried with `search.list`.
    Search,
}

impl FromStr for DiscoveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playlist" | "playlist_items" => Ok(DiscoveryMode::Playlist),
            "uploads" | "channel" => Ok(DiscoveryMode::Uploads),
            "search" => Ok(DiscoveryMode::Search),
            other => Err(Error::Config(format!("unknown discovery mode '{other}'"))),
        }
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Whether `list_items` expects the uploads listing id rather than the
    /// collection id.
    fn needs_uploads_id(&self) -> bool;

    async fn list_items(&self, listing_id: &str, max_results: u32) -> Result<Vec<CatalogItem>>;

    async fn get_counters(&self, item_ids: &[String]) -> Result<Vec<ItemCounters>>;

    async fn get_item_duration(&self, item_id: &str) -> Result<Option<i64>>;

    async fn get_collection_metadata(&self, collection_id: &str) -> Result<CollectionMetadata>;
}

/// YouTube Data API v3 client.
pub struct YoutubeCatalog {
    client: Client,
    api_key: String,
    base_url: Url,
    mode: DiscoveryMode,
    collection_window: Duration,
}

impl YoutubeCatalog {
    pub fn new(
        api_key: &str,
        mode: DiscoveryMode,
        collection_window: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = Url::parse(YOUTUBE_API_BASE)
            .map_err(|e| Error::Config(format!("bad catalog url: {e}")))?;
        Ok(YoutubeCatalog {
            client,
            api_key: api_key.to_string(),
            base_url,
            mode,
            collection_window,
        })
    }

    async fn call(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value> {
        let mut url = self
            .base_url
            .join(endpoint)
            .map_err(|e| Error::UpstreamResponse(format!("bad endpoint {endpoint}: {e}")))?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().copied())
            .append_pair("key", &self.api_key);

        debug!("catalog request: {endpoint} {params:?}");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.json::<Value>().await?;

        if let Some(message) = body["error"]["message"].as_str() {
            return Err(Error::UpstreamResponse(message.to_string()));
        }
        Ok(body)
    }

    async fn list_playlist_items(&self, playlist_id: &str, max_results: u32) -> Result<Vec<CatalogItem>> {
        let max_results = max_results.to_string();
        let response = self
            .call(
                "playlistItems",
                &[
                    ("part", "snippet"),
                    ("playlistId", playlist_id),
                    ("maxResults", &max_results),
                ],
            )
            .await?;

        Ok(items_of(&response)
            .iter()
            .map(|item| CatalogItem {
                id: str_at(&item["snippet"]["resourceId"]["videoId"]),
                title: str_at(&item["snippet"]["title"]),
                published_at: str_at(&item["snippet"]["publishedAt"]),
                description: str_at(&item["snippet"]["description"]),
                live: false,
            })
            .collect())
    }

    async fn search_channel(&self, channel_id: &str, max_results: u32) -> Result<Vec<CatalogItem>> {
        let max_results = max_results.to_string();
        let window = chrono::Duration::from_std(self.collection_window)
            .unwrap_or_else(|_| chrono::Duration::days(14));
        let published_after = (Utc::now() - window).to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .call(
                "search",
                &[
                    ("part", "snippet,id"),
                    ("type", "video"),
                    ("order", "date"),
                    ("channelId", channel_id),
                    ("publishedAfter", &published_after),
                    ("maxResults", &max_results),
                ],
            )
            .await?;

        Ok(items_of(&response)
            .iter()
            .map(|item| CatalogItem {
                id: str_at(&item["id"]["videoId"]),
                title: str_at(&item["snippet"]["title"]),
                published_at: str_at(&item["snippet"]["publishedAt"]),
                description: str_at(&item["snippet"]["description"]),
                live: item["snippet"]["liveBroadcastContent"].as_str()
                    == Some(LIVE_BROADCAST_CONTENT),
            })
            .collect())
    }
}

#[async_trait]
impl CatalogApi for YoutubeCatalog {
    fn needs_uploads_id(&self) -> bool {
        self.mode == DiscoveryMode::Uploads
    }

    async fn list_items(&self, listing_id: &str, max_results: u32) -> Result<Vec<CatalogItem>> {
        match self.mode {
            DiscoveryMode::Playlist | DiscoveryMode::Uploads => {
                self.list_playlist_items(listing_id, max_results).await
            }
            DiscoveryMode::Search => self.search_channel(listing_id, max_results).await,
        }
    }

    // Documentation: https://developers.google.com/youtube/v3/docs/videos
    async fn get_counters(&self, item_ids: &[String]) -> Result<Vec<ItemCounters>> {
        if item_ids.len() > MAX_IDS_PER_REQUEST {
            return Err(Error::validation(format!(
                "{} ids exceed the per-request limit of {MAX_IDS_PER_REQUEST}",
                item_ids.len()
            )));
        }
        let ids = item_ids.join(",");
        let response = self
            .call("videos", &[("part", "statistics"), ("id", &ids)])
            .await?;

        Ok(items_of(&response)
            .iter()
            .map(|item| ItemCounters {
                id: str_at(&item["id"]),
                statistics: parse_statistics(&item["statistics"]),
            })
            .collect())
    }

    async fn get_item_duration(&self, item_id: &str) -> Result<Option<i64>> {
        let response = self
            .call("videos", &[("part", "contentDetails"), ("id", item_id)])
            .await?;

        Ok(items_of(&response)
            .first()
            .and_then(|item| item["contentDetails"]["duration"].as_str())
            .and_then(parse_iso8601_duration_to_seconds))
    }

    // returns the complete uploads playlist (as list-id) of a channel with the given channel-id
    async fn get_collection_metadata(&self, collection_id: &str) -> Result<CollectionMetadata> {
        let response = self
            .call("channels", &[("part", "contentDetails"), ("id", collection_id)])
            .await?;

        let uploads_id = response["items"][0]["contentDetails"]["relatedPlaylists"]["uploads"]
            .as_str()
            .ok_or_else(|| Error::UpstreamResponse("No uploads playlist found".to_string()))?;

        Ok(CollectionMetadata {
            uploads_id: uploads_id.to_string(),
        })
    }
}

fn items_of(response: &Value) -> &[Value] {
    response["items"].as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn str_at(value: &Value) -> String {
    value.as_str().unwrap_or("").to_string()
}

/// Statistics counters come back as decimal strings; missing counters are
/// zero, a missing statistics object means no statistics at all.
fn parse_statistics(statistics: &Value) -> Option<Counters> {
    let statistics = statistics.as_object()?;
    let count = |key: &str| -> i64 {
        match statistics.get(key) {
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            _ => 0,
        }
    };
    Some(Counters {
        comment: count("commentCount"),
        like: count("likeCount"),
        dislike: count("dislikeCount"),
        view: count("viewCount"),
    })
}
