use crate::api::ApiResult;
use crate::models::{GlobalCounts, ItemDescription, ItemSummary, MetricsHistory};
use crate::utils::parse_range_bound;
use crate::AppState;
use chrono::Utc;
use log::debug;
use rocket::serde::json::Json;
use rocket::{get, State};
use std::sync::Arc;

#[get("/counts")]
pub async fn get_counts(state: &State<AppState>) -> ApiResult<Arc<GlobalCounts>> {
    Ok(Json(state.cache.global_counts(Utc::now()).await?))
}

#[get("/items?<offset>")]
pub async fn list_items(state: &State<AppState>, offset: Option<i64>) -> ApiResult<Arc<Vec<ItemSummary>>> {
    let page = state
        .cache
        .item_page(None, offset.unwrap_or(0), Utc::now())
        .await?;
    Ok(Json(page))
}

#[get("/items/<collection_id>?<offset>")]
pub async fn list_collection_items(
    state: &State<AppState>,
    collection_id: &str,
    offset: Option<i64>,
) -> ApiResult<Arc<Vec<ItemSummary>>> {
    let page = state
        .cache
        .item_page(Some(collection_id), offset.unwrap_or(0), Utc::now())
        .await?;
    Ok(Json(page))
}

#[get("/item/<id>")]
pub async fn get_item(state: &State<AppState>, id: &str) -> ApiResult<Arc<ItemDescription>> {
    Ok(Json(state.cache.item_description(id, Utc::now()).await?))
}

#[get("/metrics/<id>?<from>&<to>")]
pub async fn get_metrics(
    state: &State<AppState>,
    id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> ApiResult<Arc<MetricsHistory>> {
    let from = from.map(parse_range_bound).transpose()?;
    let to = to.map(parse_range_bound).transpose()?;
    debug!("item: {id}, metrics from {from:?} to {to:?}");

    let history = state.cache.metrics_history(id, from, to, Utc::now()).await?;
    Ok(Json(history))
}
