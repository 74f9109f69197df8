use crate::api::ApiResult;
use crate::models::CollectionsResponse;
use crate::AppState;
use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{get, State};
use std::sync::Arc;

#[get("/collections")]
pub async fn list_collections(state: &State<AppState>) -> ApiResult<Arc<CollectionsResponse>> {
    Ok(Json(state.cache.collections(true, Utc::now()).await?))
}
