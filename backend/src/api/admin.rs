use crate::api::ApiResult;
use crate::models::{AdminToken, CollectionInput, CollectionsResponse, ErrorResponse};
use crate::registry::CollectionStatus;
use crate::services::admin_service;
use crate::AppState;
use chrono::Utc;
use log::info;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put, State};
use std::sync::Arc;

#[get("/collections")]
pub async fn admin_collections(
    _token: AdminToken,
    state: &State<AppState>,
) -> ApiResult<Arc<CollectionsResponse>> {
    Ok(Json(state.cache.collections(false, Utc::now()).await?))
}

#[post("/collections", data = "<input>")]
pub async fn add_collection(
    _token: AdminToken,
    state: &State<AppState>,
    input: Json<CollectionInput>,
) -> Result<(Status, Json<CollectionInput>), ErrorResponse> {
    let added =
        admin_service::add_collection(state.storage.as_ref(), &state.cache, input.into_inner())
            .await?;
    Ok((Status::Created, Json(added)))
}

#[put("/collections/<id>", data = "<input>")]
pub async fn update_collection(
    _token: AdminToken,
    state: &State<AppState>,
    id: &str,
    input: Json<CollectionInput>,
) -> ApiResult<CollectionInput> {
    let updated = admin_service::update_collection(
        state.storage.as_ref(),
        &state.cache,
        id,
        input.into_inner(),
    )
    .await?;
    Ok(Json(updated))
}

#[delete("/collections/<id>")]
pub async fn delete_collection(
    _token: AdminToken,
    state: &State<AppState>,
    id: &str,
) -> Result<Status, ErrorResponse> {
    admin_service::delete_collection(state.storage.as_ref(), &state.cache, id).await?;
    Ok(Status::NoContent)
}

#[get("/status")]
pub async fn registry_status(
    _token: AdminToken,
    state: &State<AppState>,
) -> Json<Vec<CollectionStatus>> {
    let status = state.registry.status();
    info!("Registry status: {} collections", status.len());
    Json(status)
}
