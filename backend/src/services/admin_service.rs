use crate::error::{Error, Result};
use crate::models::CollectionInput;
use crate::services::read_cache::ReadCache;
use crate::services::storage::Storage;
use crate::utils::extract_collection_id;
use log::info;

pub fn authenticate_admin(expected_token: &str, token: &str) -> bool {
    !expected_token.is_empty() && token == expected_token
}

fn normalize(mut input: CollectionInput) -> Result<CollectionInput> {
    input.id = extract_collection_id(&input.id)
        .ok_or_else(|| Error::validation(format!("invalid collection id or url '{}'", input.id)))?;
    input.title = input.title.trim().to_string();
    Ok(input)
}

/// Every mutation resets the cached collection list, whatever the outcome.
pub async fn add_collection(
    storage: &dyn Storage,
    cache: &ReadCache,
    input: CollectionInput,
) -> Result<CollectionInput> {
    let input = normalize(input)?;
    let result = storage.add_collection(&input).await;
    cache.invalidate_collections();
    result?;
    info!("col: {}, added by admin: {}", input.id, input.title);
    Ok(input)
}

pub async fn update_collection(
    storage: &dyn Storage,
    cache: &ReadCache,
    id: &str,
    mut input: CollectionInput,
) -> Result<CollectionInput> {
    if input.id.trim().is_empty() {
        input.id = id.to_string();
    }
    let input = normalize(input)?;
    if input.id != id {
        return Err(Error::validation(format!(
            "collection id {} does not match path {id}",
            input.id
        )));
    }
    let result = storage.update_collection(id, &input).await;
    cache.invalidate_collections();
    result?;
    info!("col: {id}, updated by admin: title={}, enabled={}", input.title, input.enabled);
    Ok(input)
}

pub async fn delete_collection(storage: &dyn Storage, cache: &ReadCache, id: &str) -> Result<()> {
    let result = storage.delete_collection(id).await;
    cache.invalidate_collections();
    result?;
    info!("col: {id}, deleted by admin");
    Ok(())
}
