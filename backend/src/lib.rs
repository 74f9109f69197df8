pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod registry;
pub mod services;
pub mod utils;

use crate::config::{create_cors, AppConfig};
use crate::registry::Registry;
use crate::services::read_cache::ReadCache;
use crate::services::storage::Storage;
use anyhow::Result;
use log::info;
use rocket::{routes, Build, Rocket};
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<ReadCache>,
    pub registry: Arc<Registry>,
}

pub fn build_rocket(state: AppState) -> Result<Rocket<Build>> {
    let cors = create_cors(&state.config.origin)?;
    let listen_admin = state.config.listen_admin;

    let mut rocket = rocket::build()
        .mount("/", routes![api::list_collections])
        .mount(
            "/video",
            routes![
                api::get_counts,
                api::list_items,
                api::list_collection_items,
                api::get_item,
                api::get_metrics,
            ],
        );

    if listen_admin {
        info!("Admin routes enabled");
        rocket = rocket.mount(
            "/admin",
            routes![
                api::admin_collections,
                api::add_collection,
                api::update_collection,
                api::delete_collection,
                api::registry_status,
            ],
        );
    }

    Ok(rocket.manage(state).attach(cors))
}
