use crate::models::AdminToken;
use crate::services::admin_service::authenticate_admin;
use crate::services::catalog::{DiscoveryMode, MAX_IDS_PER_REQUEST};
use crate::services::collector::CollectorSettings;
use crate::services::read_cache::CacheSettings;
use crate::AppState;
use anyhow::{anyhow, Context, Result};
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use rocket::http::{Method, Status};
use rocket::request::{FromRequest, Outcome};
use rocket::Request;
use rocket_cors::{AllowedHeaders, AllowedOrigins, CorsOptions};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Everything read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LevelFilter,
    pub database_url: String,
    pub database_max_connections: u32,
    pub youtube_api_key: String,
    pub catalog_discovery: DiscoveryMode,
    pub catalog_timeout: Duration,
    pub admin_token: String,
    pub listen_admin: bool,
    pub origin: String,
    pub run_collector: bool,
    pub run_api: bool,
    pub collector: CollectorSettings,
    pub cache: CacheSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: LevelFilter::Info,
            database_url: "sqlite://youtubemeter.db".to_string(),
            database_max_connections: 10,
            youtube_api_key: String::new(),
            catalog_discovery: DiscoveryMode::Uploads,
            catalog_timeout: Duration::from_secs(30),
            admin_token: String::new(),
            listen_admin: false,
            origin: "http://localhost:8080".to_string(),
            run_collector: true,
            run_api: true,
            collector: CollectorSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from a key lookup; unset keys keep their
    /// defaults, durations are whole seconds.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = AppConfig::default();

        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = LevelFilter::from_str(level.trim())
                .map_err(|_| anyhow!("LOG_LEVEL: unknown level '{level}'"))?;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        parse_into(&get, "DATABASE_MAX_CONNECTIONS", &mut config.database_max_connections)?;
        if let Some(key) = get("YOUTUBE_API_KEY") {
            config.youtube_api_key = key;
        }
        if let Some(mode) = get("CATALOG_DISCOVERY") {
            config.catalog_discovery = mode.parse()?;
        }
        seconds_into(&get, "CATALOG_TIMEOUT", &mut config.catalog_timeout)?;
        if let Some(token) = get("ADMIN_TOKEN") {
            config.admin_token = token;
        }
        parse_into(&get, "LISTEN_ADMIN", &mut config.listen_admin)?;
        if let Some(origin) = get("ORIGIN") {
            config.origin = origin;
        }
        parse_into(&get, "RUN_COLLECTOR", &mut config.run_collector)?;
        parse_into(&get, "RUN_API", &mut config.run_api)?;

        let collector = &mut config.collector;
        seconds_into(&get, "PERIOD_COLLECTION_SYNC", &mut collector.period_collection_sync)?;
        seconds_into(&get, "PERIOD_VIDEO", &mut collector.period_video)?;
        seconds_into(&get, "PERIOD_METER", &mut collector.period_meter)?;
        seconds_into(&get, "PERIOD_COUNT", &mut collector.period_count)?;
        seconds_into(&get, "PERIOD_DELETED", &mut collector.period_deleted)?;
        seconds_into(&get, "PERIOD_COLLECTION", &mut collector.period_collection)?;
        parse_into(&get, "MAX_REQUEST_COUNT_IDS", &mut collector.max_request_count_ids)?;
        parse_into(&get, "MAX_REQUEST_VIDEOS", &mut collector.max_request_videos)?;
        seconds_into(&get, "SHUTDOWN_TIMEOUT", &mut collector.shutdown_timeout)?;

        let clamped = collector.max_request_count_ids.clamp(1, MAX_IDS_PER_REQUEST);
        if clamped != collector.max_request_count_ids {
            warn!(
                "MAX_REQUEST_COUNT_IDS={} out of range, using {clamped}",
                collector.max_request_count_ids
            );
            collector.max_request_count_ids = clamped;
        }

        let cache = &mut config.cache;
        parse_into(&get, "ENABLE_CACHE", &mut cache.enabled)?;
        seconds_into(&get, "PERIOD_METER_CACHE", &mut cache.period_meter_cache)?;
        seconds_into(&get, "PERIOD_COLLECTION_CACHE", &mut cache.period_collection_cache)?;
        seconds_into(&get, "PERIOD_VIDEO_CACHE", &mut cache.period_video_cache)?;
        seconds_into(&get, "PERIOD_COLLECTION_LIST_CACHE", &mut cache.period_collection_list_cache)?;
        parse_into(&get, "ITEM_CACHE_SIZE", &mut cache.item_capacity)?;
        parse_into(&get, "PAGE_CACHE_SIZE", &mut cache.page_capacity)?;
        parse_into(&get, "MAX_VIEW_ITEMS", &mut cache.max_view_items)?;
        cache.listen_admin = config.listen_admin;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let periods = [
            ("PERIOD_COLLECTION_SYNC", self.collector.period_collection_sync),
            ("PERIOD_VIDEO", self.collector.period_video),
            ("PERIOD_METER", self.collector.period_meter),
        ];
        for (key, period) in periods {
            if period.is_zero() {
                return Err(anyhow!("{key} must be at least one second"));
            }
        }
        if self.cache.max_view_items < 1 {
            return Err(anyhow!("MAX_VIEW_ITEMS must be positive"));
        }
        if self.run_collector && self.youtube_api_key.is_empty() {
            return Err(anyhow!("YOUTUBE_API_KEY environment variable must be set"));
        }
        if self.listen_admin && self.admin_token.is_empty() {
            return Err(anyhow!("ADMIN_TOKEN environment variable must be set when LISTEN_ADMIN is on"));
        }
        Ok(())
    }
}

fn parse_into<T>(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = get(key) {
        *target = value
            .trim()
            .parse()
            .with_context(|| format!("{key}: cannot parse '{value}'"))?;
    }
    Ok(())
}

fn seconds_into(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) -> Result<()> {
    let mut secs = target.as_secs();
    parse_into(get, key, &mut secs)?;
    *target = Duration::from_secs(secs);
    Ok(())
}

pub fn init_logger(level: LevelFilter) {
    Builder::new().filter_level(level).init();
    info!("Starting youtubemeter...");
}

pub fn load_environment() {
    dotenv::dotenv().ok();
}

pub fn create_cors(origin: &str) -> Result<rocket_cors::Cors> {
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::some_exact(&[origin]))
        .allowed_methods(
            vec![
                Method::Get,
                Method::Post,
                Method::Put,
                Method::Delete,
                Method::Options,
            ]
            .into_iter()
            .map(From::from)
            .collect(),
        )
        .allowed_headers(AllowedHeaders::some(&[
            "Authorization",
            "Accept",
            "Content-Type",
        ]))
        .allow_credentials(true)
        .to_cors()
        .map_err(|e| anyhow!("Failed to create CORS options: {}", e))?;

    Ok(cors)
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminToken {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = request.rocket().state::<AppState>() else {
            return Outcome::Error((Status::InternalServerError, "Missing state"));
        };
        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "));

        match token {
            Some(t) => {
                if authenticate_admin(&state.config.admin_token, t) {
                    Outcome::Success(AdminToken(t.to_string()))
                } else {
                    Outcome::Error((Status::Unauthorized, "Invalid token"))
                }
            }
            None => Outcome::Error((Status::Unauthorized, "Missing token")),
        }
    }
}
