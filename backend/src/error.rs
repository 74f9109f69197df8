use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network, rate-limit or decode failure talking to the catalog API.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned an unexpected response: {0}")]
    UpstreamResponse(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
