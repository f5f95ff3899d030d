use std::io;

use thiserror::Error;

pub type LabelResult<T> = Result<T, LabelError>;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider lookup failed: {0}")]
    Provider(String),
    #[error("provider call exceeded its {0}ms budget")]
    ProviderTimeout(u64),
    #[error("{0}")]
    Config(String),
}

impl LabelError {
    /// Runtime provider conditions that trigger tier fallback instead of
    /// propagating to the caller.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            LabelError::Http(_) | LabelError::Provider(_) | LabelError::ProviderTimeout(_)
        )
    }
}
