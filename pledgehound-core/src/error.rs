use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row has no {0}")]
    MissingKey(&'static str),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a content-extraction provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("payment required")]
    PaymentRequired,

    #[error("website not supported: {0}")]
    WebsiteNotSupported(String),

    #[error("rate limited")]
    RateLimited,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ContactError {
    #[error("All extraction accounts are exhausted")]
    AllAccountsExhausted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type ContactResult<T> = std::result::Result<T, ContactError>;
