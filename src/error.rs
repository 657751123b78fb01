use thiserror::Error;

#[derive(Error, Debug)]
pub enum FxError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Unknown currency code: {0}")]
    UnknownCurrency(String),

    #[error("Corrupt cache: {0}")]
    CorruptCache(String),

    #[error("No exchange rates available for base {0}")]
    NoRatesAvailable(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FxError {
    /// Whether the failure came from the remote side and can be covered by
    /// cached or default rates.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FxError::Http(_) | FxError::Network(_) | FxError::MalformedResponse(_)
        )
    }
}

pub type FxResult<T> = std::result::Result<T, FxError>;
