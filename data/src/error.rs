use thiserror::Error;

/// All errors produced by the data crate.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("invalid market channel: {0}")]
    Channel(String),

    #[error("failed to decode ticker payload: {0}")]
    Decode(String),

    #[error("market-data service returned NOTOK: {0}")]
    Service(String),

    #[error("market-data service transport: {0}")]
    Transport(String),

    #[error("market-data service returned no data for {0}")]
    MissingData(String),

    #[error("pub/sub subscribe failed for {0}")]
    Subscribe(String),

    #[error("pub/sub connection lost")]
    ConnectionLost,
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<reqwest::Error> for DataError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}
