/// Gateway error types.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Broker request error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Broker connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for station info")]
    StationInfoTimeout,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
