use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Whether the failure came from the durable store rather than the input.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Migration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_failures_are_persistence() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_persistence());
        assert!(!Error::Decode("bad".into()).is_persistence());
        assert!(!Error::UnknownDevice("D9".into()).is_persistence());
        assert!(!Error::Validation("bad".into()).is_persistence());
        assert!(!Error::ChannelSend.is_persistence());
    }
}
