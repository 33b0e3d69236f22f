//! Error types for comsrv-rtdb

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtdbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for RtdbError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            RtdbError::Connection(err.to_string())
        } else {
            RtdbError::Command(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RtdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let err = RtdbError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn from_anyhow() {
        let err: RtdbError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, RtdbError::Other(_)));
        assert!(err.to_string().contains("boom"));
    }
}
