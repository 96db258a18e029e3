use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::{error::Error as StdError, io::Error as IoError};
use thiserror::Error;
use tokio::task::JoinError;

pub type BridgeResult<T, E = BridgeError> = anyhow::Result<T, E>;

/// Workspace-wide error taxonomy.
///
/// Variants mirror the failure classes the bridge actually distinguishes:
/// transient transport, credential trouble, decode problems, backend
/// rejections, and cancellation. Receive-loop code never propagates these
/// upward; they are logged at the callback boundary.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("MQTT error: {reason}")]
    MqttError { reason: String },

    #[error("publish to {platform} failed: {reason}")]
    PublishFailed { platform: String, reason: String },

    #[error("subscribe to '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("HTTP error: {reason}")]
    HttpError { reason: String },

    #[error("credential error: {reason}")]
    CredentialError { reason: String },

    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    #[error("deserialization error: {reason}")]
    DeserializationError { reason: String },

    #[error("backend rejected {operation}: {reason}")]
    BackendRejection { operation: String, reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    JoinError(#[from] JoinError),

    #[error("{0}")]
    IoError(#[from] IoError),

    #[error("{0}")]
    Json(#[from] SerdeJsonError),

    #[error("{0}")]
    ConfigError(#[from] ConfigError),

    #[error("{0}")]
    Anyhow(#[from] AnyhowError),

    #[error("{0}")]
    Msg(String),
}

impl From<String> for BridgeError {
    #[inline]
    fn from(e: String) -> Self {
        BridgeError::Msg(e)
    }
}

impl From<&str> for BridgeError {
    #[inline]
    fn from(e: &str) -> Self {
        BridgeError::Msg(e.to_string())
    }
}

impl From<Box<dyn StdError + Send + Sync>> for BridgeError {
    #[inline]
    fn from(e: Box<dyn StdError + Send + Sync>) -> Self {
        BridgeError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_reason() {
        let e = BridgeError::PublishFailed {
            platform: "watson".to_string(),
            reason: "broken pipe".to_string(),
        };
        assert_eq!(e.to_string(), "publish to watson failed: broken pipe");
    }

    #[test]
    fn from_str_is_msg() {
        let e = BridgeError::from("boom");
        assert!(matches!(e, BridgeError::Msg(ref m) if m == "boom"));
    }
}
