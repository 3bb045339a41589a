//! Error types for the Stratos provider agent

use thiserror::Error;

/// Main error type for provider operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Durable record store error
    #[error("record store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Outbound HTTP error (marketplace coordinator, registries, probes)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Missing or invalid provider configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Unsupported or malformed deployment manifest
    #[error("manifest format error: {0}")]
    Format(String),

    /// GPU telemetry could not be parsed for a node
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Workload deployment failed partway through its state machine
    #[error("deploy error: {0}")]
    Deploy(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a manifest format error with the given message
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a telemetry error with the given message
    pub fn telemetry(msg: impl Into<String>) -> Self {
        Self::Telemetry(msg.into())
    }

    /// Create a deploy error with the given message
    pub fn deploy(msg: impl Into<String>) -> Self {
        Self::Deploy(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let err = Error::format("unsupported manifest version: 3.1");
        assert!(err.to_string().contains("manifest format error"));
        assert!(err.to_string().contains("3.1"));

        let err = Error::config("resource_policy.json is not valid JSON");
        assert!(err.to_string().contains("configuration error"));

        match Error::deploy("service creation failed") {
            Error::Deploy(msg) => assert_eq!(msg, "service creation failed"),
            _ => panic!("expected Deploy variant"),
        }
    }
}
