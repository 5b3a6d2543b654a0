// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised by sink backends. They are logged by the sink worker and never
/// reach the code that emitted the event.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No tokio runtime available to run the sink worker")]
    NoRuntime,
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Extract(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SinkError::InvalidConfig("endpoint is required".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: endpoint is required"
        );
        let error = SinkError::Storage("disk full".to_string());
        assert_eq!(error.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: SinkError = io.into();
        assert!(matches!(error, SinkError::Io(_)));
        assert!(error.to_string().starts_with("I/O error"));
    }

    #[test]
    fn test_no_runtime_debug() {
        let debug_str = format!("{:?}", SinkError::NoRuntime);
        assert!(debug_str.contains("NoRuntime"));
    }
}
