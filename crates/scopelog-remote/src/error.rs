// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use scopelog::SinkError;
use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Collector returned {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,
}

impl From<tungstenite::Error> for RemoteError {
    fn from(error: tungstenite::Error) -> Self {
        RemoteError::WebSocket(Box::new(error))
    }
}

impl From<RemoteError> for SinkError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::InvalidEndpoint(endpoint) => SinkError::InvalidConfig(endpoint),
            RemoteError::Serialization(e) => SinkError::Serialization(e),
            other => SinkError::Transport(other.to_string()),
        }
    }
}
