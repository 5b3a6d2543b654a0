// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use scopelog::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Connection lock poisoned")]
    Poisoned,

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

impl From<StoreError> for SinkError {
    fn from(error: StoreError) -> Self {
        SinkError::Storage(error.to_string())
    }
}
