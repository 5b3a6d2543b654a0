// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQLite persistence for scopelog: a trace-gated log sink, a merge-upsert
//! metrics store and the collector-side ingest queue.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod error;
pub mod ingest;
pub mod log_sink;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use ingest::MetricsIngest;
pub use log_sink::{DbLogWriter, DbSink, DbSinkOptions};
pub use store::{MergeSummary, SqliteStore, StoredLog};
