// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote sinks for scopelog.
//!
//! - [`grpc`]: batches of trace-correlated events and sampled metrics sent to a
//!   collector with unary tonic calls
//! - [`push`]: live frames to a WebSocket hub, one group per service
//! - [`server`]: the collector end of the [`grpc`] calls, handing received
//!   events to a sink and received metrics to a metrics writer

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod convert;
pub mod error;
pub mod grpc;
pub mod proto;
pub mod push;
pub mod server;

pub use client::CollectorClient;
pub use error::RemoteError;
pub use grpc::{GrpcMetricsWriter, GrpcSink, GrpcSinkOptions};
pub use push::{PushSink, PushSinkOptions};
pub use server::{CollectorOptions, CollectorServer};
