// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire messages of the `scopelog.v1` collector service.

use prost_types::Timestamp;

pub const LOG_WRITER_PATH: &str = "/scopelog.v1.LogWriter/Write";
pub const METRICS_WRITER_PATH: &str = "/scopelog.v1.MetricsWriter/Write";

#[derive(Clone, PartialEq, prost::Message)]
pub struct GrpcLogEntry {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(string, tag = "2")]
    pub category: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(int32, tag = "4")]
    pub level: i32,
    #[prost(string, optional, tag = "5")]
    pub exception: Option<String>,
    /// Empty when the event has no service.
    #[prost(string, tag = "6")]
    pub service_id: String,
    #[prost(string, tag = "7")]
    pub trace_id: String,
    #[prost(string, tag = "8")]
    pub operation: String,
    #[prost(string, tag = "9")]
    pub tenant_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntries {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<GrpcLogEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GrpcMetricType {
    Category = 0,
    Operation = 1,
    Service = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GrpcMetric {
    #[prost(enumeration = "GrpcMetricType", tag = "1")]
    pub metric_type: i32,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(uint32, tag = "3")]
    pub dbg_count: u32,
    #[prost(uint32, tag = "4")]
    pub inf_count: u32,
    #[prost(uint32, tag = "5")]
    pub wrn_count: u32,
    #[prost(uint32, tag = "6")]
    pub err_count: u32,
    #[prost(uint32, tag = "7")]
    pub cri_count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricsRequest {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<GrpcMetric>,
}
