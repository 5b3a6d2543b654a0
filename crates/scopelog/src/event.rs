// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data model shared by every sink: log events, scope entries and the
//! correlation fields extracted from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Well-known scope keys. These route output rather than label it.
pub mod keys {
    pub const SERVICE_ID: &str = "ServiceId";
    pub const SERVICE_DESCRIPTION: &str = "ServiceDescription";
    pub const TRACE_ID: &str = "TraceId";
    pub const OPERATION: &str = "Operation";
    pub const OPERATION_STATE: &str = "OperationState";
    pub const CONTEXTUAL: &str = "Contextual";

    /// Keys that never show up as plain scope labels on remote channels.
    pub const ROUTING: [&str; 5] = [
        SERVICE_ID,
        SERVICE_DESCRIPTION,
        TRACE_ID,
        OPERATION_STATE,
        CONTEXTUAL,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    #[serde(alias = "Info")]
    Information,
    #[serde(alias = "Warn")]
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Three letter code used in file output.
    pub fn short_code(self) -> &'static str {
        match self {
            Severity::Trace => "TRC",
            Severity::Debug => "DBG",
            Severity::Information => "INF",
            Severity::Warning => "WRN",
            Severity::Error => "ERR",
            Severity::Critical => "CRI",
        }
    }

    /// Numeric level used on the wire and in storage.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Severity::Trace),
            1 => Some(Severity::Debug),
            2 => Some(Severity::Information),
            3 => Some(Severity::Warning),
            4 => Some(Severity::Error),
            5 => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "Trace",
            Severity::Debug => "Debug",
            Severity::Information => "Information",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        };
        f.write_str(name)
    }
}

/// Value stored under a key of a [`ScopeEntry::Properties`] scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Uuid(Uuid),
    Number(f64),
    Text(String),
}

impl PropertyValue {
    /// Renders the value the way it appears in file names and remote payloads.
    pub fn render(&self) -> String {
        match self {
            PropertyValue::Uuid(id) => id.to_string(),
            PropertyValue::Number(n) => n.to_string(),
            PropertyValue::Text(s) => s.clone(),
        }
    }

    /// Interprets the value as a UUID. Text that does not parse yields `None`.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            PropertyValue::Uuid(id) => Some(*id),
            PropertyValue::Text(s) => Uuid::parse_str(s.trim()).ok(),
            PropertyValue::Number(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        PropertyValue::Uuid(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value as f64)
    }
}

/// A single entered scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeEntry {
    Label(String),
    Labels(Vec<String>),
    Properties(BTreeMap<String, PropertyValue>),
}

impl ScopeEntry {
    pub fn label(label: impl Into<String>) -> Self {
        ScopeEntry::Label(label.into())
    }

    pub fn properties<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        ScopeEntry::Properties(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        match self {
            ScopeEntry::Properties(map) => map.get(key),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Plain labels carried by this entry. Property scopes carry none.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            ScopeEntry::Label(label) => std::slice::from_ref(label),
            ScopeEntry::Labels(labels) => labels.as_slice(),
            ScopeEntry::Properties(_) => &[],
        };
        slice.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeEntry::Label(label) => f.write_str(label),
            ScopeEntry::Labels(labels) => f.write_str(&labels.join(", ")),
            ScopeEntry::Properties(map) => {
                let rendered: Vec<String> =
                    map.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{}", rendered.join(", "))
            }
        }
    }
}

/// Routing fields pulled out of the active scopes. Later scopes win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub service_id: Option<Uuid>,
    pub service_description: Option<String>,
    pub trace_id: Option<String>,
    pub operation: Option<String>,
    pub operation_state: Option<String>,
    pub contextual: Option<String>,
}

impl Correlation {
    pub fn is_empty(&self) -> bool {
        self == &Correlation::default()
    }
}

/// One emitted log record. Shared by reference between sinks once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub message: String,
    pub severity: Severity,
    pub exception: Option<String>,
    pub correlation: Correlation,
    pub tenant_id: String,
    pub scopes: Vec<String>,
}

pub type SharedEvent = Arc<LogEvent>;

impl LogEvent {
    pub fn new(category: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category: category.into(),
            message: message.into(),
            severity,
            exception: None,
            correlation: Correlation::default(),
            tenant_id: String::new(),
            scopes: Vec::new(),
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn service_id(&self) -> Option<Uuid> {
        self.correlation.service_id
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.correlation.trace_id.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.correlation.operation.as_deref()
    }
}
