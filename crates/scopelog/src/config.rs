// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Option structs shared by sinks, and the layered loader used by hosts.
//!
//! Configuration is merged in order: struct defaults, then the YAML file, then
//! `SCOPELOG_` environment variables (`__` separates nested keys, for example
//! `SCOPELOG_FILE__RETAIN_FILE_COUNT=10`).

use crate::error::ConfigError;
use crate::event::Severity;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SCOPELOG_";

/// Deserializes a millisecond count into a [`Duration`].
pub fn deserialize_duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Loads `T` from defaults, an optional YAML file and the environment.
pub fn load<T>(path: Option<&Path>) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let mut figment = Figment::new();
    if let Some(path) = path {
        figment = figment.merge(Yaml::file(path));
    }
    let config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<T>()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Events below this severity are discarded before reaching any sink.
    pub min_severity: Severity,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            min_severity: Severity::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileSinkOptions {
    /// Root directory. The sink stays disabled when unset.
    pub directory: Option<PathBuf>,
    /// Folder used for output with no service description.
    pub general_name: Option<String>,
    pub retain_file_count: usize,
    pub max_file_size: u64,
    #[serde(
        rename = "buffer_time_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub buffer_time: Duration,
    pub max_batch_items: usize,
    pub fork_enabled: bool,
    pub include_scopes: bool,
    pub include_categories: bool,
    pub disabled: bool,
}

impl Default for FileSinkOptions {
    fn default() -> Self {
        Self {
            directory: None,
            general_name: None,
            retain_file_count: 50,
            max_file_size: 5 * 1024 * 1024,
            buffer_time: Duration::from_secs(5),
            max_batch_items: 10_000,
            fork_enabled: true,
            include_scopes: true,
            include_categories: false,
            disabled: false,
        }
    }
}

impl FileSinkOptions {
    pub fn general_folder(&self) -> &str {
        self.general_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("General")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    #[serde(
        rename = "sample_rate_ms",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub sample_rate: Duration,
    pub disabled: bool,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            sample_rate: Duration::from_secs(5),
            disabled: false,
        }
    }
}
