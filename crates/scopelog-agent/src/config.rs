// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use scopelog::config::{FileSinkOptions, MetricsOptions, PipelineOptions};
use scopelog_remote::{CollectorOptions, GrpcSinkOptions, PushSinkOptions};
use scopelog_sql::DbSinkOptions;
use serde::Deserialize;

pub const CONFIG_PATH_ENV: &str = "SCOPELOG_CONFIG";
pub const LOG_LEVEL_ENV: &str = "SCOPELOG_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IntakeOptions {
    pub host: String,
    pub port: u16,
    pub disabled: bool,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8127,
            disabled: false,
        }
    }
}

impl IntakeOptions {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub pipeline: PipelineOptions,
    pub file: FileSinkOptions,
    pub metrics: MetricsOptions,
    pub db: DbSinkOptions,
    pub grpc: GrpcSinkOptions,
    pub push: PushSinkOptions,
    pub intake: IntakeOptions,
    pub collector: CollectorOptions,
}

impl AgentConfig {
    /// `disabled` flag of every sink, keyed by sink name.
    pub fn disabled_flags(&self) -> [(&'static str, bool); 5] {
        [
            ("file", self.file.disabled),
            ("metrics", self.metrics.disabled),
            ("db", self.db.disabled),
            ("grpc", self.grpc.disabled),
            ("push", self.push.disabled),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.intake.address(), "127.0.0.1:8127");
        assert_eq!(config.grpc.buffer_time, Duration::from_secs(3));
        assert_eq!(config.push.log_method, "Logging");
        assert_eq!(config.collector.listen, None);
        assert_eq!(config.collector.buffer_time, Duration::from_secs(1));
        assert!(config.disabled_flags().iter().all(|(_, d)| !d));
    }

    #[test]
    fn test_yaml_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "agent.yaml",
                r#"
file:
  directory: /var/log/scopelog
  retain_file_count: 7
db:
  path: /var/lib/scopelog/logs.db
push:
  hub_url: ws://hub/logs
  excluded_scopes: [Tenant]
intake:
  port: 9000
collector:
  listen: "0.0.0.0:50051"
"#,
            )?;
            jail.set_env("SCOPELOG_PUSH__DISABLED", "true");
            jail.set_env("SCOPELOG_GRPC__BUFFER_TIME_MS", "250");
            jail.set_env("SCOPELOG_COLLECTOR__BUFFER_TIME_MS", "100");

            let config: AgentConfig =
                scopelog::config::load(Some(Path::new("agent.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.file.retain_file_count, 7);
            assert_eq!(config.intake.port, 9000);
            assert_eq!(config.push.excluded_scopes, vec!["Tenant".to_string()]);
            assert!(config.push.disabled);
            assert_eq!(config.grpc.buffer_time, Duration::from_millis(250));
            assert_eq!(config.disabled_flags()[4], ("push", true));
            assert_eq!(config.collector.listen.as_deref(), Some("0.0.0.0:50051"));
            assert_eq!(config.collector.buffer_time, Duration::from_millis(100));
            Ok(())
        });
    }
}
