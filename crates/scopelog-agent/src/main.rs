// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::{Path, PathBuf};

use scopelog::sink::DEFAULT_SHUTDOWN_GRACE;
use scopelog::Pipeline;
use scopelog_agent::collector::Collector;
use scopelog_agent::config::{AgentConfig, CONFIG_PATH_ENV, LOG_LEVEL_ENV};
use scopelog_agent::intake::Intake;
use scopelog_agent::sinks::{apply_disabled_flags, build_pipeline};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("h2=off,hyper=off,tower=off,tonic=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    debug!("Logging subsystem enabled");

    let config_path = env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let config: AgentConfig = scopelog::config::load(config_path.as_deref())?;

    let pipeline = build_pipeline(&config)?;
    pipeline.start().await;
    info!("AGENT | started {} sinks", pipeline.sinks().len());

    let cancel = CancellationToken::new();
    let intake = if config.intake.disabled {
        info!("AGENT | intake disabled");
        None
    } else {
        let socket = Intake::bind(&config.intake).await?;
        info!("AGENT | intake listening on {}", config.intake.address());
        let intake = Intake::new(pipeline.clone());
        Some(tokio::spawn(intake.spin(socket, cancel.clone())))
    };
    let collector = Collector::from_config(&config)?
        .map(|collector| tokio::spawn(collector.run(cancel.clone())));

    wait_for_shutdown(&pipeline, config_path.as_deref()).await?;

    info!("AGENT | shutting down");
    cancel.cancel();
    if let Some(task) = intake {
        if let Err(e) = task.await {
            error!("AGENT | intake terminated abnormally: {}", e);
        }
    }
    if let Some(task) = collector {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("AGENT | collector failed: {}", e),
            Err(e) => error!("AGENT | collector terminated abnormally: {}", e),
        }
    }
    pipeline.shutdown(DEFAULT_SHUTDOWN_GRACE).await;
    Ok(())
}

async fn reload(pipeline: &Pipeline, path: Option<&Path>) {
    match scopelog::config::load::<AgentConfig>(path) {
        Ok(config) => {
            info!("AGENT | configuration reloaded");
            apply_disabled_flags(pipeline, &config).await;
        }
        Err(e) => error!("AGENT | failed to reload configuration: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(pipeline: &Pipeline, path: Option<&Path>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => reload(pipeline, path).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_pipeline: &Pipeline, _path: Option<&Path>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
