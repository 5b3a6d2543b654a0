// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use scopelog::config::{FileSinkOptions, MetricsOptions};
use scopelog::metrics::{DimensionKey, InMemoryMetricsStore, LevelCounts};
use scopelog::{keys, FileSink, LogContext, MetricsAggregator, Pipeline, PropertyValue, ScopeEntry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == "log") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn names(dir: &Path) -> Vec<String> {
    log_files(dir)
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect()
}

fn file_pipeline(dir: &TempDir) -> Pipeline {
    let sink = FileSink::new(FileSinkOptions {
        directory: Some(dir.path().to_path_buf()),
        buffer_time: Duration::from_millis(100),
        include_scopes: false,
        ..FileSinkOptions::default()
    });
    Pipeline::builder().sink(Arc::new(sink)).build()
}

#[tokio::test]
async fn test_uncorrelated_events_land_in_one_general_file() {
    let tmp = TempDir::new().unwrap();
    let pipeline = file_pipeline(&tmp);
    pipeline.start().await;

    let logger = pipeline.logger("Host");
    let ctx = LogContext::new();
    for i in 0..5 {
        logger.info(&ctx, format!("event {i}"));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let general = tmp.path().join("General");
    let files = log_files(&general);
    assert_eq!(files.len(), 1);
    let text = fs::read_to_string(&files[0]).unwrap();
    let positions: Vec<usize> = (0..5)
        .map(|i| text.find(&format!("event {i}")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_trace_scope_file_is_renamed_with_state() {
    let tmp = TempDir::new().unwrap();
    let pipeline = file_pipeline(&tmp);
    pipeline.start().await;

    let logger = pipeline.logger("xUnit");
    let trace_id = Uuid::new_v4().to_string();
    let mut ctx = LogContext::new();

    let job = ScopeEntry::properties([
        (keys::TRACE_ID, trace_id.as_str()),
        (keys::OPERATION, "xUnit"),
    ]);
    logger.scoped(&mut ctx, job.clone(), |logger, ctx| {
        logger.info(ctx, "first run");
    });

    logger.scoped(&mut ctx, job, |logger, ctx| {
        logger.info(ctx, "second run");
        logger.scoped(
            ctx,
            ScopeEntry::properties([(keys::OPERATION_STATE, "Succeeded")]),
            |logger, ctx| logger.info(ctx, "done"),
        );
    });
    pipeline.shutdown(Duration::from_secs(5)).await;

    let files = names(&tmp.path().join("General"));
    let renamed = format!("{trace_id} - xUnit_Succeeded.log");
    assert!(files.contains(&renamed), "{files:?}");
    assert!(!files.contains(&format!("{trace_id} - xUnit.log")), "{files:?}");

    let path = log_files(tmp.path())
        .into_iter()
        .find(|p| p.ends_with(&renamed))
        .unwrap();
    let text = fs::read_to_string(path).unwrap();
    assert!(text.contains("first run"));
    assert!(text.contains("second run"));
    assert!(text.contains("done"));
}

#[tokio::test]
async fn test_repeated_trace_with_state_is_disambiguated() {
    let tmp = TempDir::new().unwrap();
    let pipeline = file_pipeline(&tmp);
    pipeline.start().await;

    let logger = pipeline.logger("xUnit");
    let mut ctx = LogContext::new();
    for _ in 0..2 {
        let scope = ScopeEntry::properties([
            (keys::TRACE_ID, "X"),
            (keys::OPERATION, "Y"),
            (keys::OPERATION_STATE, "Succeeded"),
        ]);
        logger.scoped(&mut ctx, scope, |logger, ctx| logger.info(ctx, "work"));
    }
    pipeline.shutdown(Duration::from_secs(5)).await;

    let files = names(tmp.path());
    assert!(files.contains(&"X - Y_Succeeded.log".to_string()), "{files:?}");
    assert!(files.contains(&"X - Y_Succeeded (1).log".to_string()), "{files:?}");
    assert!(!files.contains(&"X - Y.log".to_string()), "{files:?}");
}

#[tokio::test]
async fn test_interleaved_contexts_fork_independently() {
    let tmp = TempDir::new().unwrap();
    let pipeline = file_pipeline(&tmp);
    pipeline.start().await;

    let logger = pipeline.logger("Jobs");
    let mut alpha = LogContext::new();
    let mut beta = LogContext::new();
    let alpha_job = ScopeEntry::properties([(keys::TRACE_ID, "AAAA"), (keys::OPERATION, "Alpha")]);
    let beta_job = ScopeEntry::properties([(keys::TRACE_ID, "BBBB"), (keys::OPERATION, "Beta")]);
    let done = ScopeEntry::properties([(keys::OPERATION_STATE, "Succeeded")]);

    logger.begin_scope(&mut alpha, alpha_job.clone());
    logger.begin_scope(&mut beta, beta_job.clone());
    logger.info(&alpha, "alpha line");
    logger.begin_scope(&mut alpha, done.clone());
    logger.end_scope(&mut alpha, &done);
    logger.end_scope(&mut alpha, &alpha_job);
    logger.info(&beta, "beta line");
    logger.end_scope(&mut beta, &beta_job);
    pipeline.shutdown(Duration::from_secs(5)).await;

    let files = log_files(tmp.path());
    let read = |name: &str| {
        files
            .iter()
            .find(|p| p.ends_with(name))
            .map(|p| fs::read_to_string(p).unwrap())
            .unwrap_or_else(|| panic!("{name} missing from {files:?}"))
    };

    let alpha_text = read("AAAA - Alpha_Succeeded.log");
    assert!(alpha_text.contains("alpha line"));
    assert!(!alpha_text.contains("beta line"));
    let beta_text = read("BBBB - Beta.log");
    assert!(beta_text.contains("beta line"));
    assert!(!beta_text.contains("alpha line"));

    let names = names(tmp.path());
    assert!(!names.contains(&"BBBB - Beta_Succeeded.log".to_string()), "{names:?}");
    assert!(!names.contains(&"AAAA - Alpha.log".to_string()), "{names:?}");

    let general = log_files(&tmp.path().join("General"))
        .into_iter()
        .filter(|p| !p.to_string_lossy().contains(" - "))
        .map(|p| fs::read_to_string(p).unwrap())
        .collect::<String>();
    assert!(!general.contains("alpha line"));
    assert!(!general.contains("beta line"));
}

#[tokio::test]
async fn test_service_scope_writes_under_description_folder() {
    let tmp = TempDir::new().unwrap();
    let pipeline = file_pipeline(&tmp);
    pipeline.start().await;

    let logger = pipeline.logger("Billing");
    let mut ctx = LogContext::new();
    let service = ScopeEntry::properties([
        (keys::SERVICE_ID, PropertyValue::Uuid(Uuid::new_v4())),
        (keys::SERVICE_DESCRIPTION, PropertyValue::Text("Invoices".into())),
    ]);
    logger.scoped(&mut ctx, service, |logger, ctx| logger.info(ctx, "issued"));

    let broken = ScopeEntry::properties([(keys::SERVICE_ID, "not-a-guid")]);
    logger.scoped(&mut ctx, broken, |logger, ctx| logger.info(ctx, "uncorrelated"));
    pipeline.shutdown(Duration::from_secs(5)).await;

    let invoices = log_files(&tmp.path().join("Invoices"));
    assert_eq!(invoices.len(), 1);
    assert!(fs::read_to_string(&invoices[0]).unwrap().contains("issued"));

    let general = log_files(&tmp.path().join("General"));
    assert_eq!(general.len(), 1);
    assert!(fs::read_to_string(&general[0])
        .unwrap()
        .contains("uncorrelated"));
}

#[tokio::test]
async fn test_metrics_cycle_counts_levels_per_category() {
    let store = Arc::new(InMemoryMetricsStore::default());
    let aggregator = Arc::new(MetricsAggregator::new(
        MetricsOptions {
            sample_rate: Duration::from_millis(200),
            disabled: false,
        },
        store.clone(),
    ));
    let pipeline = Pipeline::builder().sink(aggregator).build();
    pipeline.start().await;

    let logger = pipeline.logger("Auth");
    let ctx = LogContext::new();
    logger.error(&ctx, "bad password");
    logger.error(&ctx, "bad password");
    logger.warn(&ctx, "slow login");
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.shutdown(Duration::from_secs(5)).await;

    let rows = store.rows_for(&DimensionKey::Category("Auth".into()));
    let mut sum = LevelCounts::default();
    for (_, counts) in rows {
        sum += counts;
    }
    assert_eq!(
        sum,
        LevelCounts {
            error: 2,
            warning: 1,
            ..LevelCounts::default()
        }
    );
}
