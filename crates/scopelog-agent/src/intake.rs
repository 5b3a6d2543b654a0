// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP intake for local processes.
//!
//! Each datagram holds newline-delimited JSON commands. A command names the
//! logical `context` it belongs to; the intake keeps one [`LogContext`] per
//! context so scopes opened by one sender never leak into another.

use crate::config::IntakeOptions;
use scopelog::{LogContext, Pipeline, ScopeEntry, Severity};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

const BUFFER_SIZE: usize = 65_507;

fn default_level() -> Severity {
    Severity::Information
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntakeCommand {
    Log {
        context: String,
        category: String,
        #[serde(default = "default_level")]
        level: Severity,
        message: String,
        #[serde(default)]
        exception: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    BeginScope {
        context: String,
        category: String,
        scope: ScopeEntry,
    },
    EndScope {
        context: String,
        category: String,
        scope: ScopeEntry,
    },
}

pub struct Intake {
    pipeline: Pipeline,
    contexts: HashMap<String, LogContext>,
}

impl Intake {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            contexts: HashMap::new(),
        }
    }

    pub async fn bind(options: &IntakeOptions) -> std::io::Result<UdpSocket> {
        UdpSocket::bind(options.address()).await
    }

    /// Receives datagrams until `cancel` fires.
    pub async fn spin(mut self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.consume(&buf[..len], src),
                    Err(e) => error!("INTAKE | failed to receive datagram: {}", e),
                },
            }
        }
        debug!("INTAKE | stopped with {} open contexts", self.contexts.len());
    }

    fn consume(&mut self, datagram: &[u8], src: SocketAddr) {
        let Ok(text) = std::str::from_utf8(datagram) else {
            error!("INTAKE | dropping non UTF-8 datagram from {}", src);
            return;
        };
        trace!("INTAKE | received {} bytes from {}", datagram.len(), src);
        for line in text.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<IntakeCommand>(line) {
                Ok(command) => self.apply(command),
                Err(e) => error!("INTAKE | skipping malformed command from {}: {}", src, e),
            }
        }
    }

    pub fn apply(&mut self, command: IntakeCommand) {
        match command {
            IntakeCommand::Log {
                context,
                category,
                level,
                message,
                exception,
                tenant_id,
            } => {
                let logger = self.pipeline.logger(category);
                let mut transient = LogContext::new();
                let ctx = self.contexts.get_mut(&context).unwrap_or(&mut transient);
                if let Some(tenant_id) = tenant_id {
                    ctx.set_tenant(tenant_id);
                }
                match exception {
                    Some(exception) => logger.log_exception(ctx, level, message, exception),
                    None => logger.log(ctx, level, message),
                }
            }
            IntakeCommand::BeginScope {
                context,
                category,
                scope,
            } => {
                let ctx = self.contexts.entry(context).or_default();
                self.pipeline.logger(category).begin_scope(ctx, scope);
            }
            IntakeCommand::EndScope {
                context,
                category,
                scope,
            } => {
                let Some(ctx) = self.contexts.get_mut(&context) else {
                    debug!("INTAKE | end_scope for unknown context {}", context);
                    return;
                };
                self.pipeline.logger(category).end_scope(ctx, &scope);
                if ctx.is_empty() {
                    self.contexts.remove(&context);
                }
            }
        }
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts.len()
    }
}
