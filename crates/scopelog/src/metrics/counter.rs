// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::Severity;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU32, Ordering};

/// Five per-level counts. Trace is never counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCounts {
    pub debug: u32,
    pub info: u32,
    pub warning: u32,
    pub error: u32,
    pub critical: u32,
}

impl LevelCounts {
    pub fn total(&self) -> u64 {
        u64::from(self.debug)
            + u64::from(self.info)
            + u64::from(self.warning)
            + u64::from(self.error)
            + u64::from(self.critical)
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for LevelCounts {
    fn add_assign(&mut self, other: Self) {
        self.debug = self.debug.saturating_add(other.debug);
        self.info = self.info.saturating_add(other.info);
        self.warning = self.warning.saturating_add(other.warning);
        self.error = self.error.saturating_add(other.error);
        self.critical = self.critical.saturating_add(other.critical);
    }
}

/// Counts for one dimension key within the current sampling window.
#[derive(Debug, Default)]
pub struct MetricCounter {
    debug: AtomicU32,
    info: AtomicU32,
    warning: AtomicU32,
    error: AtomicU32,
    critical: AtomicU32,
}

impl MetricCounter {
    pub fn track(&self, severity: Severity) {
        let slot = match severity {
            Severity::Trace => return,
            Severity::Debug => &self.debug,
            Severity::Information => &self.info,
            Severity::Warning => &self.warning,
            Severity::Error => &self.error,
            Severity::Critical => &self.critical,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counts and resets each to zero.
    pub fn take(&self) -> LevelCounts {
        LevelCounts {
            debug: self.debug.swap(0, Ordering::Relaxed),
            info: self.info.swap(0, Ordering::Relaxed),
            warning: self.warning.swap(0, Ordering::Relaxed),
            error: self.error.swap(0, Ordering::Relaxed),
            critical: self.critical.swap(0, Ordering::Relaxed),
        }
    }
}
