// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Nested scope tracking.
//!
//! A [`ScopeStack`] is kept by every caller context ([`crate::LogContext`]) to
//! compute correlation fields. File workers keep a copy per [`ContextId`] to
//! decide when to fork and restore output files.
//!
//! ```text
//!   push(A) push(B{TraceId}) push(C)      pop(B)
//!   [A] -> [A, B] -> [A, B, C]        ->  [A]      (B and C removed)
//! ```

use crate::event::{keys, Correlation, PropertyValue, ScopeEntry};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one [`crate::LogContext`], unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeStack {
    entries: Vec<ScopeEntry>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ScopeEntry) {
        self.entries.push(entry);
    }

    /// Removes the last occurrence of `entry` and every entry pushed after it.
    ///
    /// Returns the removed entries in push order, or `None` when `entry` is not
    /// on the stack.
    pub fn pop(&mut self, entry: &ScopeEntry) -> Option<Vec<ScopeEntry>> {
        let index = self.entries.iter().rposition(|e| e == entry)?;
        Some(self.entries.split_off(index))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Last value stored under `key` across all active property scopes.
    pub fn find(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.iter().rev().find_map(|entry| entry.get(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Flattened plain labels, outermost first.
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|entry| entry.labels().map(str::to_string))
            .collect()
    }

    pub fn correlation(&self) -> Correlation {
        let text = |key: &str| self.find(key).map(PropertyValue::render);
        Correlation {
            // an id that does not parse counts as no service at all
            service_id: self.find(keys::SERVICE_ID).and_then(PropertyValue::as_uuid),
            service_description: text(keys::SERVICE_DESCRIPTION),
            trace_id: text(keys::TRACE_ID),
            operation: text(keys::OPERATION),
            operation_state: text(keys::OPERATION_STATE),
            contextual: text(keys::CONTEXTUAL),
        }
    }

    /// Name of the file output should be forked to for the current stack.
    pub fn fork_name(&self) -> Option<String> {
        let trace_id = self.find(keys::TRACE_ID).map(PropertyValue::render);
        let operation = self.find(keys::OPERATION).map(PropertyValue::render);
        fork_name(trace_id.as_deref(), operation.as_deref())
    }
}

/// Builds `"{trace_id} - {operation}"`, or whichever half is present.
pub fn fork_name(trace_id: Option<&str>, operation: Option<&str>) -> Option<String> {
    let trace_id = trace_id.map(str::trim).filter(|s| !s.is_empty());
    let operation = operation.map(str::trim).filter(|s| !s.is_empty());
    match (trace_id, operation) {
        (Some(t), Some(o)) => Some(format!("{t} - {o}")),
        (Some(t), None) => Some(t.to_string()),
        (None, Some(o)) => Some(o.to_string()),
        (None, None) => None,
    }
}

/// First state found among `entries`, innermost first.
pub fn operation_state(entries: &[ScopeEntry]) -> Option<String> {
    entries
        .iter()
        .rev()
        .find_map(|e| e.get(keys::OPERATION_STATE))
        .map(PropertyValue::render)
        .filter(|s| !s.is_empty())
}

/// Appends human readable scope transition markers from `previous` to `next`.
///
/// Scopes that closed are listed innermost first, then scopes that opened are
/// listed outermost first. When `category` is set it follows each opened scope.
pub fn render_transition(
    previous: &[String],
    next: &[String],
    category: Option<&str>,
    out: &mut String,
) {
    let common = previous
        .iter()
        .zip(next.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == previous.len() && common == next.len() {
        return;
    }

    out.push('\n');
    for j in (common..previous.len()).rev() {
        out.push_str(&format!("{}   End: {}\n", "-".repeat((j + 1) * 4), previous[j]));
    }
    if common < previous.len() && common < next.len() {
        out.push('\n');
    }
    for (j, label) in next.iter().enumerate().skip(common) {
        out.push_str(&format!("{} Begin: {}\n", "-".repeat((j + 1) * 4), label));
        if let Some(category) = category {
            out.push_str(category);
            out.push('\n');
        }
    }
    out.push('\n');
}
