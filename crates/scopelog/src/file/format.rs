// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::LogEvent;
use chrono::{DateTime, Local, Utc};

/// `HH:mm:ss.ff` in local time.
pub fn timestamp(instant: DateTime<Utc>) -> String {
    let local = instant.with_timezone(&Local);
    let hundredths = (local.timestamp_subsec_millis() / 10).min(99);
    format!("{}.{:02}", local.format("%H:%M:%S"), hundredths)
}

/// Renders one event.
///
/// With `message_only` the category is left out because the surrounding scope
/// markers already identify the context.
pub fn format_event(event: &LogEvent, message_only: bool, out: &mut String) {
    out.push_str(&timestamp(event.timestamp));
    out.push(' ');
    out.push_str(event.severity.short_code());
    out.push_str(": ");
    if message_only {
        out.push_str(&event.message);
    } else {
        out.push_str(&event.category);
        out.push('\n');
        out.push_str(&event.message);
    }
    out.push('\n');
    if let Some(exception) = event.exception.as_deref().filter(|e| !e.is_empty()) {
        out.push_str(exception);
        if !exception.ends_with('\n') {
            out.push('\n');
        }
    }
}

/// Replaces characters that cannot appear in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;

    #[test]
    fn test_timestamp_shape() {
        let stamp = timestamp(Utc::now());
        assert_eq!(stamp.len(), 11);
        assert_eq!(&stamp[2..3], ":");
        assert_eq!(&stamp[5..6], ":");
        assert_eq!(&stamp[8..9], ".");
    }

    #[test]
    fn test_format_with_category() {
        let event = LogEvent::new("Auth", Severity::Warning, "token expired");
        let mut out = String::new();
        format_event(&event, false, &mut out);
        let expected = format!("{} WRN: Auth\ntoken expired\n", timestamp(event.timestamp));
        assert_eq!(out, expected);
    }

    #[test]
    fn test_format_message_only_with_exception() {
        let event = LogEvent::new("Auth", Severity::Error, "boom")
            .with_exception("Error: boom\n  at handler");
        let mut out = String::new();
        format_event(&event, true, &mut out);
        let expected = format!(
            "{} ERR: boom\nError: boom\n  at handler\n",
            timestamp(event.timestamp)
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_file_name("job 1 - Import"), "job 1 - Import");
        assert_eq!(sanitize_file_name("  "), "_");
        assert_eq!(sanitize_file_name("name."), "name");
    }
}
