// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wall-clock aligned time buckets.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

fn span_nanos(span: Duration) -> i128 {
    i128::try_from(span.as_nanos()).unwrap_or(i128::MAX)
}

fn instant_nanos(instant: DateTime<Utc>) -> i128 {
    i128::from(instant.timestamp()) * 1_000_000_000
        + i128::from(instant.timestamp_subsec_nanos())
}

/// `instant - (instant mod span)`. A zero span returns `instant` unchanged.
pub fn truncate(instant: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    let span = span_nanos(span);
    if span == 0 {
        return instant;
    }
    let remainder = instant_nanos(instant).rem_euclid(span);
    let remainder = i64::try_from(remainder).unwrap_or(i64::MAX);
    instant - TimeDelta::nanoseconds(remainder)
}

/// Time left until the next multiple of `span`: `span - (now mod span)`.
pub fn until_next_boundary(now: DateTime<Utc>, span: Duration) -> Duration {
    let span_ns = span_nanos(span);
    if span_ns == 0 {
        return Duration::ZERO;
    }
    let remainder = instant_nanos(now).rem_euclid(span_ns);
    let wait = u64::try_from(span_ns - remainder).unwrap_or(u64::MAX);
    Duration::from_nanos(wait)
}
