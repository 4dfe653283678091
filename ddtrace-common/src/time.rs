// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monotonic-adjusted wall clock.
//!
//! Span timestamps must be unix nanoseconds, but durations must not jump
//! when the wall clock is stepped. The clock anchors a `SystemTime` reading
//! to an `Instant` once per process and derives every later reading from the
//! monotonic offset.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct Anchor {
    wall_nanos: i64,
    instant: Instant,
}

fn anchor() -> &'static Anchor {
    static ANCHOR: OnceLock<Anchor> = OnceLock::new();
    ANCHOR.get_or_init(|| Anchor {
        wall_nanos: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        instant: Instant::now(),
    })
}

/// Current unix time in nanoseconds, monotonic after process start.
pub fn now_nanos() -> i64 {
    let anchor = anchor();
    anchor.wall_nanos + anchor.instant.elapsed().as_nanos() as i64
}

/// Convert a `SystemTime` into unix nanoseconds, clamping pre-epoch values
/// to zero.
pub fn system_time_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
