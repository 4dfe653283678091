// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket limiter used by the trace-rule sampler and the single-span
//! rule limiters.

use crate::MutexExt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket refilled at `rate` tokens per second with a burst equal to
/// `ceil(rate)` (minimum one token).
///
/// Besides the keep/deny decision the limiter tracks how many requests it
/// allowed out of how many it saw, averaged over the previous and current
/// one-second windows. That ratio is reported on sampled root spans.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    last_refill: Instant,
    window_start: Instant,
    allowed_cur: f64,
    seen_cur: f64,
    allowed_prev: f64,
    seen_prev: f64,
}

/// Outcome of one limiter consultation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterResult {
    pub allowed: bool,
    /// allowed/seen averaged over the previous and current second.
    pub effective_rate: f64,
}

impl RateLimiter {
    /// `rate` is the sustained tokens-per-second budget. A negative rate
    /// disables limiting entirely; a zero rate denies everything.
    pub fn new(rate: f64) -> Self {
        let burst = rate.ceil().max(1.0);
        let now = Instant::now();
        RateLimiter {
            rate,
            burst,
            state: Mutex::new(LimiterState {
                tokens: burst,
                last_refill: now,
                window_start: now,
                allowed_cur: 0.0,
                seen_cur: 0.0,
                allowed_prev: 0.0,
                seen_prev: 0.0,
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Ask for one token now.
    pub fn allow_one(&self) -> LimiterResult {
        self.allow_one_at(Instant::now())
    }

    /// Ask for one token at an explicit instant. Exposed so callers with
    /// their own clock (and tests) stay deterministic.
    pub fn allow_one_at(&self, now: Instant) -> LimiterResult {
        if self.rate < 0.0 {
            return LimiterResult {
                allowed: true,
                effective_rate: 1.0,
            };
        }

        let mut state = self.state.lock_or_panic();
        state.rotate_windows(now);

        let allowed = if self.rate == 0.0 {
            false
        } else {
            let elapsed = now.saturating_duration_since(state.last_refill);
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
            state.last_refill = now;
            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                true
            } else {
                false
            }
        };

        state.seen_cur += 1.0;
        if allowed {
            state.allowed_cur += 1.0;
        }

        LimiterResult {
            allowed,
            effective_rate: state.effective_rate(),
        }
    }
}

impl LimiterState {
    fn rotate_windows(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return;
        }
        if elapsed < Duration::from_secs(2) {
            self.allowed_prev = self.allowed_cur;
            self.seen_prev = self.seen_cur;
        } else {
            // More than a full window went by with no traffic.
            self.allowed_prev = 0.0;
            self.seen_prev = 0.0;
        }
        self.allowed_cur = 0.0;
        self.seen_cur = 0.0;
        self.window_start = now;
    }

    fn effective_rate(&self) -> f64 {
        let seen = self.seen_prev + self.seen_cur;
        if seen == 0.0 {
            return 1.0;
        }
        (self.allowed_prev + self.allowed_cur) / seen
    }
}
