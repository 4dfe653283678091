// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod dynamic;

use serde::{Deserialize, Serialize};

/// The identity a configuration update must match before it is applied.
#[derive(Debug, Deserialize, Serialize, Clone, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct Target {
    pub service: String,
    pub env: String,
}

/// Result of applying one configuration path, reported back per path. The
/// tracer is never left partially applied: an `Error` means the update had
/// no effect at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyState {
    Acknowledged,
    Error(String),
}

impl ApplyState {
    pub fn error(reason: impl Into<String>) -> Self {
        ApplyState::Error(reason.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ApplyState::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_state_error_helper() {
        let state = ApplyState::error("service mismatch");
        assert!(state.is_error());
        assert_eq!(state, ApplyState::Error("service mismatch".to_string()));
        assert!(!ApplyState::Acknowledged.is_error());
    }
}
