// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Priority sampler fed by the agent's `rate_by_service` response.

use ddtrace_common::MutexExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key of the catch-all rate in the agent response.
const DEFAULT_RATE_KEY: &str = "service:,env:";

/// Rate applied before the first agent response arrives.
const INITIAL_DEFAULT_RATE: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct AgentSamplingResponse {
    rate_by_service: HashMap<String, f64>,
}

/// Per-(service, env) keep rates, swapped wholesale on every agent response.
#[derive(Debug)]
pub struct PrioritySampler {
    rates: Mutex<HashMap<String, f64>>,
}

impl Default for PrioritySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl PrioritySampler {
    pub fn new() -> Self {
        PrioritySampler {
            rates: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the rate table from an agent response body. Malformed bodies
    /// leave the previous table untouched.
    pub fn update_rates(&self, body: &[u8]) -> Result<(), serde_json::Error> {
        let response: AgentSamplingResponse = serde_json::from_slice(body)?;
        *self.rates.lock_or_panic() = response.rate_by_service;
        Ok(())
    }

    /// Rate for a service/env pair: exact entry, then the agent default
    /// entry, then the initial default of 1.0.
    pub fn rate_for(&self, service: &str, env: &str) -> f64 {
        let rates = self.rates.lock_or_panic();
        if let Some(rate) = rates.get(&format!("service:{service},env:{env}")) {
            return *rate;
        }
        rates
            .get(DEFAULT_RATE_KEY)
            .copied()
            .unwrap_or(INITIAL_DEFAULT_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_default_rate_one() {
        let sampler = PrioritySampler::new();
        assert_eq!(sampler.rate_for("web", "prod"), 1.0);
    }

    #[test]
    fn update_swaps_table_wholesale() {
        let sampler = PrioritySampler::new();
        sampler
            .update_rates(br#"{"rate_by_service":{"service:web,env:prod":0.25,"service:,env:":0.5}}"#)
            .unwrap();
        assert_eq!(sampler.rate_for("web", "prod"), 0.25);
        assert_eq!(sampler.rate_for("db", "prod"), 0.5);

        sampler
            .update_rates(br#"{"rate_by_service":{"service:db,env:prod":0.1}}"#)
            .unwrap();
        // The web entry is gone with the old table.
        assert_eq!(sampler.rate_for("web", "prod"), 1.0);
        assert_eq!(sampler.rate_for("db", "prod"), 0.1);
    }

    #[test]
    fn malformed_response_keeps_previous_table() {
        let sampler = PrioritySampler::new();
        sampler
            .update_rates(br#"{"rate_by_service":{"service:web,env:prod":0.25}}"#)
            .unwrap();
        assert!(sampler.update_rates(b"{not json").is_err());
        assert!(sampler.update_rates(br#"{"rates":{}}"#).is_err());
        assert_eq!(sampler.rate_for("web", "prod"), 0.25);
    }
}
