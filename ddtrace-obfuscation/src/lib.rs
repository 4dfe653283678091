// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod redis;
pub mod sql;

/// Obfuscation version implemented by this client. Compared against the
/// version the agent advertises before stats keys are formed from raw
/// resources.
pub const OBFUSCATION_VERSION: u32 = 1;

/// Obfuscate a span resource before it is used as a stats aggregation key,
/// dispatching on the span type the way the agent does.
pub fn obfuscate_resource(span_type: &str, resource: &str) -> String {
    match span_type {
        "sql" | "cassandra" => sql::obfuscate_sql_string(resource),
        "redis" => redis::obfuscate_redis_string(resource),
        _ => resource.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_span_type() {
        assert_eq!(
            obfuscate_resource("sql", "SELECT * FROM t WHERE id = 42"),
            "SELECT * FROM t WHERE id = ?"
        );
        assert_eq!(obfuscate_resource("redis", "SET mykey somevalue"), "SET mykey ?");
        assert_eq!(obfuscate_resource("web", "GET /users/42"), "GET /users/42");
    }
}
