// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Start a tracer against a local agent, emit a few traces with client-side
//! stats and shut down cleanly.
//!
//! Run with an agent listening on localhost:8126:
//!     cargo run --example send-traces

use ddtrace::{Config, FinishOptions, StartSpanOptions, Tracer};
use std::time::Duration;

fn main() {
    let tracer = Tracer::start(
        Config::builder()
            .service("ddtrace-example")
            .env("testing")
            .version("1.0.0")
            .agent_url("http://localhost:8126")
            .sampling_rules(r#"[{"service":"ddtrace-example","sample_rate":1.0}]"#)
            .build(),
    );

    for request in 0..10 {
        let root = tracer.start_span(
            "http.request",
            StartSpanOptions {
                resource: Some(format!("GET /users/{}", request % 3)),
                span_type: Some("web".to_string()),
                ..Default::default()
            },
        );
        root.set_tag("http.method", "GET");
        root.set_tag("http.status_code", 200);

        let query = tracer.start_span(
            "postgres.query",
            StartSpanOptions {
                child_of: Some(root.context()),
                service: Some("ddtrace-example-db".to_string()),
                resource: Some("SELECT * FROM users WHERE id = $1".to_string()),
                span_type: Some("sql".to_string()),
                measured: true,
                ..Default::default()
            },
        );
        std::thread::sleep(Duration::from_millis(5));
        if request % 10 == 9 {
            query.finish_with(FinishOptions {
                error: true,
                error_message: Some("connection reset by peer".to_string()),
                error_type: Some("io".to_string()),
                ..Default::default()
            });
        } else {
            query.finish();
        }
        root.finish();
    }

    assert!(tracer.flush(Duration::from_secs(5)), "flush timed out");
    println!("sent 10 traces: {:?}", tracer.stats());
    tracer.stop();
}
