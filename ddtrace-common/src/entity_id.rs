// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort container identity for the `datadog-container-id` header.

use regex::Regex;
use std::sync::OnceLock;

const CGROUP_PATH: &str = "/proc/self/cgroup";

// 64-hex container ids, ECS/Fargate task ids, and GC'd 8-4-4-4-12 uuids.
const CONTAINER_SOURCE: &str = "[0-9a-f]{64}|[0-9a-f]{32}-[0-9]{10}|[0-9a-f]{8}(-[0-9a-f]{4}){4}$";

fn extract_container_id(content: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(CONTAINER_SOURCE).ok())
        .as_ref()?;
    content
        .lines()
        .filter_map(|line| line.rsplit('/').next())
        .find_map(|segment| pattern.find(segment).map(|m| m.as_str().to_string()))
}

/// Container id read from the cgroup file, memoized for the process
/// lifetime. `None` outside containers or on non-linux hosts.
pub fn get_container_id() -> Option<&'static str> {
    static CONTAINER_ID: OnceLock<Option<String>> = OnceLock::new();
    CONTAINER_ID
        .get_or_init(|| {
            std::fs::read_to_string(CGROUP_PATH)
                .ok()
                .and_then(|content| extract_container_id(&content))
        })
        .as_deref()
}
