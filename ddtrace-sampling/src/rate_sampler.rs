// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic rate sampling over trace identifiers.

/// Knuth's multiplicative hashing constant.
const KNUTH_FACTOR: u64 = 1111111111111111111;

/// Decide keep/drop for an id at the given rate.
///
/// The id is spread over the u64 space with a Knuth multiplicative hash and
/// compared against `rate * 2^64`; the same id and rate always produce the
/// same answer, in this process and in every other tracer implementing the
/// same constant.
pub fn sampled_by_rate(id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let threshold = (rate * (u64::MAX as f64 + 1.0)) as u64;
    id.wrapping_mul(KNUTH_FACTOR) < threshold
}
