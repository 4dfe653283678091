// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span and trace identifier generation.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a non-zero 64-bit span identifier.
pub fn rand_span_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Generate a 128-bit trace identifier split in two halves.
///
/// The upper half carries the unix timestamp in seconds in its top 32 bits
/// so backends can time-partition on the id; the lower half is fully random
/// and is the part legacy payloads and the sampling hash use.
pub fn rand_trace_id() -> (u64, u64) {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let upper = seconds << 32;
    (rand_span_id(), upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_ids_are_nonzero() {
        for _ in 0..1000 {
            assert_ne!(rand_span_id(), 0);
        }
    }

    #[test]
    fn trace_id_upper_half_encodes_seconds() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let (_, upper) = rand_trace_id();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let encoded = upper >> 32;
        assert!(encoded >= before && encoded <= after);
        assert_eq!(upper & 0xFFFF_FFFF, 0);
    }
}
