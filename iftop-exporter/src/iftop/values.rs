// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Parsing of the human-readable rate/size tokens printed by `iftop`.
//!
//! `iftop` prints values such as `7.52Kb`, `1.88KB` or `369Kb`. The trailing
//! letter selects bits (`b`) or bytes (`B`); the SI prefix uses the 1024 base.

/// Parse an `iftop` value token into bits (bits per second for rate columns).
///
/// Byte-suffixed values are multiplied by 8. Unparseable input yields 0.0 so
/// that a single garbled token never aborts a report round.
pub fn parse_value_to_bits(token: &str) -> f64 {
    let token = token.trim();

    let (token, byte_suffixed) = match token.strip_suffix('B') {
        Some(rest) => (rest, true),
        None => (token.strip_suffix('b').unwrap_or(token), false),
    };

    let (digits, multiplier) = match token.char_indices().next_back() {
        Some((i, c)) => match prefix_multiplier(c) {
            Some(multiplier) => (&token[..i], multiplier),
            None => (token, 1.0),
        },
        None => (token, 1.0),
    };

    let value = match digits.parse::<f64>() {
        Ok(v) => v * multiplier,
        Err(_) => return 0.0,
    };

    if byte_suffixed { value * 8.0 } else { value }
}

/// Parse a cumulative-column token into bytes.
pub fn parse_value_to_bytes(token: &str) -> f64 {
    parse_value_to_bits(token) / 8.0
}

fn prefix_multiplier(c: char) -> Option<f64> {
    const K: f64 = 1024.0;
    match c {
        'K' => Some(K),
        'M' => Some(K * K),
        'G' => Some(K * K * K),
        'T' => Some(K * K * K * K),
        _ => None,
    }
}
