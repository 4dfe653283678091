// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL resource obfuscation.
//!
//! Replaces literals with `?` so query resources have bounded cardinality.
//! The scan is token based: the query is cut at splitter bytes found outside
//! single-quoted strings, and each token is classified by its first few
//! characters. No SQL grammar is involved and no context-sensitive decision
//! is made, unlike the exhaustive agent-side obfuscator.

/// Bytes that end a token when they appear outside a quoted string.
fn splits_tokens(b: u8) -> bool {
    matches!(
        b,
        b',' | b'(' | b')' | b'|' | b' ' | b'\t' | b'\n' | b'\r' |
        0x0B | // vertical tab
        0x0C // form feed
    )
}

/// Walks the query bytes and yields the end of each token, skipping
/// splitters inside quoted strings (with backslash escapes).
struct TokenScanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> TokenScanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        TokenScanner { bytes, pos: 0 }
    }

    /// Returns the (start, end) of the next token, where `end` is either the
    /// index of the splitter byte that terminated it or the input length.
    fn next_token(&mut self) -> Option<(usize, usize)> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        let mut quoted = false;
        let mut escaped = false;
        let mut end = self.bytes.len();
        for (offset, b) in self.bytes.iter().copied().enumerate().skip(start) {
            if b == b'\'' && !escaped {
                quoted = !quoted;
                continue;
            }
            escaped = (b == b'\\') && !escaped;
            if !quoted && splits_tokens(b) {
                end = offset;
                break;
            }
        }
        self.pos = end + 1;
        Some((start, end))
    }
}

fn is_quoted_literal(token: &[u8]) -> bool {
    token.len() >= 2 && token[0] == b'\'' && token[token.len() - 1] == b'\''
}

fn is_hex_literal(token: &[u8]) -> bool {
    token.len() >= 2 && (token[0] | b' ') == b'x' && token[1] == b'\''
}

fn is_numeric_literal(token: &[u8]) -> bool {
    // A leading sign, dot or digit marks a number, except for `--` which
    // introduces a comment.
    matches!(token[0], b'0'..=b'9' | b'-' | b'+' | b'.')
        && !(token.len() > 1 && token[0] == b'-' && token[1] == b'-')
}

/// Obfuscate an SQL string by replacing literals with `?` characters.
pub fn obfuscate_sql_string(query: &str) -> String {
    let bytes = query.as_bytes();
    let mut obfuscated = String::with_capacity(query.len());
    let mut scanner = TokenScanner::new(bytes);

    while let Some((start, end)) = scanner.next_token() {
        let token = &bytes[start..end];
        match token.len() {
            0 => {}
            1 => {
                if token[0].is_ascii_digit() {
                    obfuscated.push('?');
                } else {
                    obfuscated.push_str(&query[start..end]);
                }
            }
            _ => {
                if is_numeric_literal(token) || is_quoted_literal(token) || is_hex_literal(token) {
                    obfuscated.push('?');
                } else {
                    obfuscated.push_str(&query[start..end]);
                }
            }
        }
        if end < bytes.len() {
            obfuscated.push(bytes[end] as char);
        }
    }
    obfuscated
}
