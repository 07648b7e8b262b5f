// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `{{variable}}` substitution.
//!
//! Unknown variables are left verbatim so a half-configured request still
//! round-trips visibly instead of silently collapsing to an empty string.

use serde_json::{Map, Value};

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces every `{{ name }}` occurrence with its variable value and
/// returns the result plus the number of substitutions made.
pub fn interpolate_counting(input: &str, variables: &Map<String, Value>) -> (String, usize) {
    let mut out = String::with_capacity(input.len());
    let mut substitutions = 0;
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // Unclosed reference; emit the tail verbatim.
            break;
        };
        out.push_str(&rest[..open]);
        let name = after_open[..close].trim();
        match variables.get(name) {
            Some(value) => {
                out.push_str(&value_to_string(value));
                substitutions += 1;
            },
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    (out, substitutions)
}

/// [`interpolate_counting`] without the count.
pub fn interpolate(input: &str, variables: &Map<String, Value>) -> String {
    interpolate_counting(input, variables).0
}
