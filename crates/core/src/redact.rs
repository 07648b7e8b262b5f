// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Server-side redaction of sensitive session variables.
//!
//! Applied when session state is returned to a client. Writes always store
//! the original values; only the read path is redacted.

use serde_json::Value;

/// Substrings that mark a key as sensitive (matched case-insensitively).
const SENSITIVE_MARKERS: [&str; 7] =
    ["token", "password", "secret", "apikey", "authorization", "bearer", "cookie"];

/// The literal that replaces redacted values.
pub const REDACTED: &str = "[REDACTED]";

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Recursively replaces values under sensitive keys with `"[REDACTED]"`.
///
/// The walk descends through objects and arrays of objects; arrays of
/// primitives are left untouched. A sensitive key's value is replaced
/// wholesale, whatever its shape.
pub fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_in_place(entry);
                }
            }
        },
        Value::Array(items) => {
            for item in items.iter_mut() {
                if item.is_object() || item.is_array() {
                    redact_in_place(item);
                }
            }
        },
        _ => {},
    }
}

/// Returns a redacted copy, leaving the original untouched.
pub fn redacted(value: &Value) -> Value {
    let mut copy = value.clone();
    redact_in_place(&mut copy);
    copy
}
