// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! cURL and Postman importers.
//!
//! Both convert foreign request descriptions into `.http` text plus
//! per-item diagnostics. Preview never writes; apply goes through the
//! workspace path gate. Clean imports answer 200, partial ones 207, and
//! error findings block apply with 422 unless `force` is set.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use treq_api::{ImportDiagnostic, ImportPreviewResponse, Severity};
use treq_core::{Error, Result};

/// Outcome of a conversion, before it is wrapped for preview or apply.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub content: String,
    pub imported: usize,
    pub skipped: usize,
    pub diagnostics: Vec<ImportDiagnostic>,
}

impl ImportOutcome {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    /// Partial imports (skips or warnings) answer 207 instead of 200.
    pub fn is_partial(&self) -> bool {
        self.skipped > 0 || !self.diagnostics.is_empty()
    }

    pub fn into_preview(self) -> ImportPreviewResponse {
        ImportPreviewResponse {
            content: self.content,
            imported: self.imported,
            skipped: self.skipped,
            diagnostics: self.diagnostics,
        }
    }
}

fn finding(severity: Severity, code: &str, message: String, item: Option<String>) -> ImportDiagnostic {
    ImportDiagnostic { severity, code: code.to_string(), message, item }
}

/// Dispatches on the importer kind from the route.
pub fn convert(kind: &str, content: &str) -> Result<ImportOutcome> {
    match kind {
        "curl" => Ok(curl_to_http(content)),
        "postman" => Ok(postman_to_http(content)),
        other => Err(Error::validation(format!("unknown importer {other}"))),
    }
}

// --- cURL ---

/// Splits a shell-ish command line into tokens, honoring single/double
/// quotes, backslash escapes, and line continuations.
fn shell_tokens(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            Some('\'') => {
                if ch == '\'' {
                    quote = None;
                } else {
                    current.push(ch);
                }
            },
            Some('"') => match ch {
                '"' => quote = None,
                '\\' => {
                    if let Some(&next) = chars.peek() {
                        if matches!(next, '"' | '\\' | '$' | '`') {
                            current.push(next);
                            let _ = chars.next();
                        } else {
                            current.push(ch);
                        }
                    }
                },
                _ => current.push(ch),
            },
            _ => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_token = true;
                },
                '\\' => {
                    // Line continuation or escaped character.
                    if let Some(&next) = chars.peek() {
                        if next != '\n' {
                            current.push(next);
                            in_token = true;
                        }
                        let _ = chars.next();
                    }
                },
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                },
                c => {
                    current.push(c);
                    in_token = true;
                },
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Converts a cURL command line into a single `.http` block.
#[allow(clippy::too_many_lines)]
pub fn curl_to_http(command: &str) -> ImportOutcome {
    let mut diagnostics = Vec::new();
    let tokens = shell_tokens(command);
    let mut iter = tokens.iter().map(String::as_str).peekable();

    match iter.peek() {
        Some(&"curl") => {
            let _ = iter.next();
        },
        _ => diagnostics.push(finding(
            Severity::Warning,
            "not-a-curl-command",
            "input does not start with 'curl'".to_string(),
            None,
        )),
    }

    let mut method: Option<String> = None;
    let mut url: Option<String> = None;
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut data_parts: Vec<String> = Vec::new();

    while let Some(token) = iter.next() {
        match token {
            "-X" | "--request" => {
                if let Some(value) = iter.next() {
                    method = Some(value.to_uppercase());
                }
            },
            "-H" | "--header" => {
                if let Some(value) = iter.next() {
                    match value.split_once(':') {
                        Some((name, header_value)) => {
                            headers.push((name.trim().to_string(), header_value.trim().to_string()));
                        },
                        None => diagnostics.push(finding(
                            Severity::Warning,
                            "malformed-header",
                            format!("header without a colon: {value}"),
                            None,
                        )),
                    }
                }
            },
            "-d" | "--data" | "--data-raw" | "--data-binary" | "--data-ascii" => {
                if let Some(value) = iter.next() {
                    data_parts.push(value.to_string());
                }
            },
            "-u" | "--user" => {
                if let Some(value) = iter.next() {
                    headers.push((
                        "Authorization".to_string(),
                        format!("Basic {}", BASE64.encode(value)),
                    ));
                }
            },
            "-b" | "--cookie" => {
                if let Some(value) = iter.next() {
                    headers.push(("Cookie".to_string(), value.to_string()));
                }
            },
            "-A" | "--user-agent" => {
                if let Some(value) = iter.next() {
                    headers.push(("User-Agent".to_string(), value.to_string()));
                }
            },
            "-e" | "--referer" => {
                if let Some(value) = iter.next() {
                    headers.push(("Referer".to_string(), value.to_string()));
                }
            },
            "--url" => {
                if let Some(value) = iter.next() {
                    url = Some(value.to_string());
                }
            },
            // Common no-argument flags that do not change the request text.
            "-s" | "--silent" | "-v" | "--verbose" | "-L" | "--location" | "-k" | "--insecure"
            | "--compressed" | "-i" | "--include" => {},
            "-F" | "--form" | "-o" | "--output" | "-T" | "--upload-file" => {
                let _ = iter.next();
                diagnostics.push(finding(
                    Severity::Warning,
                    "unsupported-option",
                    format!("cURL option {token} is not supported and was dropped"),
                    None,
                ));
            },
            other if other.starts_with('-') => {
                diagnostics.push(finding(
                    Severity::Warning,
                    "unsupported-option",
                    format!("cURL option {other} was ignored"),
                    None,
                ));
            },
            other => url = Some(other.to_string()),
        }
    }

    let Some(url) = url else {
        diagnostics.push(finding(
            Severity::Error,
            "missing-url",
            "cURL command has no URL".to_string(),
            None,
        ));
        return ImportOutcome { content: String::new(), imported: 0, skipped: 1, diagnostics };
    };

    let body = (!data_parts.is_empty()).then(|| data_parts.join("&"));
    let method = method.unwrap_or_else(|| {
        if body.is_some() { "POST".to_string() } else { "GET".to_string() }
    });

    let mut content = String::from("### Imported from cURL\n");
    content.push_str(&format!("{method} {url}\n"));
    for (name, value) in &headers {
        content.push_str(&format!("{name}: {value}\n"));
    }
    if let Some(body) = &body {
        content.push('\n');
        content.push_str(body);
        content.push('\n');
    }

    ImportOutcome { content, imported: 1, skipped: 0, diagnostics }
}

// --- Postman ---

fn postman_url(request: &Value) -> Option<String> {
    match &request["url"] {
        Value::String(url) => Some(url.clone()),
        Value::Object(map) => map.get("raw").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn postman_item(
    item: &Value,
    blocks: &mut Vec<String>,
    imported: &mut usize,
    skipped: &mut usize,
    diagnostics: &mut Vec<ImportDiagnostic>,
) {
    let name = item["name"].as_str().unwrap_or("unnamed").to_string();

    // Folders recurse.
    if let Some(children) = item["item"].as_array() {
        for child in children {
            postman_item(child, blocks, imported, skipped, diagnostics);
        }
        return;
    }

    let request = &item["request"];
    if request.is_null() {
        *skipped += 1;
        diagnostics.push(finding(
            Severity::Warning,
            "item-without-request",
            format!("item {name} carries no request"),
            Some(name),
        ));
        return;
    }

    let method = request["method"].as_str().unwrap_or("GET").to_uppercase();
    let Some(url) = postman_url(request) else {
        *skipped += 1;
        diagnostics.push(finding(
            Severity::Error,
            "missing-url",
            format!("item {name} has no URL"),
            Some(name),
        ));
        return;
    };

    let mut block = format!("### {name}\n{method} {url}\n");
    if let Some(headers) = request["header"].as_array() {
        for header in headers {
            if header["disabled"].as_bool() == Some(true) {
                continue;
            }
            if let (Some(key), Some(value)) = (header["key"].as_str(), header["value"].as_str()) {
                block.push_str(&format!("{key}: {value}\n"));
            }
        }
    }

    match request["body"]["mode"].as_str() {
        Some("raw") => {
            if let Some(raw) = request["body"]["raw"].as_str() {
                block.push('\n');
                block.push_str(raw);
                block.push('\n');
            }
        },
        Some("urlencoded") => {
            let pairs: Vec<String> = request["body"]["urlencoded"]
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|entry| entry["disabled"].as_bool() != Some(true))
                        .filter_map(|entry| {
                            Some(format!(
                                "{}={}",
                                entry["key"].as_str()?,
                                entry["value"].as_str().unwrap_or_default()
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if !pairs.is_empty() {
                block.push_str("Content-Type: application/x-www-form-urlencoded\n\n");
                block.push_str(&pairs.join("&"));
                block.push('\n');
            }
        },
        Some(other) => diagnostics.push(finding(
            Severity::Warning,
            "unsupported-body-mode",
            format!("item {name} uses body mode {other}; body was dropped"),
            Some(name),
        )),
        None => {},
    }

    blocks.push(block);
    *imported += 1;
}

/// Converts a Postman collection (v2.x JSON) into `.http` blocks.
pub fn postman_to_http(raw: &str) -> ImportOutcome {
    let mut diagnostics = Vec::new();
    let collection: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            diagnostics.push(finding(
                Severity::Error,
                "invalid-collection",
                format!("collection is not valid JSON: {e}"),
                None,
            ));
            return ImportOutcome { content: String::new(), imported: 0, skipped: 0, diagnostics };
        },
    };

    let Some(items) = collection["item"].as_array() else {
        diagnostics.push(finding(
            Severity::Error,
            "invalid-collection",
            "collection has no item array".to_string(),
            None,
        ));
        return ImportOutcome { content: String::new(), imported: 0, skipped: 0, diagnostics };
    };

    let mut blocks = Vec::new();
    let mut imported = 0;
    let mut skipped = 0;
    for item in items {
        postman_item(item, &mut blocks, &mut imported, &mut skipped, &mut diagnostics);
    }

    ImportOutcome { content: blocks.join("\n"), imported, skipped, diagnostics }
}
