// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! treq-parser: parses `.http` description files into request descriptors.
//!
//! The parser is pure: it performs no I/O and never resolves `{{variable}}`
//! placeholders — interpolation belongs to the engine. Blocks are separated
//! by `###` lines; `# @key value` comment directives attach to the next
//! request in the block.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod diagnostics;

pub use diagnostics::{analyze, diagnostics_for_block, Diagnostic, DiagnosticCode, Severity};

/// The nine request methods the parser accepts.
pub const VALID_METHODS: [&str; 9] =
    ["GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH"];

/// Source location of a request within the parsed text (0-based lines).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub start_line: usize,
    pub end_line: usize,
    /// Title text following the `###` block separator, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One parsed request block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    /// `# @name` directive, falling back to the block title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Headers in source order; names keep their original casing.
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Key/value pairs when the body is `application/x-www-form-urlencoded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_data: Option<Vec<(String, String)>>,
    /// `< path` body reference, resolved by the engine against its base path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_file: Option<String>,
    pub meta: RequestMeta,
    /// `# @key value` annotations, opaque to the core.
    pub directives: IndexMap<String, String>,
    /// Verbatim block text, suitable for `Engine::run_string`.
    pub raw: String,
}

impl HttpRequest {
    /// Returns the first header value for `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parse failure with the offending (0-based) source line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: invalid request line: {text}")]
    InvalidRequestLine { line: usize, text: String },
    #[error("line {line}: method {method} is missing a URL")]
    MissingUrl { line: usize, method: String },
    #[error("line {line}: malformed header: {text}")]
    MalformedHeader { line: usize, text: String },
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

fn directive_of(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix('#').or_else(|| trimmed.strip_prefix("//"))?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('@')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let key = parts.next()?.trim();
    if key.is_empty() {
        return None;
    }
    let value = parts.next().unwrap_or("").trim();
    Some((key.to_string(), value.to_string()))
}

fn starts_body(line: &str) -> bool {
    matches!(line.trim_start().as_bytes().first(), Some(b'{' | b'[' | b'<'))
}

struct Block<'a> {
    start_line: usize,
    title: Option<String>,
    lines: Vec<(usize, &'a str)>,
}

fn split_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = vec![Block { start_line: 0, title: None, lines: Vec::new() }];
    for (idx, line) in text.lines().enumerate() {
        if let Some(rest) = line.trim_start().strip_prefix("###") {
            let title = rest.trim();
            blocks.push(Block {
                start_line: idx,
                title: (!title.is_empty()).then(|| title.to_string()),
                lines: Vec::new(),
            });
        } else if let Some(block) = blocks.last_mut() {
            block.lines.push((idx, line));
        }
    }
    blocks
}

fn parse_form_data(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=').map_or_else(
                || (pair.to_string(), String::new()),
                |(k, v)| (k.to_string(), v.to_string()),
            )
        })
        .collect()
}

fn parse_block(block: &Block<'_>) -> Result<Option<HttpRequest>, ParseError> {
    let mut directives = IndexMap::new();
    let mut lines = block.lines.iter().peekable();

    // Leading comments and directives.
    let request_line = loop {
        match lines.peek() {
            None => return Ok(None),
            Some((_, line)) if line.trim().is_empty() => {
                let _ = lines.next();
            },
            Some((_, line)) if is_comment(line) => {
                if let Some((key, value)) = directive_of(line) {
                    let _ = directives.insert(key, value);
                }
                let _ = lines.next();
            },
            Some(&entry) => break entry,
        }
    };
    let _ = lines.next();

    let (request_line_idx, request_text) = *request_line;
    let mut tokens = request_text.split_whitespace();
    let method = tokens.next().unwrap_or_default();
    if !VALID_METHODS.contains(&method) {
        return Err(ParseError::InvalidRequestLine {
            line: request_line_idx,
            text: request_text.trim().to_string(),
        });
    }
    let url = tokens.next().ok_or_else(|| ParseError::MissingUrl {
        line: request_line_idx,
        method: method.to_string(),
    })?;
    // An optional trailing HTTP/x.y version token is accepted and ignored.

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut body_file = None;
    let mut end_line = request_line_idx;
    let mut in_body = false;

    for &(idx, line) in lines {
        end_line = idx;
        if in_body {
            body_lines.push(line);
            continue;
        }
        if line.trim().is_empty() {
            in_body = true;
            continue;
        }
        if is_comment(line) {
            continue;
        }
        if starts_body(line) {
            in_body = true;
            body_lines.push(line);
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
            None => {
                return Err(ParseError::MalformedHeader { line: idx, text: line.trim().to_string() })
            },
        }
    }

    // Trim trailing blank lines off the body.
    while body_lines.last().is_some_and(|line| line.trim().is_empty()) {
        let _ = body_lines.pop();
    }
    while body_lines.first().is_some_and(|line| line.trim().is_empty()) {
        let _ = body_lines.remove(0);
    }

    let mut body = None;
    if let Some(first) = body_lines.first() {
        if let Some(path) = first.trim_start().strip_prefix('<') {
            body_file = Some(path.trim().to_string());
        } else {
            body = Some(body_lines.join("\n"));
        }
    }

    let is_form = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("content-type")
            && value.to_lowercase().contains("application/x-www-form-urlencoded")
    });
    let form_data = match (&body, is_form) {
        (Some(body), true) => Some(parse_form_data(body)),
        _ => None,
    };

    let raw = block.lines.iter().map(|(_, line)| *line).collect::<Vec<_>>().join("\n");
    let name = directives.get("name").cloned().or_else(|| block.title.clone());

    Ok(Some(HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        name,
        headers,
        body,
        form_data,
        body_file,
        meta: RequestMeta { start_line: block.start_line, end_line, title: block.title.clone() },
        directives,
        raw,
    }))
}

/// Parses `.http` text into its request blocks.
///
/// Returns an empty vector for text containing no requests; callers decide
/// whether that is an error.
///
/// # Errors
///
/// Fails on a block whose request line is not `METHOD URL [HTTP/x.y]` or
/// that contains a malformed header line.
pub fn parse(text: &str) -> Result<Vec<HttpRequest>, ParseError> {
    let mut requests = Vec::new();
    for block in split_blocks(text) {
        if let Some(request) = parse_block(&block)? {
            requests.push(request);
        }
    }
    Ok(requests)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_request() {
        let requests = parse("GET https://example.com/users\n").unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].url, "https://example.com/users");
        assert!(requests[0].body.is_none());
    }

    #[test]
    fn parses_headers_and_body() {
        let text = "POST https://example.com/users\nContent-Type: application/json\n\n{\"a\":1}\n";
        let requests = parse(text).unwrap();
        let request = &requests[0];
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn splits_blocks_on_triple_hash_and_keeps_titles() {
        let text = "### Login\nPOST https://x/login\n\n### Fetch profile\nGET https://x/me\n";
        let requests = parse(text).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].name.as_deref(), Some("Login"));
        assert_eq!(requests[1].name.as_deref(), Some("Fetch profile"));
    }

    #[test]
    fn name_directive_wins_over_title() {
        let text = "### Title\n# @name login\nPOST https://x/login\n";
        let requests = parse(text).unwrap();
        assert_eq!(requests[0].name.as_deref(), Some("login"));
        assert_eq!(requests[0].directives.get("name").map(String::as_str), Some("login"));
        assert_eq!(requests[0].meta.title.as_deref(), Some("Title"));
    }

    #[test]
    fn json_body_without_blank_separator_is_tolerated() {
        let text = "POST https://x/a\n{\"k\": \"v\"}\n";
        let requests = parse(text).unwrap();
        assert_eq!(requests[0].body.as_deref(), Some("{\"k\": \"v\"}"));
        assert!(requests[0].headers.is_empty());
    }

    #[test]
    fn body_file_reference() {
        let text = "POST https://x/upload\nContent-Type: application/json\n\n< ./payload.json\n";
        let requests = parse(text).unwrap();
        assert_eq!(requests[0].body_file.as_deref(), Some("./payload.json"));
        assert!(requests[0].body.is_none());
    }

    #[test]
    fn form_bodies_expose_form_data() {
        let text = "POST https://x/login\nContent-Type: application/x-www-form-urlencoded\n\nuser=amy&pass={{secret}}\n";
        let requests = parse(text).unwrap();
        let form = requests[0].form_data.as_ref().unwrap();
        assert_eq!(form[0], ("user".to_string(), "amy".to_string()));
        assert_eq!(form[1], ("pass".to_string(), "{{secret}}".to_string()));
    }

    #[test]
    fn variables_pass_through_unresolved() {
        let requests = parse("GET {{baseUrl}}/users\nAuthorization: Bearer {{token}}\n").unwrap();
        assert_eq!(requests[0].url, "{{baseUrl}}/users");
        assert_eq!(requests[0].header("authorization"), Some("Bearer {{token}}"));
    }

    #[test]
    fn empty_text_yields_no_requests() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("# just a comment\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_bogus_request_line() {
        let err = parse("FETCH https://x/\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidRequestLine { line: 0, .. }));
    }

    #[test]
    fn rejects_method_without_url() {
        let err = parse("GET\n").unwrap_err();
        assert_eq!(err, ParseError::MissingUrl { line: 0, method: "GET".to_string() });
    }

    #[test]
    fn rejects_malformed_header() {
        let err = parse("GET https://x/\nNot a header\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader { line: 1, .. }));
    }

    #[test]
    fn raw_preserves_block_text() {
        let text = "# @name login\nPOST https://x/login\nAccept: */*\n\n{\"a\":1}";
        let requests = parse(text).unwrap();
        assert_eq!(requests[0].raw, text);
    }
}
