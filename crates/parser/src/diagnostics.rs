// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Static diagnostics over raw `.http` text.
//!
//! The analyzer never invokes the parser: it has to produce useful findings
//! for text the parser would reject. All positions are 0-based and ranges
//! are half-open `[start, end)`.

use serde::{Deserialize, Serialize};

use crate::VALID_METHODS;

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// The closed set of diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    #[serde(rename = "unclosed-variable")]
    UnclosedVariable,
    #[serde(rename = "empty-variable")]
    EmptyVariable,
    #[serde(rename = "missing-url")]
    MissingUrl,
    #[serde(rename = "invalid-method")]
    InvalidMethod,
    #[serde(rename = "duplicate-header")]
    DuplicateHeader,
    #[serde(rename = "malformed-header")]
    MalformedHeader,
}

/// 0-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// Half-open `[start, end)` source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    const fn on_line(line: usize, start_column: usize, end_column: usize) -> Self {
        Self {
            start: Position { line, column: start_column },
            end: Position { line, column: end_column },
        }
    }
}

/// One analyzer finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub range: Range,
}

/// Common method typos and their intended spelling.
const METHOD_TYPOS: [(&str, &str); 11] = [
    ("GTE", "GET"),
    ("GETT", "GET"),
    ("PSOT", "POST"),
    ("POTS", "POST"),
    ("POSTT", "POST"),
    ("PUTT", "PUT"),
    ("DELET", "DELETE"),
    ("DELTE", "DELETE"),
    ("PTACH", "PATCH"),
    ("PACTH", "PATCH"),
    ("OPTION", "OPTIONS"),
];

fn looks_like_method(token: &str) -> bool {
    token.len() >= 3
        && token.len() <= 8
        && token.chars().all(|c| c.is_ascii_uppercase())
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BraceToken {
    Open,
    Close,
}

fn brace_tokens(text: &str) -> Vec<(usize, usize, BraceToken)> {
    let mut tokens = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let bytes = line.as_bytes();
        let mut col = 0;
        while col + 1 < bytes.len() {
            match (bytes[col], bytes[col + 1]) {
                (b'{', b'{') => {
                    tokens.push((line_idx, col, BraceToken::Open));
                    col += 2;
                },
                (b'}', b'}') => {
                    tokens.push((line_idx, col, BraceToken::Close));
                    col += 2;
                },
                _ => col += 1,
            }
        }
    }
    tokens
}

/// `{{` without a matching `}}` before the next `{{` or end-of-file, plus
/// `{{ }}` with nothing inside.
fn check_variables(text: &str, findings: &mut Vec<Diagnostic>) {
    let lines: Vec<&str> = text.lines().collect();
    let tokens = brace_tokens(text);
    let mut idx = 0;
    while idx < tokens.len() {
        let (line, col, token) = tokens[idx];
        if token != BraceToken::Open {
            idx += 1;
            continue;
        }
        match tokens.get(idx + 1) {
            Some(&(close_line, close_col, BraceToken::Close)) => {
                if close_line == line {
                    let inner = &lines[line][col + 2..close_col];
                    if inner.trim().is_empty() {
                        findings.push(Diagnostic {
                            severity: Severity::Warning,
                            code: DiagnosticCode::EmptyVariable,
                            message: "Empty variable reference".to_string(),
                            range: Range::on_line(line, col, close_col + 2),
                        });
                    }
                }
                idx += 2;
            },
            _ => {
                findings.push(Diagnostic {
                    severity: Severity::Error,
                    code: DiagnosticCode::UnclosedVariable,
                    message: "Variable is never closed; expected '}}'".to_string(),
                    range: Range::on_line(line, col, col + 2),
                });
                idx += 1;
            },
        }
    }
}

fn check_request_line(line_idx: usize, line: &str, findings: &mut Vec<Diagnostic>) -> bool {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    let mut tokens = trimmed.split_whitespace();
    let Some(method) = tokens.next() else { return false };
    let method_range = Range::on_line(line_idx, indent, indent + method.len());

    if VALID_METHODS.contains(&method) {
        if tokens.next().is_none() {
            findings.push(Diagnostic {
                severity: Severity::Error,
                code: DiagnosticCode::MissingUrl,
                message: format!("Method {method} is missing a URL"),
                range: method_range,
            });
        }
        return true;
    }

    if looks_like_method(method) && tokens.next().is_some() {
        let suggestion = METHOD_TYPOS
            .iter()
            .find(|(typo, _)| *typo == method)
            .map(|(_, fix)| format!("; did you mean {fix}?"))
            .unwrap_or_default();
        findings.push(Diagnostic {
            severity: Severity::Warning,
            code: DiagnosticCode::InvalidMethod,
            message: format!("Unknown method {method}{suggestion}"),
            range: method_range,
        });
        return true;
    }

    false
}

fn check_block(lines: &[(usize, &str)], findings: &mut Vec<Diagnostic>) {
    let mut iter = lines.iter();

    // Find the request line, skipping leading comments and blanks.
    let found_request = loop {
        let Some(&(line_idx, line)) = iter.next() else { return };
        if line.trim().is_empty() || is_comment(line) {
            continue;
        }
        break check_request_line(line_idx, line, findings);
    };
    if !found_request {
        return;
    }

    // Header section: ends at the first blank line or a body-looking line.
    let mut seen: Vec<String> = Vec::new();
    for &(line_idx, line) in iter {
        if line.trim().is_empty() {
            break;
        }
        if is_comment(line) {
            continue;
        }
        let trimmed = line.trim_start();
        if matches!(trimmed.as_bytes().first(), Some(b'{' | b'[' | b'<')) {
            break;
        }
        let indent = line.len() - trimmed.len();
        if let Some((name, _)) = trimmed.split_once(':') {
            let canonical = name.trim().to_lowercase();
            if seen.contains(&canonical) {
                findings.push(Diagnostic {
                    severity: Severity::Warning,
                    code: DiagnosticCode::DuplicateHeader,
                    message: format!("Duplicate header {}", name.trim()),
                    range: Range::on_line(line_idx, indent, indent + name.len()),
                });
            } else {
                seen.push(canonical);
            }
        } else {
            findings.push(Diagnostic {
                severity: Severity::Error,
                code: DiagnosticCode::MalformedHeader,
                message: "Malformed header line (expected 'Name: value')".to_string(),
                range: Range::on_line(line_idx, indent, indent + trimmed.len()),
            });
        }
    }
}

/// Runs every check over the raw text and returns findings sorted by
/// `(line, column)`.
pub fn analyze(text: &str) -> Vec<Diagnostic> {
    let mut findings = Vec::new();

    check_variables(text, &mut findings);

    let mut block: Vec<(usize, &str)> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim_start().starts_with("###") {
            check_block(&block, &mut findings);
            block.clear();
        } else {
            block.push((idx, line));
        }
    }
    check_block(&block, &mut findings);

    findings.sort_by_key(|d| (d.range.start.line, d.range.start.column));
    findings
}

/// Filters findings to those starting within `[start_line, end_line]`.
pub fn diagnostics_for_block(
    findings: &[Diagnostic],
    start_line: usize,
    end_line: usize,
) -> Vec<Diagnostic> {
    findings
        .iter()
        .filter(|d| d.range.start.line >= start_line && d.range.start.line <= end_line)
        .cloned()
        .collect()
}
