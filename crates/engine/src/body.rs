// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded response-body reader.
//!
//! Bodies are buffered up to a caller-supplied cap — never streamed to the
//! client — with best-effort binary detection over the first 8 KiB. Binary
//! bodies are base64-encoded; text bodies are decoded as UTF-8.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::{Stream, StreamExt};

pub use treq_api::{BodyDescriptor, BodyEncoding, BodyMode};

/// How many leading bytes the binary heuristic inspects.
const SNIFF_WINDOW: usize = 8 * 1024;

/// A zero byte, or a byte sequence that violates UTF-8 framing, marks the
/// buffer as binary. An incomplete multi-byte sequence at the window edge
/// does not.
fn looks_binary(buffer: &[u8]) -> bool {
    let window = &buffer[..buffer.len().min(SNIFF_WINDOW)];
    if window.contains(&0) {
        return true;
    }
    match std::str::from_utf8(window) {
        Ok(_) => false,
        Err(err) => err.error_len().is_some(),
    }
}

/// Reads `stream` up to `max_bytes`, dropping the stream (which cancels the
/// upstream read) as soon as the cap is exceeded.
///
/// # Errors
///
/// Returns the underlying stream error message if reading fails before the
/// cap is reached.
pub async fn read_body<S, E>(mut stream: S, max_bytes: usize) -> Result<BodyDescriptor, String>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        let remaining = max_bytes.saturating_sub(collected.len());
        if chunk.len() > remaining {
            collected.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        collected.extend_from_slice(&chunk);
    }
    drop(stream);

    let body_bytes = collected.len();
    let body_mode = if body_bytes == 0 { BodyMode::None } else { BodyMode::Buffered };
    let (encoding, body) = if looks_binary(&collected) {
        (BodyEncoding::Base64, BASE64.encode(&collected))
    } else {
        (BodyEncoding::Utf8, String::from_utf8_lossy(&collected).into_owned())
    };

    Ok(BodyDescriptor { body_mode, encoding, body, body_bytes, truncated })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[tokio::test]
    async fn empty_stream_is_mode_none() {
        let body = read_body(chunks(vec![]), 1024).await.unwrap();
        assert_eq!(body.body_mode, BodyMode::None);
        assert_eq!(body.body_bytes, 0);
        assert!(!body.truncated);
    }

    #[tokio::test]
    async fn text_body_is_utf8() {
        let body = read_body(chunks(vec![b"hello ", b"world"]), 1024).await.unwrap();
        assert_eq!(body.body_mode, BodyMode::Buffered);
        assert_eq!(body.encoding, BodyEncoding::Utf8);
        assert_eq!(body.body, "hello world");
        assert_eq!(body.body_bytes, 11);
    }

    #[tokio::test]
    async fn cap_truncates_and_reports() {
        let body = read_body(chunks(vec![&[b'a'; 64], &[b'b'; 64]]), 100).await.unwrap();
        assert!(body.truncated);
        assert_eq!(body.body_bytes, 100);
        assert_eq!(body.body.len(), 100);
    }

    #[tokio::test]
    async fn double_cap_body_collects_exactly_cap() {
        let body = read_body(chunks(vec![&[b'x'; 200]]), 100).await.unwrap();
        assert!(body.truncated);
        assert_eq!(body.body_bytes, 100);
    }

    #[tokio::test]
    async fn zero_byte_marks_binary() {
        let body = read_body(chunks(vec![b"ab\x00cd"]), 1024).await.unwrap();
        assert_eq!(body.encoding, BodyEncoding::Base64);
        assert_eq!(body.body, BASE64.encode(b"ab\x00cd"));
    }

    #[tokio::test]
    async fn invalid_utf8_framing_marks_binary() {
        // 0xFF can never appear in well-formed UTF-8.
        let body = read_body(chunks(vec![&[0x61, 0xFF, 0x62]]), 1024).await.unwrap();
        assert_eq!(body.encoding, BodyEncoding::Base64);
    }

    #[tokio::test]
    async fn multibyte_cut_at_window_edge_stays_text() {
        // A valid 2-byte sequence split across the cap boundary must not
        // flip the heuristic to binary.
        let mut data = vec![b'a'; SNIFF_WINDOW - 1];
        data.extend_from_slice("é".as_bytes());
        let leaked: &'static [u8] = Box::leak(data.into_boxed_slice());
        let body = read_body(chunks(vec![leaked]), SNIFF_WINDOW + 8).await.unwrap();
        assert_eq!(body.encoding, BodyEncoding::Utf8);
    }

    #[tokio::test]
    async fn stream_error_propagates() {
        let stream = futures::stream::iter(vec![
            Ok::<Bytes, String>(Bytes::from_static(b"partial")),
            Err("connection reset".to_string()),
        ]);
        let err = read_body(Box::pin(stream), 1024).await.unwrap_err();
        assert!(err.contains("connection reset"));
    }
}
