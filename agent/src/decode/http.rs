//! HTTP/1.x plaintext decoder
//!
//! Parses a request line or status line plus headers out of a byte stream.
//! Deliberately conservative: anything that doesn't look like well-formed
//! HTTP/1.x is treated as "not HTTP" rather than an error, since the same
//! decoder runs against arbitrary TCP payload that may be any protocol.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A decoded HTTP/1.x request line and headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub content_length: Option<u64>,
    /// Every header seen, name lowercased, first occurrence wins.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Bytes past the header block, truncated to the configured body cap.
    /// Absent when the reassembled window doesn't reach past the headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// A decoded HTTP/1.x status line and headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// One request/response exchange, as much of it as has been observed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpExchange {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
}

const MAX_METHOD_LEN: usize = 16;
const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Split a header block (up to `max_bytes`) into a leading line and the
/// remaining header lines, stopping at the blank line that ends the header
/// section if present within the window.
fn split_lines(data: &[u8], max_bytes: usize) -> Result<Vec<String>> {
    let window = &data[..data.len().min(max_bytes)];
    let text = match std::str::from_utf8(window) {
        Ok(t) => t,
        Err(_) => bail!("non-UTF8 data, not HTTP"),
    };

    let mut lines = Vec::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            break;
        }
        lines.push(line.to_string());
    }

    if lines.is_empty() {
        bail!("no header lines found");
    }

    Ok(lines)
}

fn parse_headers(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .skip(1)
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn headers_map(headers: &[(String, String)]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        map.entry(name.clone()).or_insert_with(|| value.clone());
    }
    map
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Bytes past the `\r\n\r\n` that ends the header block, truncated to
/// `max_body_bytes`. `None` if the blank line isn't found within the header
/// window, or if nothing follows it.
fn extract_body(data: &[u8], max_header_bytes: usize, max_body_bytes: usize) -> Option<Vec<u8>> {
    let header_window = &data[..data.len().min(max_header_bytes)];
    let end = header_window.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let remaining = &data[end..];
    if remaining.is_empty() {
        return None;
    }
    let take = remaining.len().min(max_body_bytes);
    Some(remaining[..take].to_vec())
}

/// Attempt to decode an HTTP request from the client-to-server byte stream
pub fn decode_request(data: &[u8], max_header_bytes: usize, max_body_bytes: usize) -> Option<HttpRequest> {
    let lines = split_lines(data, max_header_bytes).ok()?;
    let request_line = &lines[0];

    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;

    if method.len() > MAX_METHOD_LEN || !METHODS.contains(&method) {
        return None;
    }
    if !version.starts_with("HTTP/") {
        return None;
    }

    let headers = parse_headers(&lines);

    Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        host: header_value(&headers, "host").map(str::to_string),
        user_agent: header_value(&headers, "user-agent").map(str::to_string),
        content_length: header_value(&headers, "content-length").and_then(|v| v.parse().ok()),
        headers: headers_map(&headers),
        body: extract_body(data, max_header_bytes, max_body_bytes),
    })
}

/// Attempt to decode an HTTP response from the server-to-client byte stream
pub fn decode_response(data: &[u8], max_header_bytes: usize, max_body_bytes: usize) -> Option<HttpResponse> {
    let lines = split_lines(data, max_header_bytes).ok()?;
    let status_line = &lines[0];

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    let status_code: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    if !version.starts_with("HTTP/") {
        return None;
    }
    if !(100..600).contains(&status_code) {
        return None;
    }

    let headers = parse_headers(&lines);

    Some(HttpResponse {
        version: version.to_string(),
        status_code,
        reason,
        content_type: header_value(&headers, "content-type").map(str::to_string),
        content_length: header_value(&headers, "content-length").and_then(|v| v.parse().ok()),
        headers: headers_map(&headers),
        body: extract_body(data, max_header_bytes, max_body_bytes),
    })
}

/// Try both directions of a single byte window; used by callers that don't
/// yet know which side of the connection they're looking at (e.g. tests).
pub fn decode_http(data: &[u8], max_header_bytes: usize, max_body_bytes: usize) -> HttpExchange {
    HttpExchange {
        request: decode_request(data, max_header_bytes, max_body_bytes),
        response: decode_response(data, max_header_bytes, max_body_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_get_request() {
        let data = b"GET /api/v1/health HTTP/1.1\r\nHost: example.internal\r\nUser-Agent: curl/8.0\r\n\r\n";
        let req = decode_request(data, 4096, 8192).expect("should decode");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/v1/health");
        assert_eq!(req.host.as_deref(), Some("example.internal"));
        assert_eq!(req.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(req.headers.get("host").map(String::as_str), Some("example.internal"));
    }

    #[test]
    fn test_decode_post_with_content_length() {
        let data = b"POST /ingest HTTP/1.1\r\nHost: h\r\nContent-Length: 42\r\n\r\n";
        let req = decode_request(data, 4096, 8192).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.content_length, Some(42));
    }

    #[test]
    fn test_decode_status_line() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n";
        let resp = decode_response(data, 4096, 8192).expect("should decode");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_non_http_data_rejected() {
        let data = vec![0xff, 0x00, 0xde, 0xad, 0xbe, 0xef];
        assert!(decode_request(&data, 4096, 8192).is_none());
        assert!(decode_response(&data, 4096, 8192).is_none());
    }

    #[test]
    fn test_garbage_status_code_rejected() {
        let data = b"HTTP/1.1 not-a-code OK\r\n\r\n";
        assert!(decode_response(data, 4096, 8192).is_none());
    }

    #[test]
    fn test_body_extracted_and_truncated_to_cap() {
        let data = b"POST /ingest HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\n0123456789";
        let req = decode_request(data, 4096, 4).unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"0123"[..]));
    }

    #[test]
    fn test_no_body_when_nothing_follows_headers() {
        let data = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let req = decode_request(data, 4096, 8192).unwrap();
        assert_eq!(req.body, None);
    }
}
