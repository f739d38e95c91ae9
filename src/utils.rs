//! Utility functions for the exception reporter
//!
//! Host detection, GELF timestamps and message ids, value truncation and
//! client IP extraction.

use actix_web::http::header::HeaderMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Hostname of this machine, or `localhost` when it cannot be read
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Fractional UNIX seconds, the GELF `timestamp` format
pub fn gelf_timestamp(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_millis()) / 1000.0
}

/// Random 8-byte id shared by all chunks of one GELF message
pub fn generate_message_id() -> [u8; 8] {
    let mut id = [0u8; 8];
    id.copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);
    id
}

/// Truncate a value to at most `max_chars` characters
///
/// Adds "... (truncated)" when truncation occurs. Cuts on a character
/// boundary.
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... (truncated)", &value[..idx]),
        None => value.to_string(),
    }
}

/// Address of the client behind any proxies
///
/// `X-Real-IP` wins, then the first hop of `X-Forwarded-For`, then the
/// connection peer. Blank or non-ASCII header values are ignored.
pub fn client_ip(headers: &HeaderMap, peer_addr: Option<&str>) -> Option<String> {
    header_str(headers, "x-real-ip")
        .or_else(|| {
            header_str(headers, "x-forwarded-for")
                .and_then(|hops| hops.split(',').map(str::trim).find(|hop| !hop.is_empty()))
        })
        .or(peer_addr)
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
