//! Synthetic response building for plugins.

use bytes::Bytes;
use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::Session;

/// A declared header in mock and error files. An ordered list is used
/// rather than a map so declaration order and duplicates survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Format of the `Retry-After` value in synthetic throttled responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryAfterFormat {
    /// Integer seconds.
    #[default]
    Seconds,
    /// RFC 7231 HTTP-date.
    HttpDate,
}

pub fn retry_after_value(format: RetryAfterFormat, seconds: u64) -> String {
    match format {
        RetryAfterFormat::Seconds => seconds.to_string(),
        RetryAfterFormat::HttpDate => (Utc::now() + chrono::Duration::seconds(seconds as i64))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    }
}

/// Unified builder for plugin-produced responses.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Install a JSON response on the session and mark it set.
    pub fn send_json(
        session: &mut Session,
        status: StatusCode,
        mut headers: Vec<(String, String)>,
        body: &JsonValue,
    ) {
        if !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let body = serde_json::to_vec(body).unwrap_or_default();
        session.set_generic_response(status, &headers, Bytes::from(body));
    }

    /// Install a raw-bytes response on the session and mark it set.
    pub fn send_raw(
        session: &mut Session,
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) {
        session.set_generic_response(status, &headers, body);
    }
}
