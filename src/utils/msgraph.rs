//! Microsoft Graph specifics
//!
//! Synthetic errors for Graph destinations carry the Graph error envelope
//! and diagnostic headers so SDK clients parse them like real service
//! errors. Other destinations get the generic error shape.

use chrono::Local;
use http::StatusCode;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::core::Session;

/// Graph cloud hostnames, sovereign clouds included.
const GRAPH_HOSTS: &[&str] = &[
    "graph.microsoft.com",
    "graph.microsoft.us",
    "dod-graph.microsoft.us",
    "graph.microsoft.de",
    "microsoftgraph.chinacloudapi.cn",
];

pub fn is_graph_host(host: &str) -> bool {
    GRAPH_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h))
}

pub fn is_graph_request(session: &Session) -> bool {
    is_graph_host(session.request.host())
}

/// Graph error envelope for a synthesized status.
pub fn error_body(status: StatusCode, request_id: Uuid) -> JsonValue {
    let code = status
        .canonical_reason()
        .unwrap_or("Unknown Error")
        .to_string();
    json!({
        "error": {
            "code": code,
            "message": format!("Some error was generated by the proxy. ({})", status.as_u16()),
            "innerError": {
                "request-id": request_id.to_string(),
                "date": Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            }
        }
    })
}

/// Diagnostic headers Graph attaches to every error, plus a CORS echo when
/// the request carried an Origin.
pub fn error_headers(session: &Session, request_id: Uuid) -> Vec<(String, String)> {
    let mut headers = vec![
        ("request-id".to_string(), request_id.to_string()),
        ("client-request-id".to_string(), request_id.to_string()),
        (
            "x-ms-ags-diagnostic".to_string(),
            json!({"ServerInfo": {"DataCenter": "westus", "Slice": "E", "Ring": "5"}}).to_string(),
        ),
        (
            "Date".to_string(),
            chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        ),
        ("Cache-Control".to_string(), "no-store".to_string()),
        (
            "Strict-Transport-Security".to_string(),
            "max-age=31536000".to_string(),
        ),
        ("Content-Type".to_string(), "application/json".to_string()),
    ];

    if let Some(origin) = session.request.header("Origin") {
        headers.push(("Access-Control-Allow-Origin".to_string(), origin.to_string()));
        headers.push((
            "Access-Control-Expose-Headers".to_string(),
            "ETag, Location, Preference-Applied, Content-Range, request-id, client-request-id, ReadWriteConsistencyToken, SdkVersion, WWW-Authenticate, x-ms-client-gcc-tenant, Retry-After".to_string(),
        ));
    }

    headers
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method};

    use super::*;
    use crate::core::RequestData;

    #[test]
    fn test_graph_host_detection() {
        assert!(is_graph_host("graph.microsoft.com"));
        assert!(is_graph_host("Graph.Microsoft.Com"));
        assert!(is_graph_host("microsoftgraph.chinacloudapi.cn"));
        assert!(!is_graph_host("example.com"));
        assert!(!is_graph_host("notgraph.microsoft.com"));
    }

    #[test]
    fn test_error_body_shape() {
        let id = Uuid::new_v4();
        let body = error_body(StatusCode::TOO_MANY_REQUESTS, id);
        assert_eq!(body["error"]["code"], "Too Many Requests");
        assert_eq!(body["error"]["innerError"]["request-id"], id.to_string());
        assert!(body["error"]["message"].as_str().unwrap().contains("429"));
    }

    #[test]
    fn test_cors_echo_only_with_origin() {
        let id = Uuid::new_v4();

        let session = Session::new(
            1,
            RequestData::new(
                Method::GET,
                "https://graph.microsoft.com/v1.0/me",
                HeaderMap::new(),
                Bytes::new(),
            ),
        );
        let headers = error_headers(&session, id);
        assert!(!headers.iter().any(|(n, _)| n == "Access-Control-Allow-Origin"));

        let mut with_origin = HeaderMap::new();
        with_origin.insert("Origin", HeaderValue::from_static("https://localhost:3000"));
        let session = Session::new(
            2,
            RequestData::new(
                Method::GET,
                "https://graph.microsoft.com/v1.0/me",
                with_origin,
                Bytes::new(),
            ),
        );
        let headers = error_headers(&session, id);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Access-Control-Allow-Origin" && v == "https://localhost:3000"));
    }
}
