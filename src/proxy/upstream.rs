//! Upstream fetch for sessions no plugin answered
//!
//! The destination is the intercepted URL itself; there is no routing or
//! load balancing. Responses are buffered into the session so plugins can
//! inspect and annotate them before the bytes go back to the client.

use std::time::Duration;

use http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};

use crate::core::{ProxyResult, Session};

/// Headers that describe the client connection rather than the request and
/// must not be forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    CONNECTION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
    HOST,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
        || name.as_str().eq_ignore_ascii_case("proxy-connection")
        || name.as_str().eq_ignore_ascii_case("proxy-authorization")
        || name.as_str().eq_ignore_ascii_case("proxy-authenticate")
        || name.as_str().eq_ignore_ascii_case("keep-alive")
}

pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout_seconds: u64) -> ProxyResult<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self { client })
    }

    /// Forward the session's request and store the upstream answer in the
    /// session's response. Does not mark the response as set: the answer is
    /// a real one, and response-phase plugins may still annotate it.
    pub async fn fetch(&self, session: &mut Session) -> ProxyResult<()> {
        let mut headers = http::HeaderMap::new();
        for (name, value) in session.request.headers.iter() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let mut builder = self
            .client
            .request(session.request.method.clone(), &session.request.url)
            .headers(headers);

        if !session.request.body().is_empty() {
            builder = builder.body(session.request.body().clone());
        }

        let response = builder.send().await?;

        session.response.status = response.status();
        session.response.headers.clear();
        for (name, value) in response.headers() {
            // The body is re-framed when written back to the client.
            if !is_hop_by_hop(name) && name != CONTENT_LENGTH {
                session.response.headers.append(name.clone(), value.clone());
            }
        }
        session.response.body = response.bytes().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_classification() {
        assert!(is_hop_by_hop(&CONNECTION));
        assert!(is_hop_by_hop(&HOST));
        assert!(is_hop_by_hop(&HeaderName::from_static("proxy-authorization")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("authorization")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
