use crate::core::RequestData;

/// Extracts the value of a specific query parameter from an absolute URL.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let query = url.split_once('?').map(|(_, q)| q)?;
    query.split('&').find_map(|pair| {
        if let Some((k, v)) = pair.split_once('=') {
            if k == name {
                Some(v.trim())
            } else {
                None
            }
        } else if pair == name {
            Some("")
        } else {
            None
        }
    })
}

/// Whether a query parameter is present at all, with or without a value.
pub fn has_query_param(url: &str, name: &str) -> bool {
    get_query_value(url, name).is_some()
}

/// Composite throttling key joining throttlers to requests.
///
/// Microsoft Graph destinations group by host plus the first two path
/// segments (API version and workload), so a throttled `/v1.0/me` also
/// throttles `/v1.0/me/messages` but not `/v1.0/drives`. Other
/// destinations group by host only.
pub fn throttle_key(request: &RequestData) -> String {
    let host = request.host();
    if !crate::utils::msgraph::is_graph_host(host) {
        return host.to_string();
    }

    let path = request.path_and_query();
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(2).collect();
    format!("{host}/{}", segments.join("/"))
}
