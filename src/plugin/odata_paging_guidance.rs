//! OData paging guidance
//!
//! Remembers every `@odata.nextLink` advertised in response bodies. A GET
//! that carries paging parameters without having been advertised first was
//! hand-built by the client, which breaks against services whose paging
//! tokens are opaque; such requests get a Warning.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use http::Method;
use serde_json::Value as JsonValue;

use crate::{
    core::{
        request_guard, url_in_scope, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session,
        WatchSet,
    },
    logging::{MessageType, RequestLog},
    utils::request::has_query_param,
};

pub const PLUGIN_NAME: &str = "odata-paging-guidance";

const NEXT_LINK: &str = "@odata.nextLink";

/// Query parameters only a service-issued paging link should carry.
const PAGING_PARAMS: &[&str] = &["$skip", "$skiptoken", "%24skip", "%24skiptoken"];

/// Creates an OData Paging Guidance plugin instance.
pub fn create_odata_paging_guidance_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    _ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    if !cfg.is_null() && cfg.as_object().map(|o| !o.is_empty()).unwrap_or(true) {
        return Err(ProxyError::Configuration(
            "The OData paging guidance plugin takes no configuration".to_string(),
        ));
    }
    Ok(Arc::new(PluginODataPagingGuidance { watch }))
}

type AdvertisedLinks = Mutex<HashSet<String>>;

pub struct PluginODataPagingGuidance {
    watch: WatchSet,
}

impl PluginODataPagingGuidance {
    fn is_paging_url(url: &str) -> bool {
        PAGING_PARAMS.iter().any(|p| has_query_param(url, p))
    }

    /// Walk a response body and collect every nextLink, nested collections
    /// included.
    fn collect_next_links(value: &JsonValue, links: &mut Vec<String>) {
        match value {
            JsonValue::Object(map) => {
                for (key, value) in map {
                    if key == NEXT_LINK {
                        if let Some(link) = value.as_str() {
                            links.push(link.to_string());
                        }
                    } else {
                        Self::collect_next_links(value, links);
                    }
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    Self::collect_next_links(item, links);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ProxyPlugin for PluginODataPagingGuidance {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }
        if session.request.method != Method::GET || !Self::is_paging_url(&session.request.url) {
            return Ok(());
        }

        let links = ctx
            .state
            .global_or_insert_with::<AdvertisedLinks, _>(PLUGIN_NAME, || {
                Mutex::new(HashSet::new())
            });
        let advertised = links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&session.request.url);

        if !advertised {
            ctx.logger.log(
                session.id,
                RequestLog::new(
                    MessageType::Warning,
                    vec![
                        "This paging URL was not returned by the API.".to_string(),
                        "Use the value of @odata.nextLink instead of building paging URLs by hand."
                            .to_string(),
                    ],
                )
                .with_plugin(PLUGIN_NAME),
            );
        }

        Ok(())
    }

    async fn before_response(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !url_in_scope(&self.watch, session, ctx) {
            return Ok(());
        }

        let is_json = session
            .response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(());
        }

        let Ok(body) = serde_json::from_slice::<JsonValue>(&session.response.body) else {
            return Ok(());
        };
        let mut found = Vec::new();
        Self::collect_next_links(&body, &mut found);
        if found.is_empty() {
            return Ok(());
        }

        let links = ctx
            .state
            .global_or_insert_with::<AdvertisedLinks, _>(PLUGIN_NAME, || {
                Mutex::new(HashSet::new())
            });
        let mut links = links.lock().unwrap_or_else(|e| e.into_inner());
        for link in found {
            links.insert(link);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue};

    use super::*;
    use crate::{core::{RequestData, SharedState}, logging::RequestLogger};

    fn get_context() -> ProxyContext {
        ProxyContext {
            state: Arc::new(SharedState::new()),
            logger: Arc::new(RequestLogger::new(false)),
            watch: Arc::new(WatchSet::from_specs(&["https://*"]).unwrap()),
            app_folder: PathBuf::from("."),
        }
    }

    fn get_session(id: u64, url: &str) -> Session {
        Session::new(
            id,
            RequestData::new(Method::GET, url, HeaderMap::new(), Bytes::new()),
        )
    }

    fn get_plugin() -> PluginODataPagingGuidance {
        PluginODataPagingGuidance {
            watch: WatchSet::default(),
        }
    }

    async fn advertise(plugin: &PluginODataPagingGuidance, ctx: &ProxyContext, link: &str) {
        let mut session = get_session(100, "https://graph.microsoft.com/v1.0/users");
        session.response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        session.response.body = Bytes::from(
            serde_json::json!({ "value": [], "@odata.nextLink": link }).to_string(),
        );
        plugin.before_response(&mut session, ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_advertised_link_produces_no_warning() {
        let ctx = get_context();
        let plugin = get_plugin();
        let link = "https://graph.microsoft.com/v1.0/users?$skip=10";
        advertise(&plugin, &ctx, link).await;

        let mut session = get_session(1, link);
        plugin.before_request(&mut session, &ctx).await.unwrap();

        let records = ctx.logger.complete(1, "GET", link);
        assert!(!records.iter().any(|r| r.message_type == MessageType::Warning));
    }

    #[tokio::test]
    async fn test_hand_built_paging_url_warns() {
        let ctx = get_context();
        let plugin = get_plugin();
        advertise(
            &plugin,
            &ctx,
            "https://graph.microsoft.com/v1.0/users?$skip=10",
        )
        .await;

        let url = "https://graph.microsoft.com/v1.0/users?$skip=20";
        let mut session = get_session(1, url);
        plugin.before_request(&mut session, &ctx).await.unwrap();

        let records = ctx.logger.complete(1, "GET", url);
        assert!(records.iter().any(|r| r.message_type == MessageType::Warning));
    }

    #[tokio::test]
    async fn test_non_paging_get_is_ignored() {
        let ctx = get_context();
        let plugin = get_plugin();

        let url = "https://graph.microsoft.com/v1.0/users?$top=10";
        let mut session = get_session(1, url);
        plugin.before_request(&mut session, &ctx).await.unwrap();

        let records = ctx.logger.complete(1, "GET", url);
        assert!(!records.iter().any(|r| r.message_type == MessageType::Warning));
    }

    #[test]
    fn test_collect_nested_next_links() {
        let body = serde_json::json!({
            "value": [
                { "inner": { "@odata.nextLink": "https://a/" } }
            ],
            "@odata.nextLink": "https://b/"
        });
        let mut links = Vec::new();
        PluginODataPagingGuidance::collect_next_links(&body, &mut links);
        links.sort();
        assert_eq!(links, vec!["https://a/", "https://b/"]);
    }
}
