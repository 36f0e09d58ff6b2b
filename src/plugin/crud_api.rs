//! CRUD API simulation
//!
//! Serves a full create/read/update/delete API from a JSON data file, so a
//! client can be built against an API that does not exist yet. The API
//! shape comes from the hot-reloaded definition file; the backing
//! collection lives in memory and mutations do not persist across runs.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use serde_with::{serde_as, DisplayFromStr};
use validator::Validate;

use crate::{
    config::{
        loader::{FileLoader, LoadableConfig},
        resolve_config_path,
    },
    core::{
        request_guard, ProxyContext, ProxyError, ProxyPlugin, ProxyResult, Session, WatchSet,
    },
    logging::{MessageType, RequestLog},
    utils::response::ResponseBuilder,
};

pub const PLUGIN_NAME: &str = "crud-api";

/// Supported query shape: `$.[?(@.field == {param})]`.
static QUERY_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$\.\[\?\(@\.([A-Za-z0-9_-]+)\s*==\s*\{([^}]+)\}\)\]$")
        .expect("Invalid query shape regex")
});

/// Creates a CRUD API plugin instance with the given configuration.
pub fn create_crud_api_plugin(
    cfg: JsonValue,
    watch: WatchSet,
    ctx: &ProxyContext,
) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    let api_path = resolve_config_path(&config.api_file, &ctx.app_folder);
    let definition = FileLoader::<CrudApiDefinition>::new(api_path);

    Ok(Arc::new(PluginCrudApi {
        watch,
        definition,
        app_folder: ctx.app_folder.clone(),
        data: Mutex::new(DataCache::default()),
    }))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
struct PluginConfig {
    #[validate(length(min = 1))]
    api_file: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            api_file: "crud-api.json".to_string(),
        }
    }
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::serialization_error("Invalid CRUD API plugin config", e))?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrudAuth {
    #[default]
    None,
    Entra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrudActionKind {
    Create,
    GetAll,
    GetOne,
    GetMany,
    Merge,
    Update,
    Delete,
}

impl CrudActionKind {
    /// Default HTTP method when the action does not declare one.
    fn default_method(&self) -> Method {
        match self {
            CrudActionKind::Create => Method::POST,
            CrudActionKind::GetAll | CrudActionKind::GetOne | CrudActionKind::GetMany => {
                Method::GET
            }
            CrudActionKind::Merge => Method::PATCH,
            CrudActionKind::Update => Method::PUT,
            CrudActionKind::Delete => Method::DELETE,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudAction {
    pub action: CrudActionKind,

    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub method: Option<Method>,

    /// Path template under the base URL, e.g. `/{customer-id}`.
    #[serde(default)]
    pub url: String,

    /// Item selector, e.g. `$.[?(@.id == {customer-id})]`.
    #[serde(default)]
    pub query: Option<String>,

    /// Per-action auth override.
    #[serde(default)]
    pub auth: Option<CrudAuth>,
}

#[derive(Debug)]
struct CompiledAction {
    regex: Regex,
    param_names: Vec<String>,
    query: Option<CompiledQuery>,
}

#[derive(Debug)]
struct CompiledQuery {
    field: String,
    param: String,
}

/// The hot-reloaded `crud-api.json` shape plus compiled matchers.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudApiDefinition {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub data_file: String,

    #[serde(default)]
    pub auth: CrudAuth,

    #[serde(default)]
    pub actions: Vec<CrudAction>,

    #[serde(skip)]
    compiled: Vec<CompiledAction>,
}

impl LoadableConfig for CrudApiDefinition {
    const KIND: &'static str = "CRUD API definition";

    fn from_json(text: &str) -> ProxyResult<Self> {
        let mut parsed: CrudApiDefinition = serde_json::from_str(text)?;

        parsed.compiled = parsed
            .actions
            .iter()
            .map(|action| {
                let (regex, param_names) = compile_url_template(&action.url)?;
                let query = match &action.query {
                    None => None,
                    Some(query) => {
                        let captures = QUERY_SHAPE.captures(query).ok_or_else(|| {
                            ProxyError::Validation(format!("Unsupported CRUD query '{query}'"))
                        })?;
                        Some(CompiledQuery {
                            field: captures[1].to_string(),
                            param: captures[2].to_string(),
                        })
                    }
                };
                Ok(CompiledAction {
                    regex,
                    param_names,
                    query,
                })
            })
            .collect::<ProxyResult<Vec<_>>>()?;

        Ok(parsed)
    }

    fn empty() -> Self {
        Self::default()
    }
}

/// Turn a `/{param}`-style template into an anchored regex plus the
/// declared parameter names in order.
fn compile_url_template(template: &str) -> ProxyResult<(Regex, Vec<String>)> {
    let mut pattern = String::from("^");
    let mut param_names = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            return Err(ProxyError::Validation(format!(
                "Unbalanced parameter braces in CRUD URL '{template}'"
            )));
        };
        pattern.push_str(&regex::escape(&rest[..start]));
        pattern.push_str("([^/?]+)");
        param_names.push(rest[start + 1..start + end].to_string());
        rest = &rest[start + end + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');

    let regex = Regex::new(&pattern)
        .map_err(|e| ProxyError::Validation(format!("Invalid CRUD URL '{template}': {e}")))?;
    Ok((regex, param_names))
}

/// The in-memory collection and the data file it was loaded from.
#[derive(Debug, Default)]
struct DataCache {
    path: PathBuf,
    items: Vec<JsonValue>,
}

pub struct PluginCrudApi {
    watch: WatchSet,
    definition: Arc<FileLoader<CrudApiDefinition>>,
    app_folder: PathBuf,
    data: Mutex<DataCache>,
}

impl PluginCrudApi {
    /// Load the backing collection when first used or when the definition
    /// starts pointing at a different file.
    fn ensure_data(&self, definition: &CrudApiDefinition) {
        let path = {
            let resolved = resolve_config_path(&definition.data_file, &self.app_folder);
            if resolved.is_relative() {
                match self.definition.path().parent() {
                    Some(parent) => parent.join(resolved),
                    None => resolved,
                }
            } else {
                resolved
            }
        };

        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if data.path == path {
            return;
        }

        let items = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<JsonValue>(&text) {
                Ok(JsonValue::Array(items)) => items,
                Ok(_) => {
                    log::warn!("CRUD data file {} is not a JSON array", path.display());
                    Vec::new()
                }
                Err(e) => {
                    log::warn!("Invalid CRUD data file {}: {e}", path.display());
                    Vec::new()
                }
            },
            Err(e) => {
                log::warn!("Cannot read CRUD data file {}: {e}", path.display());
                Vec::new()
            }
        };

        *data = DataCache { path, items };
    }

    fn effective_auth(definition: &CrudApiDefinition, action: &CrudAction) -> CrudAuth {
        action.auth.unwrap_or(definition.auth)
    }

    fn validate_entra_token(session: &Session) -> bool {
        let Some(header) = session.request.header("authorization") else {
            return false;
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return false;
        };

        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return false;
        }
        let Ok(payload) = URL_SAFE_NO_PAD.decode(segments[1]) else {
            return false;
        };
        serde_json::from_slice::<JsonValue>(&payload).is_ok()
    }

    fn cors_headers(session: &Session) -> Vec<(String, String)> {
        match session.request.header("Origin") {
            Some(origin) => vec![(
                "Access-Control-Allow-Origin".to_string(),
                origin.to_string(),
            )],
            None => Vec::new(),
        }
    }

    /// Find the first item matching the action's query with the captured
    /// URL parameters bound.
    fn find_item_index(
        items: &[JsonValue],
        compiled: &CompiledAction,
        params: &[(String, String)],
    ) -> Option<usize> {
        let query = compiled.query.as_ref()?;
        let value = params
            .iter()
            .find(|(name, _)| *name == query.param)
            .map(|(_, value)| value.as_str())?;

        items
            .iter()
            .position(|item| json_value_matches(&item[&query.field], value))
    }

    fn filter_items(
        items: &[JsonValue],
        compiled: &CompiledAction,
        params: &[(String, String)],
    ) -> Vec<JsonValue> {
        let Some(query) = compiled.query.as_ref() else {
            return items.to_vec();
        };
        let Some(value) = params
            .iter()
            .find(|(name, _)| *name == query.param)
            .map(|(_, value)| value.as_str())
        else {
            return Vec::new();
        };

        items
            .iter()
            .filter(|item| json_value_matches(&item[&query.field], value))
            .cloned()
            .collect()
    }

    fn send_not_found(session: &mut Session, cors: Vec<(String, String)>) {
        ResponseBuilder::send_json(
            session,
            StatusCode::NOT_FOUND,
            cors,
            &json!({"message": "Not found"}),
        );
    }

    fn log_served(&self, session: &Session, ctx: &ProxyContext, status: StatusCode) {
        ctx.logger.log(
            session.id,
            RequestLog::single(
                MessageType::Mocked,
                format!("{} {}", status.as_u16(), session.request.url),
            )
            .with_plugin(PLUGIN_NAME),
        );
    }
}

fn json_value_matches(field: &JsonValue, raw: &str) -> bool {
    match field {
        JsonValue::String(s) => s == raw,
        JsonValue::Number(n) => n.to_string() == raw,
        JsonValue::Bool(b) => b.to_string() == raw,
        _ => false,
    }
}

#[async_trait]
impl ProxyPlugin for PluginCrudApi {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn init(&self, _ctx: &ProxyContext) -> ProxyResult<()> {
        self.definition.init_watcher()
    }

    async fn before_request(&self, session: &mut Session, ctx: &ProxyContext) -> ProxyResult<()> {
        if !request_guard(PLUGIN_NAME, &self.watch, session, ctx) {
            return Ok(());
        }

        let definition = self.definition.snapshot();
        if definition.base_url.is_empty() {
            return Ok(());
        }

        let url = session.request.url.clone();
        let Some(after_base) = url.strip_prefix(&definition.base_url) else {
            return Ok(());
        };
        let path = after_base.split('?').next().unwrap_or(after_base);

        let cors = Self::cors_headers(session);

        // CORS preflight never reaches the action table.
        if session.request.method == Method::OPTIONS {
            let mut headers = cors;
            headers.push((
                "Access-Control-Allow-Methods".to_string(),
                "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_string(),
            ));
            if let Some(requested) = session.request.header("Access-Control-Request-Headers") {
                headers.push((
                    "Access-Control-Allow-Headers".to_string(),
                    requested.to_string(),
                ));
            }
            session.set_generic_response(StatusCode::NO_CONTENT, &headers, bytes::Bytes::new());
            self.log_served(session, ctx, StatusCode::NO_CONTENT);
            return Ok(());
        }

        self.ensure_data(&definition);

        for (idx, action) in definition.actions.iter().enumerate() {
            let compiled = &definition.compiled[idx];
            let method = action
                .method
                .clone()
                .unwrap_or_else(|| action.action.default_method());
            if method != session.request.method {
                continue;
            }
            let Some(captures) = compiled.regex.captures(path) else {
                continue;
            };

            let params: Vec<(String, String)> = compiled
                .param_names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    (
                        name.clone(),
                        captures
                            .get(i + 1)
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default(),
                    )
                })
                .collect();

            if Self::effective_auth(&definition, action) == CrudAuth::Entra
                && !Self::validate_entra_token(session)
            {
                ResponseBuilder::send_json(
                    session,
                    StatusCode::UNAUTHORIZED,
                    cors,
                    &json!({"message": "Unauthorized. A valid bearer token is required."}),
                );
                self.log_served(session, ctx, StatusCode::UNAUTHORIZED);
                return Ok(());
            }

            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let status = match action.action {
                CrudActionKind::GetAll => {
                    ResponseBuilder::send_json(
                        session,
                        StatusCode::OK,
                        cors.clone(),
                        &JsonValue::Array(data.items.clone()),
                    );
                    StatusCode::OK
                }
                CrudActionKind::GetOne => {
                    match Self::find_item_index(&data.items, compiled, &params) {
                        Some(found) => {
                            let item = data.items[found].clone();
                            ResponseBuilder::send_json(session, StatusCode::OK, cors.clone(), &item);
                            StatusCode::OK
                        }
                        None => {
                            Self::send_not_found(session, cors.clone());
                            StatusCode::NOT_FOUND
                        }
                    }
                }
                CrudActionKind::GetMany => {
                    let items = Self::filter_items(&data.items, compiled, &params);
                    ResponseBuilder::send_json(
                        session,
                        StatusCode::OK,
                        cors.clone(),
                        &JsonValue::Array(items),
                    );
                    StatusCode::OK
                }
                CrudActionKind::Create => {
                    match serde_json::from_str::<JsonValue>(session.request.body_string()) {
                        Ok(item) => {
                            data.items.push(item.clone());
                            ResponseBuilder::send_json(
                                session,
                                StatusCode::CREATED,
                                cors.clone(),
                                &item,
                            );
                            StatusCode::CREATED
                        }
                        Err(_) => {
                            ResponseBuilder::send_json(
                                session,
                                StatusCode::BAD_REQUEST,
                                cors.clone(),
                                &json!({"message": "Request body is not valid JSON"}),
                            );
                            StatusCode::BAD_REQUEST
                        }
                    }
                }
                CrudActionKind::Merge => {
                    match Self::find_item_index(&data.items, compiled, &params) {
                        Some(found) => {
                            match serde_json::from_str::<JsonValue>(session.request.body_string()) {
                                Ok(JsonValue::Object(patch)) => {
                                    if let JsonValue::Object(target) = &mut data.items[found] {
                                        for (key, value) in patch {
                                            target.insert(key, value);
                                        }
                                    }
                                    session.set_generic_response(
                                        StatusCode::NO_CONTENT,
                                        &cors,
                                        bytes::Bytes::new(),
                                    );
                                    StatusCode::NO_CONTENT
                                }
                                _ => {
                                    ResponseBuilder::send_json(
                                        session,
                                        StatusCode::BAD_REQUEST,
                                        cors.clone(),
                                        &json!({"message": "Request body is not a JSON object"}),
                                    );
                                    StatusCode::BAD_REQUEST
                                }
                            }
                        }
                        None => {
                            Self::send_not_found(session, cors.clone());
                            StatusCode::NOT_FOUND
                        }
                    }
                }
                CrudActionKind::Update => {
                    match Self::find_item_index(&data.items, compiled, &params) {
                        Some(found) => {
                            match serde_json::from_str::<JsonValue>(session.request.body_string()) {
                                Ok(item) => {
                                    data.items[found] = item;
                                    session.set_generic_response(
                                        StatusCode::NO_CONTENT,
                                        &cors,
                                        bytes::Bytes::new(),
                                    );
                                    StatusCode::NO_CONTENT
                                }
                                Err(_) => {
                                    ResponseBuilder::send_json(
                                        session,
                                        StatusCode::BAD_REQUEST,
                                        cors.clone(),
                                        &json!({"message": "Request body is not valid JSON"}),
                                    );
                                    StatusCode::BAD_REQUEST
                                }
                            }
                        }
                        None => {
                            Self::send_not_found(session, cors.clone());
                            StatusCode::NOT_FOUND
                        }
                    }
                }
                CrudActionKind::Delete => {
                    match Self::find_item_index(&data.items, compiled, &params) {
                        Some(found) => {
                            data.items.remove(found);
                            session.set_generic_response(
                                StatusCode::NO_CONTENT,
                                &cors,
                                bytes::Bytes::new(),
                            );
                            StatusCode::NO_CONTENT
                        }
                        None => {
                            Self::send_not_found(session, cors.clone());
                            StatusCode::NOT_FOUND
                        }
                    }
                }
            };

            self.log_served(session, ctx, status);
            return Ok(());
        }

        Ok(())
    }
}
