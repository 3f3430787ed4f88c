//! HTTP surface: proxy fetch, snapshot fetch and feed import.

use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use crate::config::{NavigationMode, ProxyConfig, ScriptPolicy};
use crate::feed::{PriceMode, import_feed};
use crate::fetch::{FetchRequest, PageFetcher, fetch_document};
use crate::widget::Product;
use crate::{Error, ErrorKind};

pub const SNAPSHOT_PATH: &str = "/api/preview-snapshot";
pub const FEED_PATH: &str = "/api/fetch-xml";
const NAV_PARAM: &str = "nav";
const SCRIPTS_PARAM: &str = "scripts";

#[derive(Clone)]
pub struct AppState {
    pub fetcher: Arc<dyn PageFetcher>,
    /// Service defaults; per-request overrides arrive as query parameters.
    pub config: ProxyConfig,
    pub cache_max_age: u64,
}

impl AppState {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: ProxyConfig, cache_max_age: u64) -> Self {
        Self {
            fetcher,
            config,
            cache_max_age,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let proxy_path = state.config.endpoint.path().to_string();
    Router::new()
        .route(&proxy_path, get(proxy))
        .route(SNAPSHOT_PATH, post(snapshot))
        .route(FEED_PATH, post(fetch_xml))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// JSON error body carrying the category and its status code.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.0.category();
        match self.0.kind() {
            ErrorKind::UpstreamFailure | ErrorKind::InternalError => {
                warn!(error = %self.0, category = category.as_str(), "request failed")
            }
            _ => debug!(error = %self.0, category = category.as_str(), "request rejected"),
        }
        let status =
            StatusCode::from_u16(category.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.0.to_string(),
            "category": category.as_str(),
        }));
        (status, body).into_response()
    }
}

/// Query of one proxy request: the target, optional mode overrides and any
/// leftover fields (routed GET forms) that belong to the target.
#[derive(Debug, Default)]
struct ProxyQuery {
    target: Option<String>,
    navigation: Option<NavigationMode>,
    scripts: Option<ScriptPolicy>,
    extra: Vec<(String, String)>,
}

impl ProxyQuery {
    fn parse(raw: &str, config: &ProxyConfig) -> Self {
        let mut query = Self::default();
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            if key == config.endpoint.param() {
                if query.target.is_none() {
                    query.target = Some(value.into_owned());
                }
            } else if key == NAV_PARAM {
                query.navigation = value.parse().ok();
            } else if key == SCRIPTS_PARAM {
                query.scripts = value.parse().ok();
            } else if !config
                .endpoint
                .fixed_params()
                .iter()
                .any(|(fixed, _)| *fixed == key)
            {
                query.extra.push((key.into_owned(), value.into_owned()));
            }
        }
        query
    }

    fn request(&self) -> Result<FetchRequest, Error> {
        let request = FetchRequest::parse(self.target.as_deref().unwrap_or_default())?;
        if self.extra.is_empty() {
            return Ok(request);
        }
        let mut url = request.target_url().clone();
        url.query_pairs_mut()
            .extend_pairs(&self.extra);
        Ok(FetchRequest::from(url))
    }
}

// Wrapped links must point back at this service even though the document's
// `<base>` names the upstream origin.
fn service_origin(headers: &HeaderMap) -> Option<Url> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|proto| matches!(*proto, "http" | "https"))
        .unwrap_or("http");
    Url::parse(&format!("{scheme}://{host}/")).ok()
}

async fn proxy(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = ProxyQuery::parse(raw.as_deref().unwrap_or_default(), &state.config);
    let request = query.request()?;

    let mut config = ProxyConfig::new(
        query.navigation.unwrap_or(state.config.navigation),
        query.scripts.unwrap_or(state.config.scripts),
    )
    .with_endpoint(state.config.endpoint.clone());
    if let Some(origin) = service_origin(&headers) {
        config.endpoint = config.endpoint.with_origin(origin);
    }
    config.endpoint = config.endpoint_for_links(&state.config);

    let document = fetch_document(state.fetcher.as_ref(), &request, &config).await?;

    let cache_control = HeaderValue::from_str(&format!("private, max-age={}", state.cache_max_age))
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
            (header::CACHE_CONTROL, cache_control),
        ],
        document.html,
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotRequest {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub html: String,
}

async fn snapshot(
    State(state): State<AppState>,
    Json(body): Json<SnapshotRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let request = FetchRequest::parse(&body.url)?;
    let config = ProxyConfig::snapshot().with_endpoint(state.config.endpoint.clone());
    let document = fetch_document(state.fetcher.as_ref(), &request, &config).await?;
    Ok(Json(SnapshotResponse {
        html: document.html,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedRequest {
    pub url: String,
    pub price_mode: PriceMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeedResponse {
    pub products: Vec<Product>,
}

async fn fetch_xml(
    State(state): State<AppState>,
    Json(body): Json<FeedRequest>,
) -> Result<Json<FeedResponse>, ApiError> {
    let products = import_feed(state.fetcher.as_ref(), &body.url, body.price_mode).await?;
    Ok(Json(FeedResponse { products }))
}
