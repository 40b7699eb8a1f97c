pub mod catalog;
pub mod error;
pub mod metrics;
pub mod player;
pub mod playlist;
pub mod proxy;
pub mod remux;
pub mod transcoder;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use error::{parse_target, DeliveryError, NO_CACHE};
use metrics::MonitoringConfig;
use proxy::ProxyConfig;
use remux::{asset_content_type, JobInfo, RemuxConfig, RemuxError, RemuxManager};
use transcoder::{RemuxMode, Transcoder};

pub struct AppState {
    pub(crate) http: reqwest::Client,
    pub(crate) transcoder: Transcoder,
    pub(crate) remux: RemuxManager,
    pub(crate) proxy: ProxyConfig,
    pub(crate) monitoring: MonitoringConfig,
}

impl AppState {
    /// Must be called from within a tokio runtime.
    pub fn new(
        proxy: ProxyConfig,
        transcoder: Transcoder,
        remux: RemuxConfig,
        monitoring: MonitoringConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let http = proxy.build_client()?;
        let remux = RemuxManager::new(remux, transcoder.clone());
        Ok(Arc::new(Self {
            http,
            transcoder,
            remux,
            proxy,
            monitoring,
        }))
    }

    pub fn remux(&self) -> &RemuxManager {
        &self.remux
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy", get(proxy::proxy_handler))
        .route("/proxy-transcode", get(proxy::transcode_handler))
        .route("/remux/start", get(remux_start_handler))
        .route("/remux/debug", get(remux_debug_handler))
        .route("/remux/hls/{key}/{asset}", get(remux_asset_handler))
        .route("/remux/{key}", delete(remux_stop_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    DeliveryError::NotFound
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let mut response = (status, Json(value)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static(NO_CACHE));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    response
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn json_error(err: DeliveryError) -> Response {
    json_response(err.status(), &ErrorBody { error: err.to_string() })
}

#[derive(Debug, Deserialize)]
struct RemuxStartQuery {
    url: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemuxStarted {
    pub key: String,
    pub mode: RemuxMode,
    pub manifest: String,
}

async fn remux_start_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemuxStartQuery>,
) -> Response {
    let target = match parse_target(query.url.as_deref()) {
        Ok(t) => t,
        Err(e) => {
            warn!("Remux start rejected: url={:?} err={}", query.url, e);
            return json_error(e);
        }
    };
    let raw_mode = query.mode.as_deref().unwrap_or("");
    let Some(mode) = RemuxMode::parse(raw_mode) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorBody {
                error: format!("unknown mode {raw_mode:?} (expected copy or transcode)"),
            },
        );
    };

    match state.remux.start(target.as_str(), mode).await {
        Ok(job) => {
            let file = job
                .playlist_path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("index.m3u8");
            json_response(
                StatusCode::OK,
                &RemuxStarted {
                    manifest: format!("/remux/hls/{}/{}", job.key, file),
                    key: job.key,
                    mode: job.mode,
                },
            )
        }
        Err(e) => {
            warn!("Remux start failed: url={} mode={} err={}", target, mode.as_str(), e);
            json_error(DeliveryError::Remux(e))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemuxDebug {
    pub jobs: Vec<JobInfo>,
}

async fn remux_debug_handler(State(state): State<Arc<AppState>>) -> Response {
    json_response(StatusCode::OK, &RemuxDebug { jobs: state.remux.jobs().await })
}

async fn remux_stop_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, DeliveryError> {
    state.remux.stop(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remux_asset_handler(
    State(state): State<Arc<AppState>>,
    Path((key, asset)): Path<(String, String)>,
) -> Result<Response, DeliveryError> {
    let path = state
        .remux
        .resolve_asset(&key, &asset)
        .await
        .inspect_err(|e| {
            if matches!(e, RemuxError::AssetForbidden) {
                warn!("Remux asset outside root refused: key={:?} asset={:?}", key, asset);
            }
        })?;

    let bytes = tokio::fs::read(&path).await.map_err(|_| DeliveryError::NotFound)?;
    Response::builder()
        .header("Content-Type", asset_content_type(&asset))
        .header("Content-Length", bytes.len().to_string())
        .header("Cache-Control", NO_CACHE)
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(bytes))
        .map_err(|_| DeliveryError::NotFound)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.monitoring.enabled {
        return DeliveryError::NotFound.into_response();
    }
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .header("Cache-Control", NO_CACHE)
        .body(Body::from(metrics::gather_metrics()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
