use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{parse_target, DeliveryError, NO_CACHE};
use crate::metrics::{PROXY_REQUESTS, STREAMED_BYTES};
use crate::playlist::{is_playlist, is_transport_stream, rewrite_playlist, RewriteContext, PLAYLIST_CONTENT_TYPE};
use crate::AppState;

/// Request headers copied to the upstream fetch. Nothing else is forwarded.
const FORWARDED_HEADERS: [HeaderName; 5] = [
    header::ACCEPT,
    header::USER_AGENT,
    header::CACHE_CONTROL,
    header::PRAGMA,
    header::RANGE,
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub connect_timeout_secs: u64,
    /// Overrides the client's user agent on upstream requests when set.
    pub user_agent: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            user_agent: None,
        }
    }
}

impl ProxyConfig {
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
    }
}

/// Counts bytes handed to the client and optionally logs the rate.
pub struct MeteredStream<S> {
    inner: S,
    route: &'static str,
    label: String,
    log_bandwidth: bool,
    last_log_time: Instant,
    bytes_since_last_log: usize,
    total: u64,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, route: &'static str, label: String, log_bandwidth: bool) -> Self {
        Self {
            inner,
            route,
            label,
            log_bandwidth,
            last_log_time: Instant::now(),
            bytes_since_last_log: 0,
            total: 0,
        }
    }
}

impl<S, E> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            let len = bytes.len();
            self.total += len as u64;
            STREAMED_BYTES.with_label_values(&[self.route]).inc_by(len as u64);
            if self.log_bandwidth {
                self.bytes_since_last_log += len;
                let elapsed = self.last_log_time.elapsed();
                if elapsed >= Duration::from_secs(5) {
                    let rate_kb = (self.bytes_since_last_log as f64 / elapsed.as_secs_f64()) / 1024.0;
                    info!("Stream bandwidth: route={} src={} rate={:.2} KB/s", self.route, self.label, rate_kb);
                    self.last_log_time = Instant::now();
                    self.bytes_since_last_log = 0;
                }
            }
        }
        res
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        debug!("Body closed: route={} src={} bytes={}", self.route, self.label, self.total);
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub deint: Option<String>,
    pub host: Option<String>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true") | Some("yes"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn media_response(status: StatusCode, content_type: &str, body: Body) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Cache-Control", NO_CACHE)
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /proxy?url=&deint=&host=`
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, DeliveryError> {
    let target = parse_target(query.url.as_deref()).inspect_err(|e| {
        warn!("Proxy request rejected: url={:?} err={}", query.url, e);
    })?;
    let deinterlace = flag(query.deint.as_deref());
    let host = query
        .host
        .clone()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| header_str(&headers, &header::HOST).map(str::to_string));

    info!(
        "HTTP proxy request: url={} deint={} Range=\"{}\"",
        target,
        deinterlace,
        header_str(&headers, &header::RANGE).unwrap_or("<none>")
    );

    let mut request = state.http.get(target.clone());
    for name in &FORWARDED_HEADERS {
        if let Some(value) = headers.get(name) {
            request = request.header(name.clone(), value.clone());
        }
    }
    if let Some(ua) = &state.proxy.user_agent {
        request = request.header(header::USER_AGENT, ua.as_str());
    }

    let upstream = request.send().await.inspect_err(|e| {
        warn!("Upstream fetch failed: url={} err={}", target, e);
    })?;

    let status = upstream.status();
    if !status.is_success() {
        warn!("Upstream returned error: url={} status={}", target, status);
        return Err(DeliveryError::UpstreamStatus(status));
    }

    // Relative playlist entries resolve against where we actually ended up.
    let final_url = upstream.url().clone();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if is_playlist(&content_type, final_url.path()) {
        PROXY_REQUESTS.with_label_values(&["playlist"]).inc();
        let body = upstream.text().await?;
        let ctx = RewriteContext {
            source: final_url,
            deinterlace,
            host,
        };
        let rewritten = rewrite_playlist(&body, &ctx);
        STREAMED_BYTES
            .with_label_values(&["playlist"])
            .inc_by(rewritten.len() as u64);
        debug!("Playlist rewritten: src={} lines={}", ctx.source, rewritten.lines().count());
        return Ok(media_response(StatusCode::OK, PLAYLIST_CONTENT_TYPE, Body::from(rewritten)));
    }

    if deinterlace && is_transport_stream(&content_type, final_url.path()) {
        PROXY_REQUESTS.with_label_values(&["deinterlace"]).inc();
        let label = final_url.to_string();
        let output = state
            .transcoder
            .spawn_deinterlace(Box::pin(upstream.bytes_stream()), &label)
            .map_err(DeliveryError::Spawn)?
            .first_output(state.transcoder.config().first_output_timeout())
            .await
            .inspect_err(|e| warn!("Deinterlace failed to start: src={} err={}", label, e))?;
        let metered = MeteredStream::new(output, "deinterlace", label, state.monitoring.console_log_bandwidth);
        return Ok(media_response(StatusCode::OK, "video/mp2t", Body::from_stream(metered)));
    }

    PROXY_REQUESTS.with_label_values(&["passthrough"]).inc();
    let content_type = if content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        content_type
    };
    let passthrough: Vec<(HeaderName, axum::http::HeaderValue)> = [header::CONTENT_RANGE, header::ACCEPT_RANGES]
        .into_iter()
        .filter_map(|name| upstream.headers().get(&name).cloned().map(|v| (name, v)))
        .collect();

    let metered = MeteredStream::new(
        Box::pin(upstream.bytes_stream()),
        "passthrough",
        final_url.to_string(),
        state.monitoring.console_log_bandwidth,
    );
    let mut response = media_response(status, &content_type, Body::from_stream(metered));
    for (name, value) in passthrough {
        response.headers_mut().insert(name, value);
    }
    Ok(response)
}

/// `GET /proxy-transcode?url=`
pub async fn transcode_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
) -> Result<Response, DeliveryError> {
    let target = parse_target(query.url.as_deref())?;
    info!("HTTP transcode request: url={}", target);
    PROXY_REQUESTS.with_label_values(&["transcode"]).inc();

    let output = state
        .transcoder
        .spawn_transcode(target.as_str())
        .inspect_err(|e| warn!("ffmpeg spawn failed: url={} err={}", target, e))
        .map_err(DeliveryError::Spawn)?
        .first_output(state.transcoder.config().first_output_timeout())
        .await
        .inspect_err(|e| warn!("Transcode failed to start: url={} err={}", target, e))?;
    let metered = MeteredStream::new(
        output,
        "transcode",
        target.to_string(),
        state.monitoring.console_log_bandwidth,
    );
    Ok(media_response(StatusCode::OK, "video/mp2t", Body::from_stream(metered)))
}
