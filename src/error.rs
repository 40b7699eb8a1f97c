use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::remux::RemuxError;
use crate::transcoder::StartupError;

pub const NO_CACHE: &str = "no-store, no-cache, must-revalidate";

/// Failures surfaced by the delivery endpoints. Every variant maps to one
/// HTTP status; none of them ever takes the server down.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("missing url parameter")]
    MissingUrl,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("failed to start ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Remux(#[from] RemuxError),

    #[error("not found")]
    NotFound,
}

impl DeliveryError {
    pub fn status(&self) -> StatusCode {
        match self {
            DeliveryError::MissingUrl
            | DeliveryError::InvalidUrl(_)
            | DeliveryError::UnsupportedScheme(_) => StatusCode::BAD_REQUEST,
            DeliveryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DeliveryError::UpstreamStatus(status) => *status,
            DeliveryError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DeliveryError::Startup(StartupError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            DeliveryError::Startup(StartupError::Ended(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            DeliveryError::Remux(e) => e.status(),
            DeliveryError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status = self.status();
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Cache-Control", NO_CACHE)
            .header("Access-Control-Allow-Origin", "*")
            .body(Body::from(self.to_string()))
            .unwrap_or_else(|_| status.into_response())
    }
}

/// Parses and validates a target URL taken from a query string. Only http and
/// https targets are accepted; everything else is refused before any fetch.
pub fn parse_target(raw: Option<&str>) -> Result<url::Url, DeliveryError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(DeliveryError::MissingUrl)?;
    let parsed = url::Url::parse(raw).map_err(|e| DeliveryError::InvalidUrl(format!("{raw} ({e})")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DeliveryError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert!(parse_target(Some("http://example.com/live/a/b/1.m3u8")).is_ok());
        assert!(parse_target(Some(" https://example.com/x.ts ")).is_ok());
        assert!(matches!(parse_target(None), Err(DeliveryError::MissingUrl)));
        assert!(matches!(parse_target(Some("")), Err(DeliveryError::MissingUrl)));
        assert!(matches!(
            parse_target(Some("ftp://example.com/file.ts")),
            Err(DeliveryError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(parse_target(Some("not a url")), Err(DeliveryError::InvalidUrl(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(DeliveryError::MissingUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            DeliveryError::Remux(RemuxError::AssetForbidden).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            DeliveryError::UpstreamStatus(StatusCode::FORBIDDEN).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            DeliveryError::from(StartupError::Timeout(std::time::Duration::from_secs(1))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            DeliveryError::from(StartupError::Ended("exit status: 1".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
