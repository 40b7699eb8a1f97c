use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use http_body_util::BodyExt;
use tower::util::ServiceExt;
use zaptv::{
    create_app,
    metrics::MonitoringConfig,
    proxy::ProxyConfig,
    remux::RemuxConfig,
    transcoder::{Transcoder, TranscoderConfig, TuningMode},
    AppState, RemuxDebug,
};

fn test_state(root: &std::path::Path) -> Arc<AppState> {
    // Spawning always fails.
    state_with_ffmpeg(root, &["/nonexistent/ffmpeg"], 20)
}

/// State whose ffmpeg is `command` followed by the usual ffmpeg arguments.
fn state_with_ffmpeg(root: &std::path::Path, command: &[&str], first_output_timeout_secs: u64) -> Arc<AppState> {
    let transcoder = Transcoder::new(
        TranscoderConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            first_output_timeout_secs,
            ..TranscoderConfig::default()
        },
        TuningMode::LowLatency,
    );
    let remux = RemuxConfig {
        root: root.to_path_buf(),
        startup_timeout_secs: 2,
        poll_interval_ms: 50,
    };
    AppState::new(ProxyConfig::default(), transcoder, remux, MonitoringConfig::default()).unwrap()
}

async fn get_response(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_proxy_rejects_bad_targets_before_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    for uri in [
        "/proxy",
        "/proxy?url=",
        "/proxy?url=ftp%3A%2F%2Fexample.com%2Ffile.ts",
        "/proxy?url=not%20a%20url",
        "/proxy-transcode?url=file%3A%2F%2F%2Fetc%2Fpasswd",
    ] {
        let (status, headers, _) = get_response(app.clone(), uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "uri={uri}");
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["cache-control"], "no-store, no-cache, must-revalidate");
    }
}

#[tokio::test]
async fn test_remux_start_validation() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let (status, _, body) = get_response(app.clone(), "/remux/start?mode=copy").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("missing url"));

    let (status, _, _) = get_response(
        app.clone(),
        "/remux/start?url=http%3A%2F%2Fexample.com%2Fa.ts&mode=bogus",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_remux_spawn_failure_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let (status, _, body) = get_response(
        app.clone(),
        "/remux/start?url=http%3A%2F%2Fexample.com%2Fa.ts&mode=copy",
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("error"));

    let (_, _, body) = get_response(app, "/remux/debug").await;
    let debug: RemuxDebug = serde_json::from_str(&body).unwrap();
    assert!(debug.jobs.is_empty());
}

#[tokio::test]
async fn test_remux_debug_and_stop_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let (status, _, body) = get_response(app.clone(), "/remux/debug").await;
    assert_eq!(status, StatusCode::OK);
    let debug: RemuxDebug = serde_json::from_str(&body).unwrap();
    assert!(debug.jobs.is_empty());

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/remux/copy-0000000000000000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remux_asset_containment() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("copy-abc")).unwrap();
    std::fs::write(dir.path().join("copy-abc").join("index.m3u8"), "#EXTM3U\n").unwrap();
    std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();
    let app = create_app(test_state(dir.path()));

    let (status, headers, body) = get_response(app.clone(), "/remux/hls/copy-abc/index.m3u8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/vnd.apple.mpegurl");
    assert_eq!(body, "#EXTM3U\n");

    let (status, _, _) = get_response(app.clone(), "/remux/hls/copy-abc/..%2Fsecret.txt").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = get_response(app.clone(), "/remux/hls/copy-abc/missing.ts").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let (status, _, body) = get_response(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, _, body) = get_response(app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("zaptv_remux_active_jobs"));

    let (status, _, _) = get_response(app, "/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

async fn spawn_upstream() -> std::net::SocketAddr {
    let upstream = Router::new()
        .route(
            "/hls/chan/index.m3u8",
            get(|| async {
                (
                    [("content-type", "application/vnd.apple.mpegurl")],
                    "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_1.ts\n",
                )
            }),
        )
        .route("/moved.m3u8", get(|| async { axum::response::Redirect::temporary("/hls/chan/index.m3u8") }))
        .route(
            "/media/clip.bin",
            get(|| async { ([("content-type", "application/x-custom")], "raw-bytes") }),
        )
        .route("/denied.ts", get(|| async { StatusCode::FORBIDDEN }))
        .route(
            "/live/chan.ts",
            get(|| async { ([("content-type", "video/mp2t")], "TSDATA") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });
    addr
}

fn decoded_url_param(line: &str) -> String {
    let parsed = url::Url::parse(line).unwrap();
    parsed
        .query_pairs()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

#[tokio::test]
async fn test_proxy_rewrites_playlist_through_redirect() {
    let addr = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let target = format!("http://{addr}/moved.m3u8");
    let uri = format!(
        "/proxy?url={}&deint=1&host=10.0.0.2%3A3005",
        urlencoding::encode(&target)
    );
    let (status, headers, body) = get_response(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/vnd.apple.mpegurl");
    assert_eq!(headers["access-control-allow-origin"], "*");

    let segment = body.lines().find(|l| !l.starts_with('#')).unwrap();
    assert!(segment.starts_with("http://10.0.0.2:3005/proxy?url="));
    assert_eq!(decoded_url_param(segment), format!("http://{addr}/hls/chan/seg_1.ts"));
}

#[tokio::test]
async fn test_proxy_passthrough_and_upstream_errors() {
    let addr = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(test_state(dir.path()));

    let uri = format!("/proxy?url={}", urlencoding::encode(&format!("http://{addr}/media/clip.bin")));
    let (status, headers, body) = get_response(app.clone(), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/x-custom");
    assert_eq!(body, "raw-bytes");

    let uri = format!("/proxy?url={}", urlencoding::encode(&format!("http://{addr}/denied.ts")));
    let (status, _, _) = get_response(app.clone(), &uri).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Nothing listens on port 9 of the loopback in the test environment.
    let uri = format!("/proxy?url={}", urlencoding::encode("http://127.0.0.1:9/x.ts"));
    let (status, _, body) = get_response(app, &uri).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("upstream fetch failed"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_proxy_deinterlace_pipes_through_ffmpeg() {
    let addr = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    // Marks its output, then copies stdin to stdout.
    let app = create_app(state_with_ffmpeg(dir.path(), &["sh", "-c", "printf 'DEINT:'; cat", "ffmpeg"], 10));

    let uri = format!(
        "/proxy?url={}&deint=1",
        urlencoding::encode(&format!("http://{addr}/live/chan.ts"))
    );
    let (status, headers, body) = get_response(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "video/mp2t");
    assert_eq!(body, "DEINT:TSDATA");
}

#[cfg(unix)]
#[tokio::test]
async fn test_transcode_startup_failure_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(state_with_ffmpeg(
        dir.path(),
        &["sh", "-c", "echo 'Connection refused' >&2; exit 1", "ffmpeg"],
        10,
    ));

    let (status, headers, body) =
        get_response(app, "/proxy-transcode?url=http%3A%2F%2F127.0.0.1%3A9%2Fx.m3u8").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert!(body.contains("Connection refused"), "body={body}");
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    // Zombies count as gone; the runtime reaps them in the background.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(
            stat.rsplit_once(')').and_then(|(_, rest)| rest.trim_start().chars().next()),
            Some('Z') | Some('X')
        ),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_for_exit(pid: u32) {
    for _ in 0..100 {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("ffmpeg pid {pid} still running");
}

#[cfg(target_os = "linux")]
fn read_pid(path: &std::path::Path) -> u32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_silent_transcode_is_504_and_killed() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("ffmpeg.pid");
    let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
    let app = create_app(state_with_ffmpeg(dir.path(), &["sh", "-c", &script, "ffmpeg"], 1));

    let (status, _, _) = get_response(app, "/proxy-transcode?url=http%3A%2F%2F127.0.0.1%3A9%2Fx.m3u8").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    wait_for_exit(read_pid(&pid_file)).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_transcode_process_dies_with_response() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("ffmpeg.pid");
    let script = format!(
        "echo $$ > '{}'; while :; do printf x; sleep 0.05; done",
        pid_file.display()
    );
    let app = create_app(state_with_ffmpeg(dir.path(), &["sh", "-c", &script, "ffmpeg"], 10));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/proxy-transcode?url=http%3A%2F%2F127.0.0.1%3A9%2Fx.m3u8")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
    assert!(first.starts_with(b"x"));

    let pid = read_pid(&pid_file);
    assert!(process_alive(pid));
    drop(body);
    wait_for_exit(pid).await;
}
