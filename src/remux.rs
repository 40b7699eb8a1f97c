use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use axum::http::StatusCode;
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::metrics::REMUX_ACTIVE_JOBS;
use crate::transcoder::{playlist_path, spawn_cpu_monitor, RemuxMode, StderrRing, Transcoder};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    pub root: PathBuf,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("zaptv-remux"),
            startup_timeout_secs: 20,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    #[error("failed to prepare output directory: {0}")]
    Prepare(std::io::Error),

    #[error("failed to start ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("ffmpeg did not produce a playlist within {0:?}")]
    StartupTimeout(Duration),

    #[error("ffmpeg exited before producing a playlist (status {0})")]
    Exited(String),

    #[error("no such remux job")]
    UnknownJob,

    #[error("asset path escapes the remux root")]
    AssetForbidden,

    #[error("asset not found")]
    AssetNotFound,
}

impl RemuxError {
    pub fn status(&self) -> StatusCode {
        match self {
            RemuxError::Prepare(_) | RemuxError::Spawn(_) | RemuxError::Exited(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RemuxError::StartupTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RemuxError::UnknownJob | RemuxError::AssetNotFound => StatusCode::NOT_FOUND,
            RemuxError::AssetForbidden => StatusCode::FORBIDDEN,
        }
    }
}

/// Lifecycle of one remux process.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Spawned,
    Ready(PathBuf),
    Exited(Option<i32>),
}

impl JobState {
    fn label(&self) -> &'static str {
        match self {
            JobState::Spawned => "spawned",
            JobState::Ready(_) => "ready",
            JobState::Exited(_) => "exited",
        }
    }
}

struct JobHandle {
    id: u64,
    key: String,
    source_url: String,
    mode: RemuxMode,
    pid: Option<u32>,
    output_dir: PathBuf,
    playlist_path: PathBuf,
    started_at: Instant,
    state: watch::Sender<JobState>,
    stop: watch::Sender<bool>,
}

impl JobHandle {
    fn has_exited(&self) -> bool {
        matches!(*self.state.borrow(), JobState::Exited(_))
    }
}

#[derive(Debug, Clone)]
pub struct StartedJob {
    pub key: String,
    pub mode: RemuxMode,
    pub playlist_path: PathBuf,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub key: String,
    pub mode: RemuxMode,
    pub pid: Option<u32>,
    pub source_url: String,
    pub state: String,
    pub uptime_secs: u64,
}

fn stable_hash_u64(value: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic job key for a `(mode, url)` pair. Safe to use as a
/// directory name and as a URL path segment.
pub fn job_key(mode: RemuxMode, url: &str) -> String {
    let hash = stable_hash_u64(&format!("{}|{}", mode.as_str(), url));
    format!("{}-{hash:016x}", mode.as_str())
}

async fn clean_output_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(d) => d,
        Err(_) => return,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            if name.ends_with(".m3u8") || name.ends_with(".ts") || name.ends_with(".tmp") {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }
}

/// Events that can leave a complete playlist behind. Removals and metadata
/// changes never make a job ready.
fn writes_file(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
            | EventKind::Modify(ModifyKind::Any)
    )
}

async fn manifest_exists(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.len() > 0)
}

#[derive(Clone)]
pub struct RemuxManager {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Mutex<HashMap<String, Arc<JobHandle>>>,
    root: PathBuf,
    transcoder: Transcoder,
    startup_timeout: Duration,
    poll_interval: Duration,
    next_id: AtomicU64,
    spawned: AtomicUsize,
    _watcher: Option<std::sync::Mutex<RecommendedWatcher>>,
}

impl RemuxManager {
    pub fn new(config: RemuxConfig, transcoder: Transcoder) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.root) {
            warn!("Failed to create remux root {}: {}", config.root.display(), e);
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .and_then(|mut w| w.watch(&config.root, RecursiveMode::Recursive).map(|_| w));
        let watcher = match watcher {
            Ok(w) => Some(std::sync::Mutex::new(w)),
            Err(e) => {
                // Readiness still works through polling.
                warn!("Remux file watcher unavailable, polling only: {}", e);
                None
            }
        };

        let inner = Arc::new(Inner {
            jobs: Mutex::new(HashMap::new()),
            root: config.root,
            transcoder,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            next_id: AtomicU64::new(1),
            spawned: AtomicUsize::new(0),
            _watcher: watcher,
        });

        let inner_for_task = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !writes_file(&event.kind) {
                    continue;
                }
                // Renames report the destination last.
                let Some(path) = event
                    .paths
                    .iter()
                    .rev()
                    .find(|p| p.file_name().and_then(|s| s.to_str()) == Some("index.m3u8"))
                else {
                    continue;
                };
                let Some(inner) = inner_for_task.upgrade() else { break };
                let jobs = inner.jobs.lock().await;
                // Linear scan; the number of jobs is small.
                if let Some(job) = jobs.values().find(|j| path.starts_with(&j.output_dir)) {
                    mark_ready(job).await;
                }
            }
        });

        Self { inner }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Number of ffmpeg processes this manager has ever spawned.
    pub fn spawned_count(&self) -> usize {
        self.inner.spawned.load(Ordering::Acquire)
    }

    /// Returns the running job for `(mode, url)` or starts one and waits for
    /// its first playlist. Registration happens before any await on the new
    /// process, so concurrent callers for the same key share one ffmpeg.
    pub async fn start(&self, url: &str, mode: RemuxMode) -> Result<StartedJob, RemuxError> {
        let key = job_key(mode, url);

        let job = {
            let mut jobs = self.inner.jobs.lock().await;
            if let Some(existing) = jobs.get(&key) {
                if !existing.has_exited() {
                    info!("Remux job reused: key={} pid={:?}", key, existing.pid);
                    return Ok(StartedJob {
                        key,
                        mode,
                        playlist_path: existing.playlist_path.clone(),
                        reused: true,
                    });
                }
                // Its supervisor has not removed it yet; the id check there
                // keeps it from touching the replacement.
                debug!("Remux job exited, replacing: key={} pid={:?}", key, existing.pid);
                jobs.remove(&key);
                REMUX_ACTIVE_JOBS.dec();
            }

            let dir = self.inner.root.join(&key);
            tokio::fs::create_dir_all(&dir).await.map_err(RemuxError::Prepare)?;
            // Stale files from a previous run would look like a ready playlist.
            clean_output_dir(&dir).await;

            let (child, ring) = self
                .inner
                .transcoder
                .spawn_remux(url, mode, &dir)
                .map_err(RemuxError::Spawn)?;

            let (state_tx, _) = watch::channel(JobState::Spawned);
            let (stop_tx, stop_rx) = watch::channel(false);
            let handle = Arc::new(JobHandle {
                id: self.inner.next_id.fetch_add(1, Ordering::AcqRel),
                key: key.clone(),
                source_url: url.to_string(),
                mode,
                pid: child.id(),
                playlist_path: playlist_path(&dir),
                output_dir: dir,
                started_at: Instant::now(),
                state: state_tx,
                stop: stop_tx,
            });

            info!(
                "Remux job started: key={} mode={} pid={:?} url={}",
                key,
                mode.as_str(),
                handle.pid,
                url
            );
            jobs.insert(key.clone(), handle.clone());
            self.inner.spawned.fetch_add(1, Ordering::AcqRel);
            REMUX_ACTIVE_JOBS.inc();
            if let Some(pid) = handle.pid {
                spawn_cpu_monitor(pid, key.clone());
            }

            tokio::spawn(supervise(
                Arc::downgrade(&self.inner),
                handle.clone(),
                child,
                ring,
                stop_rx,
            ));
            handle
        };

        match self.wait_ready(&job).await {
            Ok(path) => Ok(StartedJob {
                key,
                mode,
                playlist_path: path,
                reused: false,
            }),
            Err(e) => {
                if matches!(e, RemuxError::StartupTimeout(_)) {
                    warn!("Remux startup timed out, killing: key={} pid={:?}", job.key, job.pid);
                    let _ = job.stop.send(true);
                }
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, job: &JobHandle) -> Result<PathBuf, RemuxError> {
        let deadline = Instant::now() + self.inner.startup_timeout;
        let mut state_rx = job.state.subscribe();
        loop {
            let current = state_rx.borrow_and_update().clone();
            match current {
                JobState::Ready(path) => return Ok(path),
                JobState::Exited(code) => {
                    return Err(RemuxError::Exited(
                        code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                    ))
                }
                JobState::Spawned => {}
            }

            if mark_ready(job).await {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RemuxError::StartupTimeout(self.inner.startup_timeout));
            }
            let wait = self.inner.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, state_rx.changed()).await;
        }
    }

    /// Asks the job's ffmpeg to terminate. The registry entry goes away when
    /// the process has actually exited.
    pub async fn stop(&self, key: &str) -> Result<(), RemuxError> {
        let jobs = self.inner.jobs.lock().await;
        let job = jobs.get(key).ok_or(RemuxError::UnknownJob)?;
        info!("Remux stop requested: key={} pid={:?}", key, job.pid);
        let _ = job.stop.send(true);
        Ok(())
    }

    pub async fn shutdown(&self, grace: Duration) {
        let keys: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        for key in &keys {
            let _ = self.stop(key).await;
        }
        let deadline = Instant::now() + grace;
        while !self.inner.jobs.lock().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Remux shutdown complete: stopped={}", keys.len());
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.inner.jobs.lock().await;
        let mut out: Vec<JobInfo> = jobs
            .values()
            .map(|j| JobInfo {
                key: j.key.clone(),
                mode: j.mode,
                pid: j.pid,
                source_url: j.source_url.clone(),
                state: j.state.borrow().label().to_string(),
                uptime_secs: j.started_at.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Maps `<key>/<asset>` onto the job output tree, refusing anything that
    /// would resolve outside of the remux root.
    pub async fn resolve_asset(&self, key: &str, asset: &str) -> Result<PathBuf, RemuxError> {
        let unsafe_part = |s: &str| {
            s.is_empty() || s == "." || s.contains("..") || s.contains('/') || s.contains('\\')
        };
        if unsafe_part(key) || unsafe_part(asset) {
            return Err(RemuxError::AssetForbidden);
        }

        let root = tokio::fs::canonicalize(&self.inner.root)
            .await
            .map_err(|_| RemuxError::AssetNotFound)?;
        let candidate = tokio::fs::canonicalize(self.inner.root.join(key).join(asset))
            .await
            .map_err(|_| RemuxError::AssetNotFound)?;
        if !candidate.starts_with(&root) {
            return Err(RemuxError::AssetForbidden);
        }
        Ok(candidate)
    }
}

/// Flips a spawned job to ready once its playlist is on disk and non-empty.
/// Returns whether the job is ready.
async fn mark_ready(job: &JobHandle) -> bool {
    if !manifest_exists(&job.playlist_path).await {
        return false;
    }
    let path = job.playlist_path.clone();
    let changed = job.state.send_if_modified(|state| {
        if *state == JobState::Spawned {
            *state = JobState::Ready(path);
            true
        } else {
            false
        }
    });
    if changed {
        info!(
            "Remux playlist ready: key={} after={}ms",
            job.key,
            job.started_at.elapsed().as_millis()
        );
    }
    matches!(*job.state.borrow(), JobState::Ready(_))
}

/// Owns the child for the whole job lifetime. The job is marked exited as soon
/// as the process is gone, then its registry entry is removed unless `start`
/// already replaced it.
async fn supervise(
    inner: Weak<Inner>,
    job: Arc<JobHandle>,
    mut child: Child,
    ring: StderrRing,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut stop_requested = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx.changed() => {
            stop_requested = true;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let code = status.as_ref().ok().and_then(|s| s.code());
    job.state.send_replace(JobState::Exited(code));
    if let Some(inner) = inner.upgrade() {
        let mut jobs = inner.jobs.lock().await;
        if jobs.get(&job.key).map(|j| j.id) == Some(job.id) {
            jobs.remove(&job.key);
            REMUX_ACTIVE_JOBS.dec();
        }
    }

    match status {
        Ok(status) if stop_requested => {
            info!("Remux ffmpeg stopped (requested): key={} status={}", job.key, status);
        }
        Ok(status) if status.success() => {
            warn!("Remux ffmpeg exited unexpectedly: key={} status={}", job.key, status);
        }
        Ok(status) => {
            let tail = ring.dump().await;
            if tail.is_empty() {
                warn!("Remux ffmpeg exited with error: key={} status={} (no stderr captured)", job.key, status);
            } else {
                warn!(
                    "Remux ffmpeg exited with error: key={} status={} last_stderr_lines=\n{}",
                    job.key, status, tail
                );
            }
        }
        Err(e) => warn!("Remux ffmpeg wait() failed: key={} err={}", job.key, e),
    }
    debug!("Remux job released: key={} dir={}", job.key, job.output_dir.display());
}

pub fn asset_content_type(asset: &str) -> &'static str {
    let lower = asset.to_ascii_lowercase();
    if lower.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if lower.ends_with(".ts") {
        "video/mp2t"
    } else if lower.ends_with(".m4s") || lower.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}
