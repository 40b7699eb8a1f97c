use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::attempt::{attempt_sequence, settle_delay, DeliveryAttempt};
use super::backend::{BackendEvent, BackendFactory, DecodeBackend, ErrorCategory, VideoSink};
use super::machine::{Action, AttemptEvent, AttemptMachine, AttemptState, FailureReason};
use super::token::{PlayToken, PlayTokens};
use super::urls::DeliveryUrls;
use super::PlayerConfig;
use crate::catalog::{ChannelRef, StreamFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Idle,
    Connecting,
    Live,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub now_playing: Option<String>,
    pub phase: PlaybackPhase,
    pub message: String,
    pub buffering: bool,
    pub attempt: Option<usize>,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            now_playing: None,
            phase: PlaybackPhase::Idle,
            message: String::new(),
            buffering: false,
            attempt: None,
        }
    }
}

struct Session {
    sink: Box<dyn VideoSink>,
    backend: Option<Box<dyn DecodeBackend>>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.destroy();
        }
        self.sink.reset();
    }
}

struct Shared {
    config: PlayerConfig,
    urls: DeliveryUrls,
    factory: Arc<dyn BackendFactory>,
    tokens: PlayTokens,
    // Token checks and every observable mutation happen under this lock.
    session: Mutex<Session>,
    status: watch::Sender<PlaybackStatus>,
}

impl Shared {
    async fn publish(&self, token: PlayToken, update: impl FnOnce(&mut PlaybackStatus)) -> bool {
        let _session = self.session.lock().await;
        if !self.tokens.is_current(token) {
            return false;
        }
        self.status.send_modify(update);
        true
    }
}

enum AttemptEnd {
    Live,
    Failed(FailureReason),
    Cancelled,
}

enum Wake {
    Backend(AttemptEvent),
    Probe,
}

/// Plays one channel at a time. `play` may be called at any rate; the latest
/// call wins and all work started by earlier calls becomes inert.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        config: PlayerConfig,
        urls: DeliveryUrls,
        factory: Arc<dyn BackendFactory>,
        sink: Box<dyn VideoSink>,
    ) -> Self {
        let (status, _) = watch::channel(PlaybackStatus::default());
        Self {
            shared: Arc::new(Shared {
                config,
                urls,
                factory,
                tokens: PlayTokens::default(),
                session: Mutex::new(Session {
                    sink,
                    backend: None,
                    driver: None,
                }),
                status,
            }),
        }
    }

    pub fn status(&self) -> watch::Receiver<PlaybackStatus> {
        self.shared.status.subscribe()
    }

    pub fn now_playing(&self) -> Option<String> {
        self.shared.status.borrow().now_playing.clone()
    }

    pub fn current_token(&self) -> PlayToken {
        self.shared.tokens.current()
    }

    /// The attempt plan `play` would use for this channel.
    pub fn plan(&self, channel: &ChannelRef, format_hint: Option<StreamFormat>) -> Vec<DeliveryAttempt> {
        attempt_sequence(
            format_hint.unwrap_or(channel.preferred_format),
            self.shared.config.use_proxy,
        )
    }

    /// Starts playing `channel` and returns without waiting for the outcome.
    pub async fn play(&self, channel: ChannelRef, format_hint: Option<StreamFormat>) -> PlayToken {
        let attempts = self.plan(&channel, format_hint);

        let mut session = self.shared.session.lock().await;
        let token = self.shared.tokens.issue();
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        session.release();

        info!(
            "Play requested: channel={} name={:?} attempts={} generation={}",
            channel.id,
            channel.display_name,
            attempts.len(),
            token.generation()
        );
        self.shared.status.send_replace(PlaybackStatus {
            now_playing: Some(channel.id.clone()),
            phase: PlaybackPhase::Connecting,
            message: String::new(),
            buffering: true,
            attempt: None,
        });

        session.driver = Some(tokio::spawn(drive(self.shared.clone(), token, channel, attempts)));
        token
    }

    pub async fn stop(&self) {
        let mut session = self.shared.session.lock().await;
        let token = self.shared.tokens.issue();
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        session.release();
        self.shared.status.send_replace(PlaybackStatus::default());
        debug!("Playback stopped: generation={}", token.generation());
    }
}

async fn drive(shared: Arc<Shared>, token: PlayToken, channel: ChannelRef, attempts: Vec<DeliveryAttempt>) {
    let mut index = 0;
    loop {
        let Some(attempt) = attempts.get(index) else {
            let _ = shared
                .publish(token, |s| {
                    s.phase = PlaybackPhase::Failed;
                    s.message = "Cannot play this stream".to_string();
                    s.buffering = false;
                })
                .await;
            return;
        };

        match run_attempt(&shared, token, &channel, &attempts, index).await {
            AttemptEnd::Live | AttemptEnd::Cancelled => return,
            AttemptEnd::Failed(reason) => {
                let label = attempt.label();
                if index + 1 < attempts.len() {
                    warn!(
                        "Player fallback: channel={} mode={} reason={:?} next={}",
                        channel.id,
                        label,
                        reason,
                        index + 1
                    );
                    let current = shared
                        .publish(token, |s| {
                            s.phase = PlaybackPhase::Retrying;
                            s.message = format!("{label} failed — retrying…");
                        })
                        .await;
                    if !current {
                        return;
                    }
                    sleep(shared.config.fallback_pause()).await;
                    index += 1;
                } else {
                    warn!(
                        "Player exhausted all attempts: channel={} last_mode={} reason={:?}",
                        channel.id, label, reason
                    );
                    let mut session = shared.session.lock().await;
                    if shared.tokens.is_current(token) {
                        session.release();
                        shared.status.send_modify(|s| {
                            s.phase = PlaybackPhase::Failed;
                            s.message = "Cannot play this stream".to_string();
                            s.buffering = false;
                        });
                    }
                    return;
                }
            }
        }
    }
}

async fn run_attempt(
    shared: &Shared,
    token: PlayToken,
    channel: &ChannelRef,
    attempts: &[DeliveryAttempt],
    index: usize,
) -> AttemptEnd {
    let attempt = attempts[index];
    let label = attempt.label();

    {
        let mut session = shared.session.lock().await;
        if !shared.tokens.is_current(token) {
            return AttemptEnd::Cancelled;
        }
        // Unconditional, attempt 0 included.
        session.release();
    }

    sleep(settle_delay(&shared.config, attempts, index)).await;

    let budget = shared.config.probe_budget(&attempt);
    let mut machine = AttemptMachine::new(budget, shared.config.early_fallback_for(&attempt));
    let url = shared.urls.for_attempt(channel, &attempt);
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let mut session = shared.session.lock().await;
        if !shared.tokens.is_current(token) {
            return AttemptEnd::Cancelled;
        }
        info!("Player attempt: index={} mode={} url={}", index, label, url);
        shared.status.send_modify(|s| {
            s.phase = PlaybackPhase::Connecting;
            s.message = format!("Connecting… {label}");
            s.buffering = true;
            s.attempt = Some(index);
        });

        if shared.factory.supports(attempt.play_as) {
            let mut backend = shared.factory.create(attempt.play_as, tx);
            backend.load(&url);
            session.backend = Some(backend);
        } else {
            debug!("No decode backend for {:?}, handing URL to the sink", attempt.play_as);
            session.sink.load_source(&url, tx);
        }
        machine.handle(AttemptEvent::Loaded, Instant::now());
    }

    let mut next_probe: Option<Instant> = None;
    let mut events_open = true;
    loop {
        let wake = tokio::select! {
            event = rx.recv(), if events_open => match event {
                Some(BackendEvent::FormatReady) => Wake::Backend(AttemptEvent::FormatReady),
                Some(BackendEvent::Error { fatal: true, category }) => {
                    Wake::Backend(AttemptEvent::FatalError(category))
                }
                Some(BackendEvent::Error { fatal: false, category }) => {
                    Wake::Backend(AttemptEvent::NonFatalError(category))
                }
                None => {
                    events_open = false;
                    continue;
                }
            },
            _ = sleep_until(next_probe.unwrap_or_else(Instant::now)), if next_probe.is_some() => {
                next_probe = None;
                Wake::Probe
            }
            else => {
                // The backend dropped its event channel without settling.
                Wake::Backend(AttemptEvent::FatalError(ErrorCategory::Other))
            }
        };

        let mut session = shared.session.lock().await;
        if !shared.tokens.is_current(token) {
            return AttemptEnd::Cancelled;
        }
        let now = Instant::now();

        let probed = matches!(wake, Wake::Probe);
        let mut action = match wake {
            Wake::Backend(event) => {
                if let AttemptEvent::NonFatalError(category) = &event {
                    debug!("Backend non-fatal error: mode={} category={:?}", label, category);
                }
                machine.handle(event, now)
            }
            Wake::Probe => {
                let sample = session.sink.liveness();
                match machine.handle(AttemptEvent::ProbeTick(sample), now) {
                    Action::None if machine.probe_deadline().is_some_and(|d| now >= d) => {
                        machine.handle(AttemptEvent::ProbeTimeout, now)
                    }
                    other => other,
                }
            }
        };

        if action == Action::StartPlayback {
            action = match session.sink.play() {
                Ok(()) => {
                    shared.status.send_modify(|s| {
                        s.phase = PlaybackPhase::Live;
                        s.message = format!("▶ Live ({label})");
                    });
                    next_probe = Some(now + budget.initial_delay());
                    Action::None
                }
                Err(_) => machine.handle(AttemptEvent::PlaybackRejected, now),
            };
        }

        match action {
            Action::None | Action::StartPlayback => {
                if probed && machine.state() == AttemptState::Probing {
                    next_probe = Some(now + shared.config.probe_interval());
                }
            }
            Action::Live => {
                info!("Player live: channel={} mode={}", channel.id, label);
                shared.status.send_modify(|s| s.buffering = false);
                return AttemptEnd::Live;
            }
            Action::Fallback(reason) => return AttemptEnd::Failed(reason),
        }
    }
}
