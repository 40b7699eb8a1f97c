use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::catalog::StreamFormat;

/// Coarse classification of decode-engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Parsing,
    BufferAppend,
    Codec,
    Media,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Manifest parsed / media attached; playback may start.
    FormatReady,
    Error { fatal: bool, category: ErrorCategory },
}

pub type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// What the sink reports about real decoding progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LivenessSample {
    pub current_time: f64,
    pub paused: bool,
    pub ready_state: u8,
    pub decoded_video_frames: u64,
    pub decoded_audio_bytes: u64,
}

impl LivenessSample {
    pub fn is_alive(&self) -> bool {
        let progressed = self.current_time > 1.0 || (!self.paused && self.ready_state >= 3);
        self.decoded_video_frames > 0 || progressed || self.decoded_audio_bytes > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("playback start was rejected by the sink")]
pub struct PlaybackRejected;

/// One decode engine instance bound to the sink. Dropping it without
/// `destroy` is allowed but leaves engine-side cleanup to `Drop`.
pub trait DecodeBackend: Send {
    fn load(&mut self, url: &str);
    fn destroy(&mut self);
}

pub trait BackendFactory: Send + Sync {
    fn supports(&self, kind: StreamFormat) -> bool;
    fn create(&self, kind: StreamFormat, events: EventSender) -> Box<dyn DecodeBackend>;
}

/// The output surface shared by every attempt.
pub trait VideoSink: Send {
    /// Pause, detach the current source and reload to an empty state.
    fn reset(&mut self);
    /// Hand a URL to the sink itself when no backend can take it. The sink
    /// reports `FormatReady` once it can play and a fatal error on failure.
    fn load_source(&mut self, url: &str, events: EventSender);
    fn play(&mut self) -> Result<(), PlaybackRejected>;
    fn liveness(&self) -> LivenessSample;
}
