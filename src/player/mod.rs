//! Client-side attempt orchestration: picks delivery strategies for a
//! channel, drives one decode backend at a time and falls back on failure.

mod attempt;
mod backend;
mod machine;
mod orchestrator;
mod token;
mod urls;

use std::time::Duration;

use serde::Deserialize;

pub use attempt::{attempt_sequence, settle_delay, DeliveryAttempt};
pub use backend::{
    BackendEvent, BackendFactory, DecodeBackend, ErrorCategory, EventSender, LivenessSample,
    PlaybackRejected, VideoSink,
};
pub use machine::{Action, AttemptEvent, AttemptMachine, AttemptState, FailureReason, Outcome};
pub use orchestrator::{Orchestrator, PlaybackPhase, PlaybackStatus};
pub use token::{PlayToken, PlayTokens};
pub use urls::DeliveryUrls;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct ProbeBudget {
    pub initial_delay_ms: u64,
    pub timeout_ms: u64,
}

impl ProbeBudget {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Thresholds for failing the unproxied segmented attempt on accumulated
/// non-fatal errors. Provider-specific; tune rather than rely on them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EarlyFallbackConfig {
    pub enabled: bool,
    pub categories: Vec<ErrorCategory>,
    pub max_errors: u32,
    pub budget_ms: u64,
}

impl Default for EarlyFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            categories: vec![
                ErrorCategory::Parsing,
                ErrorCategory::BufferAppend,
                ErrorCategory::Codec,
            ],
            max_errors: 3,
            budget_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// When false, proxied and transcoded attempts are never tried.
    pub use_proxy: bool,
    /// Base URL of the delivery server used for proxy/transcode attempts.
    pub backend_base: String,
    pub first_settle_ms: u64,
    pub settle_ms: u64,
    pub proxy_switch_settle_ms: u64,
    pub fallback_pause_ms: u64,
    pub probe_interval_ms: u64,
    pub direct_probe: ProbeBudget,
    pub proxy_probe: ProbeBudget,
    pub transcode_probe: ProbeBudget,
    pub early_fallback: EarlyFallbackConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            use_proxy: true,
            backend_base: String::new(),
            first_settle_ms: 150,
            settle_ms: 300,
            proxy_switch_settle_ms: 1800,
            fallback_pause_ms: 200,
            probe_interval_ms: 800,
            direct_probe: ProbeBudget { initial_delay_ms: 2500, timeout_ms: 4000 },
            proxy_probe: ProbeBudget { initial_delay_ms: 3000, timeout_ms: 7000 },
            transcode_probe: ProbeBudget { initial_delay_ms: 5000, timeout_ms: 20000 },
            early_fallback: EarlyFallbackConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn probe_budget(&self, attempt: &DeliveryAttempt) -> ProbeBudget {
        if attempt.via_transcode {
            self.transcode_probe
        } else if attempt.via_proxy {
            self.proxy_probe
        } else {
            self.direct_probe
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn fallback_pause(&self) -> Duration {
        Duration::from_millis(self.fallback_pause_ms)
    }

    /// Early fallback only applies to direct segmented delivery.
    pub fn early_fallback_for(&self, attempt: &DeliveryAttempt) -> Option<EarlyFallbackConfig> {
        let direct_segmented = !attempt.via_proxy
            && !attempt.via_transcode
            && attempt.play_as == crate::catalog::StreamFormat::Segmented;
        (self.early_fallback.enabled && direct_segmented).then(|| self.early_fallback.clone())
    }
}
