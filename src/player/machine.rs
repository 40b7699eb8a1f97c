use tokio::time::Instant;

use super::backend::{ErrorCategory, LivenessSample};
use super::{EarlyFallbackConfig, ProbeBudget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Fatal(ErrorCategory),
    EarlyFallback,
    PlaybackRejected,
    ProbeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Starting,
    AwaitingFormatReady,
    Probing,
    Settled(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptEvent {
    Loaded,
    FormatReady,
    FatalError(ErrorCategory),
    NonFatalError(ErrorCategory),
    PlaybackRejected,
    ProbeTick(LivenessSample),
    ProbeTimeout,
}

/// What the driver has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Start sink playback and arm the liveness probe.
    StartPlayback,
    Live,
    Fallback(FailureReason),
}

/// Per-attempt state machine. Pure: the caller supplies the clock, so the
/// early-fallback and probe rules can be exercised without a backend.
/// Once settled, every further event is ignored.
#[derive(Debug, Clone)]
pub struct AttemptMachine {
    state: AttemptState,
    budget: ProbeBudget,
    early: Option<EarlyFallbackConfig>,
    loaded_at: Option<Instant>,
    probe_armed_at: Option<Instant>,
    tallied: u32,
}

impl AttemptMachine {
    pub fn new(budget: ProbeBudget, early: Option<EarlyFallbackConfig>) -> Self {
        Self {
            state: AttemptState::Starting,
            budget,
            early,
            loaded_at: None,
            probe_armed_at: None,
            tallied: 0,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, AttemptState::Settled(_))
    }

    pub fn tallied_errors(&self) -> u32 {
        self.tallied
    }

    /// When the probe gives up, if it has been armed.
    pub fn probe_deadline(&self) -> Option<Instant> {
        self.probe_armed_at.map(|at| at + self.budget.timeout())
    }

    pub fn handle(&mut self, event: AttemptEvent, now: Instant) -> Action {
        if self.is_settled() {
            return Action::None;
        }

        match event {
            AttemptEvent::Loaded => {
                if self.state == AttemptState::Starting {
                    self.state = AttemptState::AwaitingFormatReady;
                    self.loaded_at = Some(now);
                }
                Action::None
            }
            AttemptEvent::FormatReady => {
                if self.state != AttemptState::AwaitingFormatReady {
                    return Action::None;
                }
                self.state = AttemptState::Probing;
                self.probe_armed_at = Some(now);
                Action::StartPlayback
            }
            AttemptEvent::FatalError(category) => self.fail(FailureReason::Fatal(category)),
            AttemptEvent::PlaybackRejected => self.fail(FailureReason::PlaybackRejected),
            AttemptEvent::NonFatalError(category) => {
                let counts = self
                    .early
                    .as_ref()
                    .is_some_and(|cfg| cfg.categories.contains(&category));
                if counts {
                    self.tallied += 1;
                }
                self.check_early_fallback(now)
            }
            AttemptEvent::ProbeTick(sample) => {
                if self.state != AttemptState::Probing {
                    return Action::None;
                }
                if sample.is_alive() {
                    self.state = AttemptState::Settled(Outcome::Success);
                    return Action::Live;
                }
                self.check_early_fallback(now)
            }
            AttemptEvent::ProbeTimeout => {
                if self.state != AttemptState::Probing {
                    return Action::None;
                }
                self.fail(FailureReason::ProbeTimeout)
            }
        }
    }

    fn check_early_fallback(&mut self, now: Instant) -> Action {
        let Some(cfg) = &self.early else {
            return Action::None;
        };
        if self.tallied == 0 {
            return Action::None;
        }
        let over_budget = self
            .loaded_at
            .is_some_and(|at| now.duration_since(at).as_millis() as u64 >= cfg.budget_ms);
        if self.tallied >= cfg.max_errors || over_budget {
            return self.fail(FailureReason::EarlyFallback);
        }
        Action::None
    }

    fn fail(&mut self, reason: FailureReason) -> Action {
        self.state = AttemptState::Settled(Outcome::Failed(reason));
        Action::Fallback(reason)
    }
}
