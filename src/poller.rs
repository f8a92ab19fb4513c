//! Generic phase poller.
//!
//! One [`StatePoller`] type drives every wait in the engine: VM readiness,
//! volume resize, snapshot readiness and clone progress all differ only in
//! their [`PhaseVocabulary`].
//!
//! The capacity-exhaustion heuristic lives here: when a target sits in the
//! vocabulary's exhaustion phase for `exhaustion_timeout`, the poll ends
//! classified [`PollClassification::CapacityExhausted`]. The sub-timer starts
//! the first time the phase is sampled and restarts whenever any other phase
//! is seen in between.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::FailureReason;
use crate::controller::Phase;
use crate::error::Result;
use crate::retry::{RetryClassify, RetryPolicy};
use crate::target::Target;
use crate::telemetry::SharedObserver;

/// How a sampled phase is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseClass {
    Terminal,
    Failure,
    Exhaustion,
    ImmediateExhaustion,
    Pending,
}

/// The phase names that end a poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseVocabulary {
    terminal: HashSet<Phase>,
    failure: HashSet<Phase>,
    exhaustion: Option<Phase>,
    immediate_exhaustion: HashSet<Phase>,
}

impl PhaseVocabulary {
    pub fn new(terminal: HashSet<Phase>) -> Self {
        Self {
            terminal,
            ..Default::default()
        }
    }

    pub fn with_failure(mut self, failure: HashSet<Phase>) -> Self {
        self.failure = failure;
        self
    }

    /// The phase whose persistence means a scarce resource ran out.
    pub fn with_exhaustion(mut self, phase: Phase) -> Self {
        self.exhaustion = Some(phase);
        self
    }

    /// Phases that mean exhaustion as soon as they are seen.
    pub fn with_immediate_exhaustion(mut self, phases: HashSet<Phase>) -> Self {
        self.immediate_exhaustion = phases;
        self
    }

    pub fn classify(&self, phase: &Phase) -> PhaseClass {
        if self.terminal.contains(phase) {
            PhaseClass::Terminal
        } else if self.failure.contains(phase) {
            PhaseClass::Failure
        } else if self.immediate_exhaustion.contains(phase) {
            PhaseClass::ImmediateExhaustion
        } else if self.exhaustion.as_ref() == Some(phase) {
            PhaseClass::Exhaustion
        } else {
            PhaseClass::Pending
        }
    }

    pub fn exhaustion(&self) -> Option<&Phase> {
        self.exhaustion.as_ref()
    }
}

/// Timing knobs for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub global_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub exhaustion_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            global_timeout: Duration::from_secs(1800),
            exhaustion_timeout: Duration::from_secs(120),
        }
    }
}

/// Result classification of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollClassification {
    Success,
    Error,
    CapacityExhausted,
    Timeout,
    Interrupted,
}

impl PollClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollClassification::Success => "success",
            PollClassification::Error => "error",
            PollClassification::CapacityExhausted => "capacityExhausted",
            PollClassification::Timeout => "timeout",
            PollClassification::Interrupted => "interrupted",
        }
    }

    /// The outcome failure reason for this classification.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            PollClassification::Success => None,
            PollClassification::Error => Some(FailureReason::Error),
            PollClassification::CapacityExhausted => Some(FailureReason::CapacityExhausted),
            PollClassification::Timeout => Some(FailureReason::Timeout),
            PollClassification::Interrupted => Some(FailureReason::Interrupted),
        }
    }
}

/// What a poll ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    /// Last phase sampled, if any sample succeeded
    pub final_phase: Option<Phase>,
    /// Time from the poll's start to the deciding sample
    pub elapsed: Duration,
    pub classification: PollClassification,
    /// Error text for oracle failures
    pub message: Option<String>,
}

impl PollResult {
    pub fn is_success(&self) -> bool {
        self.classification == PollClassification::Success
    }
}

/// Per-target poll bookkeeping, owned by exactly one poll.
///
/// `phase_entered_at` moves only when the phase changes.
#[derive(Debug, Clone)]
pub struct PollState {
    current_phase: Option<Phase>,
    phase_entered_at: Instant,
    started_at: Instant,
}

impl PollState {
    pub fn new(started_at: Instant) -> Self {
        Self {
            current_phase: None,
            phase_entered_at: started_at,
            started_at,
        }
    }

    /// Record a sample. Returns true when the phase changed.
    pub fn observe(&mut self, phase: &Phase, now: Instant) -> bool {
        if self.current_phase.as_ref() == Some(phase) {
            return false;
        }
        self.current_phase = Some(phase.clone());
        self.phase_entered_at = now.max(self.phase_entered_at);
        true
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.current_phase.as_ref()
    }

    pub fn phase_entered_at(&self) -> Instant {
        self.phase_entered_at
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn time_in_phase(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.phase_entered_at)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Drives one target through a phase vocabulary.
#[derive(Clone)]
pub struct StatePoller {
    vocabulary: PhaseVocabulary,
    settings: PollSettings,
    retry: RetryPolicy,
    observer: SharedObserver,
    cancel: CancellationToken,
}

impl StatePoller {
    pub fn new(
        vocabulary: PhaseVocabulary,
        settings: PollSettings,
        observer: SharedObserver,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            vocabulary,
            settings,
            retry: RetryPolicy::default(),
            observer,
            cancel,
        }
    }

    /// Patterns deciding which oracle errors keep the poll going.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn vocabulary(&self) -> &PhaseVocabulary {
        &self.vocabulary
    }

    /// Poll from now.
    pub async fn await_phase<F, Fut>(&self, target: &Target, oracle: F) -> PollResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Phase>>,
    {
        self.await_observed(target, Instant::now(), oracle, |_, _| {})
            .await
    }

    /// Poll with elapsed time measured from `started_at` (e.g. creation time).
    pub async fn await_phase_since<F, Fut>(
        &self,
        target: &Target,
        started_at: Instant,
        oracle: F,
    ) -> PollResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Phase>>,
    {
        self.await_observed(target, started_at, oracle, |_, _| {})
            .await
    }

    /// Poll and hand every successful sample to `on_sample`.
    pub async fn await_observed<F, Fut, S>(
        &self,
        target: &Target,
        started_at: Instant,
        mut oracle: F,
        mut on_sample: S,
    ) -> PollResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Phase>>,
        S: FnMut(&Phase, Instant),
    {
        let mut state = PollState::new(started_at);

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(target, &state, Instant::now(), PollClassification::Interrupted, None);
            }

            let sample = oracle().await;
            let now = Instant::now();

            match sample {
                Ok(phase) => {
                    on_sample(&phase, now);
                    let previous = state.current_phase().cloned();
                    if state.observe(&phase, now) {
                        self.observer.on_phase_change(
                            target,
                            previous.as_ref(),
                            &phase,
                            state.elapsed(now),
                        );
                    }

                    let decided = match self.vocabulary.classify(&phase) {
                        PhaseClass::Terminal => Some(PollClassification::Success),
                        PhaseClass::Failure => Some(PollClassification::Error),
                        PhaseClass::ImmediateExhaustion => Some(PollClassification::CapacityExhausted),
                        PhaseClass::Exhaustion
                            if state.time_in_phase(now) >= self.settings.exhaustion_timeout =>
                        {
                            Some(PollClassification::CapacityExhausted)
                        }
                        PhaseClass::Exhaustion | PhaseClass::Pending => None,
                    };
                    if let Some(classification) = decided {
                        return self.finish(target, &state, now, classification, None);
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let fatal = !e.is_retryable(&self.retry);
                    self.observer.on_poll_error(target, &message, fatal);
                    if fatal {
                        return self.finish(target, &state, now, PollClassification::Error, Some(message));
                    }
                }
            }

            let elapsed = state.elapsed(now);
            if elapsed >= self.settings.global_timeout {
                return self.finish(target, &state, now, PollClassification::Timeout, None);
            }

            let wait = self
                .settings
                .poll_interval
                .min(self.settings.global_timeout - elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.finish(target, &state, Instant::now(), PollClassification::Interrupted, None);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn finish(
        &self,
        target: &Target,
        state: &PollState,
        now: Instant,
        classification: PollClassification,
        message: Option<String>,
    ) -> PollResult {
        let result = PollResult {
            final_phase: state.current_phase().cloned(),
            elapsed: state.elapsed(now),
            classification,
            message,
        };
        self.observer.on_poll_finished(target, &result);
        result
    }
}
