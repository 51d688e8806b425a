//! Cloud-init activation detection.
//!
//! After the seed medium is attached the host records T0 and boots the VM.
//! Stage A (the quick check) runs one probe and decides whether
//! personalization started on this boot at all. Stage B (the completion
//! poll) runs only when Stage A confirmed activation, and probes at a fixed
//! interval until personalization finishes or the ceiling is reached.

mod evidence;
mod poll;

use std::cell::RefCell;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlPlane, GuestChannel};
use crate::guest_script::{GuestScripts, ScriptError, ScriptRun};
use crate::power::{Cancelled, PowerController, pause};

pub use evidence::{
    CompletionProbe, CompletionSignal, Evidence, EvidenceLabel, classify_completion,
    classify_quick_check,
};
pub use poll::{PollState, WEAK_CEILING_MAX, WEAK_CEILING_MIN};

/// Guest file name of the quick-check probe.
pub const QUICK_CHECK_SCRIPT: &str = "clonekit-quick-check.sh";
/// Guest file name of the completion probe.
pub const COMPLETION_CHECK_SCRIPT: &str = "clonekit-completion-check.sh";

const QUICK_CHECK_TEMPLATE: &str = include_str!("../scripts/quick-check.sh");
const COMPLETION_CHECK_TEMPLATE: &str = include_str!("../scripts/completion-check.sh");
const T0_PLACEHOLDER: &str = "{{t0}}";
const QUICK_CHECK_ATTEMPTS: u32 = 2;

/// Renders the quick-check probe for `t0`.
#[must_use]
pub fn quick_check_script(t0: u64) -> String {
    QUICK_CHECK_TEMPLATE.replace(T0_PLACEHOLDER, &t0.to_string())
}

/// Renders the completion probe for `t0`.
#[must_use]
pub fn completion_check_script(t0: u64) -> String {
    COMPLETION_CHECK_TEMPLATE.replace(T0_PLACEHOLDER, &t0.to_string())
}

/// How the completion poll ended without error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Personalization finished.
    Ready(CompletionSignal),
    /// The ceiling was reached first.
    TimedOut {
        /// Time spent polling.
        waited: Duration,
    },
}

/// Full detection result for one boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DetectionReport {
    /// Quick-check evidence.
    pub evidence: Evidence,
    /// Final completion poll state.
    pub poll: PollState,
    /// How the completion poll ended.
    pub completion: Completion,
}

impl DetectionReport {
    /// Whether personalization is confirmed finished.
    #[must_use]
    pub const fn completed(&self) -> bool {
        matches!(self.completion, Completion::Ready(_))
    }
}

/// Fatal detection outcomes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DetectError {
    /// The permanent-disable marker is present; personalization will never
    /// run.
    #[error("personalization is permanently disabled on the guest ({path})")]
    Disabled {
        /// Marker path.
        path: String,
    },
    /// No evidence newer than T0 was found.
    #[error("no personalization activity after T0={t0}; the seed was not consumed on this boot")]
    NotRan {
        /// Reference instant in epoch seconds.
        t0: u64,
    },
    /// The disable marker appeared while waiting for completion.
    #[error("personalization was disabled while waiting for completion")]
    DisabledDuringPoll,
    /// The command channel never became available for the quick check.
    #[error("guest command channel unavailable after {waited:?}")]
    ChannelUnavailable {
        /// Time spent waiting.
        waited: Duration,
    },
    /// The quick-check probe could not be delivered.
    #[error(transparent)]
    Probe(#[from] ScriptError),
    /// The quick-check probe ran but failed.
    #[error("quick-check probe exited with status {status_text}: {stderr}")]
    ProbeFailed {
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Cancellation was requested.
    #[error("detection cancelled")]
    Cancelled,
}

impl From<Cancelled> for DetectError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Runs the two-stage detection protocol for one VM.
#[derive(Debug)]
pub struct ActivationDetector<'a, C: ?Sized, G: ?Sized> {
    power: &'a PowerController<'a, C, G>,
    scripts: &'a GuestScripts<'a, G>,
    vm: &'a str,
    cancel: &'a CancellationToken,
    cleanup_warnings: RefCell<Vec<String>>,
}

impl<'a, C, G> ActivationDetector<'a, C, G>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
{
    /// Creates a detector for `vm`.
    #[must_use]
    pub const fn new(
        power: &'a PowerController<'a, C, G>,
        scripts: &'a GuestScripts<'a, G>,
        vm: &'a str,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            power,
            scripts,
            vm,
            cancel,
            cleanup_warnings: RefCell::new(Vec::new()),
        }
    }

    /// Drains warnings about probe scripts left behind in the guest.
    #[must_use]
    pub fn take_cleanup_warnings(&self) -> Vec<String> {
        self.cleanup_warnings.take()
    }

    fn note_cleanup(&self, run: &ScriptRun) {
        if let Some(message) = &run.cleanup_warning {
            self.cleanup_warnings.borrow_mut().push(message.clone());
        }
    }

    async fn channel_ready(&self) -> Result<bool, Cancelled> {
        let timings = self.power.timings();
        self.power
            .wait_channel_ready(
                self.vm,
                timings.channel_probe_timeout,
                timings.channel_poll_interval,
            )
            .await
    }

    /// Stage A: one probe, first match in strength order.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::Disabled`] or [`DetectError::NotRan`] for the
    /// aborting labels and other variants when the probe cannot run.
    pub async fn quick_check(&self, t0: u64) -> Result<Evidence, DetectError> {
        let script = quick_check_script(t0);
        let mut attempt = 0;
        let run = loop {
            attempt += 1;
            if !self.channel_ready().await? {
                return Err(DetectError::ChannelUnavailable {
                    waited: self.power.timings().channel_probe_timeout,
                });
            }
            match self.scripts.execute(QUICK_CHECK_SCRIPT, &script) {
                Ok(run) => break run,
                Err(err) if attempt < QUICK_CHECK_ATTEMPTS => {
                    warn!(vm = self.vm, error = %err, "quick-check delivery failed; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.note_cleanup(&run);
        if !run.output.is_success() {
            return Err(DetectError::ProbeFailed {
                status_text: run.output.status_text(),
                stderr: run.output.stderr.trim().to_owned(),
            });
        }
        let evidence = classify_quick_check(&run.output.stdout, t0);
        match evidence.label {
            EvidenceLabel::Disabled => Err(DetectError::Disabled {
                path: evidence.path.unwrap_or_default(),
            }),
            EvidenceLabel::NotRan => Err(DetectError::NotRan { t0 }),
            label => {
                info!(
                    vm = self.vm,
                    label = %label,
                    path = evidence.path.as_deref().unwrap_or_default(),
                    instance_id = evidence.instance_id.as_deref().unwrap_or_default(),
                    "personalization activity confirmed"
                );
                Ok(evidence)
            }
        }
    }

    /// Stage B: bounded completion loop.
    ///
    /// Channel loss and probe delivery failures count as not-ready ticks.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::DisabledDuringPoll`] when the disable marker
    /// appears and [`DetectError::Cancelled`] when the token fires.
    pub async fn poll_completion(
        &self,
        t0: u64,
        label: EvidenceLabel,
    ) -> Result<(Completion, PollState), DetectError> {
        let mut state = PollState::for_evidence(label, self.power.timings());
        let script = completion_check_script(t0);
        let started = Instant::now();
        info!(
            vm = self.vm,
            ceiling_secs = state.ceiling.as_secs(),
            interval_secs = state.interval.as_secs(),
            "waiting for personalization to finish"
        );
        loop {
            if self.cancel.is_cancelled() {
                return Err(DetectError::Cancelled);
            }
            if self.channel_ready().await? {
                match self.probe_completion(&script, t0) {
                    CompletionProbe::Disabled => return Err(DetectError::DisabledDuringPoll),
                    CompletionProbe::Ready(signal) => {
                        state.record(started.elapsed());
                        info!(vm = self.vm, signal = %signal, "personalization finished");
                        return Ok((Completion::Ready(signal), state));
                    }
                    CompletionProbe::NotReady => {}
                }
            } else {
                debug!(vm = self.vm, "channel unavailable for completion probe");
            }
            state.record(started.elapsed());
            if state.exhausted() {
                return Ok((
                    Completion::TimedOut {
                        waited: state.elapsed,
                    },
                    state,
                ));
            }
            pause(state.next_pause(), self.cancel).await?;
        }
    }

    fn probe_completion(&self, script: &str, t0: u64) -> CompletionProbe {
        match self.scripts.execute(COMPLETION_CHECK_SCRIPT, script) {
            Ok(run) => {
                self.note_cleanup(&run);
                if run.output.is_success() {
                    classify_completion(&run.output.stdout, t0)
                } else {
                    debug!(vm = self.vm, status = %run.output.status_text(), "completion probe failed");
                    CompletionProbe::NotReady
                }
            }
            Err(err) => {
                debug!(vm = self.vm, error = %err, "completion probe not delivered");
                CompletionProbe::NotReady
            }
        }
    }

    /// Runs both stages.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::quick_check`] and
    /// [`Self::poll_completion`].
    pub async fn detect(&self, t0: u64) -> Result<DetectionReport, DetectError> {
        let evidence = self.quick_check(t0).await?;
        let (completion, poll) = self.poll_completion(t0, evidence.label).await?;
        Ok(DetectionReport {
            evidence,
            poll,
            completion,
        })
    }
}

#[cfg(test)]
mod tests;
