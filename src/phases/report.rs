//! Deployment report and the non-fatal warning channel.

use std::fmt;

use tracing::warn;

use crate::detect::DetectionReport;

use super::Phase;

/// Category of a degraded outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WarningKind {
    /// Quick check found only weak evidence; the completion wait was shortened.
    WeakEvidence,
    /// Completion was not confirmed before the ceiling.
    CompletionTimeout,
    /// A best-effort cleanup step failed.
    Cleanup,
    /// The disabled marker could not be checked before the seed was attached.
    MarkerUnchecked,
    /// No-power-change mode prevented a required power transition.
    PowerModeBlocked,
    /// The irreversible Finalize step was not attempted.
    IrreversibleStepBlocked,
    /// Finalize was refused because personalization never had a qualifying
    /// boot in this run.
    FinalizeRefused,
}

impl WarningKind {
    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WeakEvidence => "weak-evidence",
            Self::CompletionTimeout => "completion-timeout",
            Self::Cleanup => "cleanup",
            Self::MarkerUnchecked => "marker-unchecked",
            Self::PowerModeBlocked => "power-mode-blocked",
            Self::IrreversibleStepBlocked => "irreversible-step-blocked",
            Self::FinalizeRefused => "finalize-refused",
        }
    }

    /// Whether the warning stops a later step from running.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::CompletionTimeout
                | Self::PowerModeBlocked
                | Self::IrreversibleStepBlocked
                | Self::FinalizeRefused
        )
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One degraded outcome.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Warning {
    /// Phase that raised it.
    pub phase: Phase,
    /// Category.
    pub kind: WarningKind,
    /// Operator-facing explanation.
    pub message: String,
}

/// Ordered warnings collected across a run. Every entry is logged when
/// pushed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Warnings {
    entries: Vec<Warning>,
}

impl Warnings {
    /// Records and logs a warning.
    pub fn push(&mut self, phase: Phase, kind: WarningKind, message: impl Into<String>) {
        let text = message.into();
        warn!(phase = %phase, kind = %kind, "{text}");
        self.entries.push(Warning {
            phase,
            kind,
            message: text,
        });
    }

    /// All warnings in the order they were raised.
    #[must_use]
    pub fn entries(&self) -> &[Warning] {
        &self.entries
    }

    /// Whether a warning of `kind` was raised.
    #[must_use]
    pub fn contains(&self, kind: WarningKind) -> bool {
        self.entries.iter().any(|entry| entry.kind == kind)
    }

    /// Whether no warnings were raised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What SeedAndPersonalize established in this run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Personalization {
    /// Detection confirmed completion.
    Completed,
    /// Activation was confirmed but completion was not.
    Unconfirmed,
    /// A required power transition was forbidden; detection never ran.
    PowerBlocked,
}

/// Summary of one executed phase.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseReport {
    /// The phase.
    pub phase: Phase,
    /// One-line outcome.
    pub summary: String,
}

/// Outcome of a whole invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentReport {
    /// Target VM name.
    pub vm: String,
    /// Executed phases in order.
    pub phases: Vec<PhaseReport>,
    /// Degraded outcomes.
    pub warnings: Warnings,
    /// Detection result when SeedAndPersonalize ran detection.
    pub detection: Option<DetectionReport>,
    /// In-run personalization verdict handed to Finalize.
    pub personalization: Option<Personalization>,
}

impl DeploymentReport {
    /// Creates an empty report for `vm`.
    #[must_use]
    pub fn new(vm: &str) -> Self {
        Self {
            vm: vm.to_owned(),
            phases: Vec::new(),
            warnings: Warnings::default(),
            detection: None,
            personalization: None,
        }
    }

    pub(super) fn record(&mut self, phase: Phase, summary: String) {
        self.phases.push(PhaseReport { phase, summary });
    }

    /// Human-readable multi-line summary.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = vec![format!("deployment of {}", self.vm)];
        lines.extend(
            self.phases
                .iter()
                .map(|entry| format!("  phase {} ({}): {}", entry.phase.number(), entry.phase, entry.summary)),
        );
        if let Some(detection) = &self.detection {
            let instance = detection.evidence.instance_id.as_deref().unwrap_or("unknown");
            lines.push(format!(
                "  evidence: {} (instance {instance}), waited {}s of {}s",
                detection.evidence.label,
                detection.poll.elapsed.as_secs(),
                detection.poll.ceiling.as_secs()
            ));
        }
        lines.extend(
            self.warnings
                .entries()
                .iter()
                .map(|warning| format!("  warning [{}]: {}", warning.kind, warning.message)),
        );
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_keep_order_and_blocking_kinds() {
        let mut warnings = Warnings::default();
        warnings.push(Phase::SeedAndPersonalize, WarningKind::WeakEvidence, "weak");
        warnings.push(Phase::Finalize, WarningKind::Cleanup, "leftover");
        assert_eq!(warnings.entries().len(), 2);
        assert!(warnings.contains(WarningKind::Cleanup));
        assert!(!warnings.contains(WarningKind::CompletionTimeout));
        assert!(!WarningKind::WeakEvidence.is_blocking());
        assert!(WarningKind::CompletionTimeout.is_blocking());
    }

    #[test]
    fn render_lists_phases_and_warnings() {
        let mut report = DeploymentReport::new("web01");
        report.record(Phase::Clone, String::from("cloned from tpl"));
        report
            .warnings
            .push(Phase::Finalize, WarningKind::Cleanup, "eject failed");
        let text = report.render();
        assert!(text.contains("phase 1 (clone): cloned from tpl"));
        assert!(text.contains("warning [cleanup]: eject failed"));
    }
}
