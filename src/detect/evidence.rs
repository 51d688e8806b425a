//! Host-side classification of guest observations.
//!
//! Guest probes print raw `key<TAB>value<TAB>path` lines. Every timestamp
//! comparison against T0 happens here, and only a modification time strictly
//! after T0 counts.

use std::fmt;

use tracing::debug;

/// Which heuristic matched during the quick check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvidenceLabel {
    /// Personalization is permanently disabled on the guest.
    Disabled,
    /// The instance-identity marker was rewritten.
    InstanceId,
    /// The instance state directory was refreshed.
    InstanceDir,
    /// A per-module completion marker was written.
    ModuleSemaphore,
    /// The personalization log was written.
    Log,
    /// The boot-finished marker was written.
    BootFinished,
    /// Only a generated network configuration was written.
    NetworkArtifact,
    /// No evidence newer than T0.
    NotRan,
}

impl EvidenceLabel {
    /// Stable label for logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::InstanceId => "instance-id",
            Self::InstanceDir => "instance-dir",
            Self::ModuleSemaphore => "module-semaphore",
            Self::Log => "log",
            Self::BootFinished => "boot-finished",
            Self::NetworkArtifact => "network-artifact",
            Self::NotRan => "not-ran",
        }
    }

    /// Whether this label confirms activation on the current boot.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        !matches!(self, Self::Disabled | Self::NotRan)
    }

    /// Whether the evidence is weak and shortens the completion ceiling.
    #[must_use]
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::NetworkArtifact)
    }
}

impl fmt::Display for EvidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the quick check. Consumed by the phase that produced it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Evidence {
    /// Matched heuristic.
    pub label: EvidenceLabel,
    /// Guest path that matched, when any.
    pub path: Option<String>,
    /// Instance identifier written on this boot, when known.
    pub instance_id: Option<String>,
}

/// What a completion probe observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompletionSignal {
    /// The status query reported a terminal state (`done` or `error`).
    StatusQuery(String),
    /// The final-stage unit has exited.
    FinalUnit(String),
    /// The boot-finished marker is newer than T0.
    BootFinished,
}

impl fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusQuery(status) => write!(f, "status query reported {status}"),
            Self::FinalUnit(state) => write!(f, "final unit {state}"),
            Self::BootFinished => f.write_str("boot-finished marker written"),
        }
    }
}

/// Verdict of a single completion probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompletionProbe {
    /// The disable marker appeared.
    Disabled,
    /// Personalization has finished.
    Ready(CompletionSignal),
    /// Still running, or nothing conclusive yet.
    NotReady,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Observation<'a> {
    pub(super) key: &'a str,
    pub(super) value: &'a str,
    pub(super) path: &'a str,
}

impl Observation<'_> {
    fn newer_than(&self, t0: u64) -> bool {
        self.value.trim().parse::<u64>().is_ok_and(|mtime| mtime > t0)
    }
}

pub(super) fn parse_observations(stdout: &str) -> Vec<Observation<'_>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(key), Some(value), Some(path)) => Some(Observation {
                    key: key.trim(),
                    value,
                    path: path.trim(),
                }),
                _ => None,
            };
            if parsed.is_none() {
                debug!(line, "ignoring malformed probe line");
            }
            parsed
        })
        .collect()
}

const STRENGTH_ORDER: [(&str, EvidenceLabel); 6] = [
    ("instance_id", EvidenceLabel::InstanceId),
    ("instance_dir", EvidenceLabel::InstanceDir),
    ("module_semaphore", EvidenceLabel::ModuleSemaphore),
    ("log", EvidenceLabel::Log),
    ("boot_finished", EvidenceLabel::BootFinished),
    ("network_artifact", EvidenceLabel::NetworkArtifact),
];

/// Classifies quick-check output; the first match in strength order wins.
#[must_use]
pub fn classify_quick_check(stdout: &str, t0: u64) -> Evidence {
    let observations = parse_observations(stdout);
    if let Some(marker) = observations.iter().find(|obs| obs.key == "disabled") {
        return Evidence {
            label: EvidenceLabel::Disabled,
            path: Some(marker.path.to_owned()),
            instance_id: None,
        };
    }
    let instance_id = observations
        .iter()
        .any(|obs| obs.key == "instance_id" && obs.newer_than(t0))
        .then(|| {
            observations
                .iter()
                .find(|obs| obs.key == "instance_id_value")
                .map(|obs| obs.value.trim().to_owned())
        })
        .flatten()
        .filter(|value| !value.is_empty());

    for (key, label) in STRENGTH_ORDER {
        if let Some(hit) = observations
            .iter()
            .find(|obs| obs.key == key && obs.newer_than(t0))
        {
            return Evidence {
                label,
                path: Some(hit.path.to_owned()),
                instance_id,
            };
        }
    }
    Evidence {
        label: EvidenceLabel::NotRan,
        path: None,
        instance_id: None,
    }
}

/// Classifies completion-check output in probe order.
#[must_use]
pub fn classify_completion(stdout: &str, t0: u64) -> CompletionProbe {
    let observations = parse_observations(stdout);
    let find = |key: &str| observations.iter().find(|obs| obs.key == key);

    if find("disabled").is_some() {
        return CompletionProbe::Disabled;
    }
    if let Some(status) = find("status") {
        match status.value.trim() {
            "disabled" => return CompletionProbe::Disabled,
            terminal @ ("done" | "error" | "degraded done" | "degraded error") => {
                return CompletionProbe::Ready(CompletionSignal::StatusQuery(terminal.to_owned()));
            }
            _ => {}
        }
    }
    if let Some(unit) = find("final_unit") {
        let state = unit.value.trim();
        if matches!(state, "exited" | "failed") {
            return CompletionProbe::Ready(CompletionSignal::FinalUnit(state.to_owned()));
        }
    }
    if find("boot_finished").is_some_and(|obs| obs.newer_than(t0)) {
        return CompletionProbe::Ready(CompletionSignal::BootFinished);
    }
    CompletionProbe::NotReady
}
