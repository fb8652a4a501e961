//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// How a unit relates to the shared sequential environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Shares the suite's sequential environment and builds on earlier units.
    Sequential,
    /// Owns a dedicated environment; may run alongside anything else.
    Independent,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Independent => f.write_str("independent"),
        }
    }
}

/// Declared identity of one test phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    pub id: String,
    pub kind: UnitKind,
    /// Units that must be complete before this one starts, in declared order.
    pub prerequisites: Vec<String>,
    pub environment: String,
}

/// The three marker facts recorded per `(environment, unit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Start,
    Running,
    Complete,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 3] = [MarkerKind::Start, MarkerKind::Running, MarkerKind::Complete];

    /// File extension used for this marker on disk.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub unit: String,
    pub kind: MarkerKind,
    /// Process that wrote the marker; the liveness token for `running`.
    pub pid: u32,
    pub recorded_at_ms: u64,
}

/// In-memory view of one environment's markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerSnapshot {
    pub started: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    /// Units with a `running` marker, keyed to the recorded pid.
    pub running: BTreeMap<String, u32>,
}

impl MarkerSnapshot {
    pub fn has(&self, unit: &str, kind: MarkerKind) -> bool {
        match kind {
            MarkerKind::Start => self.started.contains(unit),
            MarkerKind::Running => self.running.contains_key(unit),
            MarkerKind::Complete => self.completed.contains(unit),
        }
    }

    /// Units with `start` but no `complete`.
    pub fn incomplete(&self) -> BTreeSet<String> {
        self.started.difference(&self.completed).cloned().collect()
    }

    /// Units with `complete` but no `start` (contract violation).
    pub fn orphaned_completions(&self) -> BTreeSet<String> {
        self.completed.difference(&self.started).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.completed.is_empty() && self.running.is_empty()
    }
}

/// Per-unit lifecycle state derived from markers.
///
/// `Crashed` and `Running` are both "started without complete"; they differ
/// only in whether the recorded pid is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Unstarted,
    Started,
    Running,
    Crashed,
    Complete,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unstarted => "unstarted",
            Self::Started => "started",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Complete => "complete",
        };
        f.write_str(label)
    }
}

/// Outcome reported by the unit execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Success,
    Failure { detail: String },
}

impl UnitOutcome {
    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure {
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
