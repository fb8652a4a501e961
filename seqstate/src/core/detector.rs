//! Dirty-state predicate for an environment about to host a unit.
//!
//! An environment is dirty for unit `u` when either
//! 1. some unit started and never completed, or
//! 2. a sequential unit ordered after `u` has started.
//!
//! Completed units ordered at or before `u` are the reusable common case and
//! never make the environment dirty.

use std::fmt;

use crate::core::suite::Suite;
use crate::core::types::{MarkerSnapshot, UnitState};
use crate::error::{Result, SeqstateError};

/// Why an environment cannot be trusted for a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pollution {
    /// Units with `start` but no `complete`, in lexicographic order.
    pub incomplete: Vec<String>,
    /// Sequential units ordered after the current unit that have started, in
    /// declared order.
    pub ahead: Vec<String>,
}

impl fmt::Display for Pollution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.incomplete.is_empty() {
            parts.push(format!("incomplete: {}", self.incomplete.join(", ")));
        }
        if !self.ahead.is_empty() {
            parts.push(format!("started ahead: {}", self.ahead.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Dirty(Pollution),
}

impl Verdict {
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }
}

/// Decide whether `snapshot` is consistent with "only units up to `unit` have
/// run, and `unit` itself has not completed work the caller cannot see".
///
/// Fails with [`SeqstateError::MarkerContract`] when a `complete` marker has no
/// matching `start`; that state is never produced by the orchestrator.
pub fn assess(
    suite: &Suite,
    environment: &str,
    snapshot: &MarkerSnapshot,
    unit: &str,
) -> Result<Verdict> {
    suite.require(unit)?;

    let orphaned = snapshot.orphaned_completions();
    if !orphaned.is_empty() {
        return Err(SeqstateError::MarkerContract {
            environment: environment.to_string(),
            detail: format!(
                "complete without start for {}",
                orphaned.into_iter().collect::<Vec<_>>().join(", ")
            ),
        });
    }

    let incomplete: Vec<String> = snapshot.incomplete().into_iter().collect();

    let first_after = suite.effective_position(unit).map_or(0, |p| p + 1);
    let ahead: Vec<String> = suite
        .order()
        .iter()
        .skip(first_after)
        .filter(|id| snapshot.started.contains(id.as_str()))
        .cloned()
        .collect();

    if incomplete.is_empty() && ahead.is_empty() {
        return Ok(Verdict::Clean);
    }
    Ok(Verdict::Dirty(Pollution { incomplete, ahead }))
}

/// Derive a unit's lifecycle state; `pid_alive` resolves `running` markers.
pub fn unit_state(snapshot: &MarkerSnapshot, unit: &str, pid_alive: impl Fn(u32) -> bool) -> UnitState {
    if snapshot.completed.contains(unit) {
        return UnitState::Complete;
    }
    if !snapshot.started.contains(unit) {
        return UnitState::Unstarted;
    }
    match snapshot.running.get(unit) {
        Some(pid) if pid_alive(*pid) => UnitState::Running,
        Some(_) => UnitState::Crashed,
        // No liveness token: a prepared unit whose host runner has not
        // reported back yet.
        None => UnitState::Started,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::suite::Suite;
    use crate::test_support::{independent, sequential, sequential_suite, snapshot};

    #[test]
    fn empty_environment_is_clean() {
        let suite = sequential_suite(&["A", "B", "C"]);
        let verdict = assess(&suite, "seq", &MarkerSnapshot::default(), "B").expect("assess");
        assert_eq!(verdict, Verdict::Clean);
    }

    #[test]
    fn completed_predecessors_and_self_are_reusable() {
        let suite = sequential_suite(&["A", "B", "C"]);
        let markers = snapshot(&["A", "B"], &["A", "B"]);
        assert_eq!(assess(&suite, "seq", &markers, "B").expect("assess"), Verdict::Clean);
        assert_eq!(assess(&suite, "seq", &markers, "C").expect("assess"), Verdict::Clean);
    }

    #[test]
    fn started_later_unit_pollutes_earlier_one() {
        let suite = sequential_suite(&["A", "B", "C"]);
        let markers = snapshot(&["A", "B", "C"], &["A", "B", "C"]);
        let verdict = assess(&suite, "seq", &markers, "A").expect("assess");
        assert_eq!(
            verdict,
            Verdict::Dirty(Pollution {
                incomplete: Vec::new(),
                ahead: vec!["B".to_string(), "C".to_string()],
            })
        );
    }

    #[test]
    fn incomplete_unit_is_dirty_for_any_unit() {
        let suite = sequential_suite(&["A", "B", "C"]);
        let markers = snapshot(&["A", "B"], &["A"]);
        for unit in ["A", "B", "C"] {
            let verdict = assess(&suite, "seq", &markers, unit).expect("assess");
            let Verdict::Dirty(pollution) = verdict else {
                panic!("expected dirty for {unit}");
            };
            assert_eq!(pollution.incomplete, vec!["B".to_string()]);
        }
    }

    #[test]
    fn completion_without_start_is_a_contract_violation() {
        let suite = sequential_suite(&["A", "B"]);
        let markers = snapshot(&[], &["A"]);
        let err = assess(&suite, "seq", &markers, "B").unwrap_err();
        assert!(matches!(err, SeqstateError::MarkerContract { .. }));
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let suite = sequential_suite(&["A"]);
        let err = assess(&suite, "seq", &MarkerSnapshot::default(), "Z").unwrap_err();
        assert!(matches!(err, SeqstateError::UnknownUnit(id) if id == "Z"));
    }

    #[test]
    fn independent_unit_tolerates_its_ancestry_only() {
        let suite = Suite::new(
            "seq",
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            vec![
                sequential("A", &[]),
                sequential("B", &["A"]),
                sequential("C", &["B"]),
                independent("X", "x", &["B"]),
            ],
        )
        .expect("suite");

        let rebuilt = snapshot(&["A", "B"], &["A", "B"]);
        assert_eq!(assess(&suite, "x", &rebuilt, "X").expect("assess"), Verdict::Clean);

        let overshot = snapshot(&["A", "B", "C"], &["A", "B", "C"]);
        assert!(assess(&suite, "x", &overshot, "X").expect("assess").is_dirty());
    }

    #[test]
    fn unit_state_distinguishes_running_from_crashed() {
        let mut markers = snapshot(&["A", "B", "C"], &["A"]);
        markers.running.insert("B".to_string(), 10);
        markers.running.insert("C".to_string(), 20);
        let alive = |pid: u32| pid == 10;

        assert_eq!(unit_state(&markers, "A", alive), UnitState::Complete);
        assert_eq!(unit_state(&markers, "B", alive), UnitState::Running);
        assert_eq!(unit_state(&markers, "C", alive), UnitState::Crashed);
        assert_eq!(unit_state(&markers, "D", alive), UnitState::Unstarted);

        markers.running.clear();
        assert_eq!(unit_state(&markers, "B", alive), UnitState::Started);
    }
}
