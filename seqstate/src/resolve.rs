//! Recursive prerequisite resolution.
//!
//! `ensure(env, unit)` walks the declared prerequisites of `unit` in order. Each
//! prerequisite is itself ensured first, so a unit declaring only its
//! immediate predecessor still gets the whole ancestor chain validated.
//! Prerequisites that are not yet complete are materialized in the
//! activation's environment through the [`UnitRunner`].

use tracing::{debug, info, instrument, warn};

use crate::core::suite::Suite;
use crate::core::types::{MarkerKind, UnitOutcome};
use crate::error::{Result, SeqstateError};
use crate::io::environment::Environment;
use crate::io::executor::{UnitRequest, UnitRunner};

pub struct Resolver<'a, R> {
    suite: &'a Suite,
    runner: &'a R,
}

impl<'a, R: UnitRunner> Resolver<'a, R> {
    pub fn new(suite: &'a Suite, runner: &'a R) -> Self {
        Self { suite, runner }
    }

    /// Make every prerequisite of `unit` complete in `env`.
    ///
    /// Returns the ids of units whose bodies were executed, in execution
    /// order. The first failing prerequisite aborts the chain with
    /// [`SeqstateError::PrerequisiteFailed`].
    #[instrument(skip_all, fields(environment = env.name(), unit = unit))]
    pub fn ensure(&self, env: &Environment, unit: &str) -> Result<Vec<String>> {
        let mut executed = Vec::new();
        let mut stack = Vec::new();
        self.ensure_inner(env, unit, &mut stack, &mut executed)?;
        Ok(executed)
    }

    fn ensure_inner(
        &self,
        env: &Environment,
        unit: &str,
        stack: &mut Vec<String>,
        executed: &mut Vec<String>,
    ) -> Result<()> {
        if stack.iter().any(|entry| entry == unit) {
            return Err(SeqstateError::PrerequisiteCycle(unit.to_string()));
        }
        let descriptor = self.suite.require(unit)?;
        stack.push(unit.to_string());

        for prerequisite in &descriptor.prerequisites {
            self.ensure_inner(env, prerequisite, stack, executed)?;

            if env.markers().exists(prerequisite, MarkerKind::Complete)? {
                debug!(unit, prerequisite = %prerequisite, "prerequisite already complete");
                continue;
            }

            info!(unit, prerequisite = %prerequisite, "materializing prerequisite");
            match materialize(self.runner, env, prerequisite)? {
                UnitOutcome::Success => executed.push(prerequisite.clone()),
                UnitOutcome::Failure { detail } => {
                    warn!(unit, prerequisite = %prerequisite, %detail, "prerequisite failed");
                    return Err(SeqstateError::PrerequisiteFailed {
                        unit: unit.to_string(),
                        prerequisite: prerequisite.clone(),
                        detail,
                    });
                }
            }
        }

        stack.pop();
        Ok(())
    }
}

/// Run one unit body inside `env` with the full marker protocol:
/// `start`, `running` while the body executes, then `complete` on success.
///
/// A runner error counts as a failed outcome. On failure no `complete` marker
/// is written and the unit stays incomplete.
pub(crate) fn materialize<R: UnitRunner>(
    runner: &R,
    env: &Environment,
    unit: &str,
) -> Result<UnitOutcome> {
    let markers = env.markers();
    markers.put(unit, MarkerKind::Start)?;
    let outcome = execute_body(runner, env, unit)?;
    if outcome.is_success() {
        markers.put(unit, MarkerKind::Complete)?;
        info!(environment = env.name(), unit, "unit complete");
    }
    Ok(outcome)
}

/// Execute a started unit's body, holding a `running` marker meanwhile.
pub(crate) fn execute_body<R: UnitRunner>(
    runner: &R,
    env: &Environment,
    unit: &str,
) -> Result<UnitOutcome> {
    let markers = env.markers();
    markers.put(unit, MarkerKind::Running)?;
    let outcome = match runner.run(&UnitRequest::new(unit, env)) {
        Ok(outcome) => outcome,
        Err(err) => UnitOutcome::failure(format!("{err:#}")),
    };
    markers.remove(unit, MarkerKind::Running)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::suite::Suite;
    use crate::test_support::{ScriptedRunner, TestState, sequential, sequential_suite};

    #[test]
    fn ensure_runs_missing_chain_in_order() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B", "C", "D"]);
        let runner = ScriptedRunner::new();
        let env = state.env("seq");

        let executed = Resolver::new(&suite, &runner).ensure(&env, "D").expect("ensure");
        assert_eq!(executed, vec!["A", "B", "C"]);
        assert_eq!(runner.units(), vec!["A", "B", "C"]);
        for unit in ["A", "B", "C"] {
            assert!(env.markers().exists(unit, MarkerKind::Complete).expect("exists"));
        }
        assert!(!env.markers().exists("D", MarkerKind::Start).expect("exists"));
    }

    #[test]
    fn ensure_skips_complete_prerequisites() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B", "C"]);
        let runner = ScriptedRunner::new();
        let env = state.env("seq");
        state.complete(&env, &["A", "B"]);

        let executed = Resolver::new(&suite, &runner).ensure(&env, "C").expect("ensure");
        assert!(executed.is_empty());
        assert!(runner.units().is_empty());
    }

    /// `B` is complete but its own prerequisite `A` is not: the resolver must
    /// still descend into `B` and rebuild `A`.
    #[test]
    fn ensure_validates_ancestors_of_complete_prerequisite() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B", "C"]);
        let runner = ScriptedRunner::new();
        let env = state.env("seq");
        state.complete(&env, &["B"]);

        let executed = Resolver::new(&suite, &runner).ensure(&env, "C").expect("ensure");
        assert_eq!(executed, vec!["A"]);
    }

    #[test]
    fn diamond_prerequisite_runs_once() {
        let state = TestState::new();
        let order = ["A", "B", "C", "D"].map(String::from).to_vec();
        let suite = Suite::new(
            "seq",
            order,
            vec![
                sequential("A", &[]),
                sequential("B", &["A"]),
                sequential("C", &["A"]),
                sequential("D", &["B", "C"]),
            ],
        )
        .expect("suite");
        let runner = ScriptedRunner::new();
        let env = state.env("seq");

        Resolver::new(&suite, &runner).ensure(&env, "D").expect("ensure");
        assert_eq!(runner.units(), vec!["A", "B", "C"]);
    }

    #[test]
    fn failing_prerequisite_aborts_chain() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B", "C"]);
        let runner = ScriptedRunner::new().failing("A");
        let env = state.env("seq");

        let err = Resolver::new(&suite, &runner).ensure(&env, "C").unwrap_err();
        assert!(matches!(
            err,
            SeqstateError::PrerequisiteFailed { ref unit, ref prerequisite, .. }
                if unit == "B" && prerequisite == "A"
        ));
        assert_eq!(runner.units(), vec!["A"]);
        let markers = env.markers().snapshot().expect("snapshot");
        assert!(markers.started.contains("A"));
        assert!(markers.completed.is_empty());
        assert!(markers.running.is_empty());
    }

    #[test]
    fn runner_error_counts_as_failure() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B"]);
        let runner = ScriptedRunner::new().erroring("A");
        let env = state.env("seq");

        let err = Resolver::new(&suite, &runner).ensure(&env, "B").unwrap_err();
        assert!(err.to_string().contains("scripted error for A"));
    }
}
