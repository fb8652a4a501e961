//! Per-unit lifecycle protocol.
//!
//! Every activation of a unit goes through the same steps:
//!
//! 1. load (or create) the unit's environment;
//! 2. assess it; when dirty, wipe and recreate it;
//! 3. ensure every prerequisite is complete (rebuilding as needed);
//! 4. write the unit's `start` marker, dropping any earlier `complete`;
//! 5. the unit body runs (via [`Orchestrator::run`], or by the host runner
//!    between [`Orchestrator::begin`] and [`Orchestrator::finish`]);
//! 6. on success write `complete`; on failure leave the unit incomplete.
//!
//! Per unit and environment: `unstarted -> started -> {complete | crashed}`.
//! A crashed unit only returns to `unstarted` through a full wipe.

use tracing::{debug, error, info, instrument, warn};

use crate::core::detector::{Pollution, Verdict, assess, unit_state};
use crate::core::suite::Suite;
use crate::core::types::{MarkerKind, UnitOutcome, UnitState};
use crate::error::{Result, SeqstateError};
use crate::io::environment::{Environment, EnvironmentManager};
use crate::io::executor::UnitRunner;
use crate::io::liveness::is_pid_alive;
use crate::resolve::{Resolver, execute_body};

/// A unit that has passed pre-flight and has its `start` marker written.
#[derive(Debug)]
pub struct Activation {
    unit: String,
    env: Environment,
    pollution: Option<Pollution>,
    prerequisites_run: Vec<String>,
}

impl Activation {
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Pollution that forced a wipe during pre-flight, if any.
    pub fn pollution(&self) -> Option<&Pollution> {
        self.pollution.as_ref()
    }

    pub fn prerequisites_run(&self) -> &[String] {
        &self.prerequisites_run
    }
}

/// Summary of a completed activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub unit: String,
    pub environment: String,
    /// True when the environment was wiped and rebuilt first.
    pub rebuilt: bool,
    /// Prerequisites whose bodies ran, in execution order.
    pub prerequisites_run: Vec<String>,
}

pub struct Orchestrator<'a, R> {
    suite: &'a Suite,
    envs: &'a EnvironmentManager,
    runner: R,
}

impl<'a, R: UnitRunner> Orchestrator<'a, R> {
    pub fn new(suite: &'a Suite, envs: &'a EnvironmentManager, runner: R) -> Self {
        Self {
            suite,
            envs,
            runner,
        }
    }

    /// Full lifecycle: pre-flight, run the unit's body, record the outcome.
    #[instrument(skip(self))]
    pub fn run(&self, unit: &str) -> Result<RunReport> {
        let activation = self.begin(unit)?;
        let outcome = execute_body(&self.runner, &activation.env, unit)?;
        self.finish(activation, outcome)
    }

    /// Steps 1-4: make the environment trustworthy for `unit` and mark it
    /// started. The caller runs the body and then calls [`Self::finish`].
    #[instrument(skip(self))]
    pub fn begin(&self, unit: &str) -> Result<Activation> {
        let descriptor = self.suite.require(unit)?;
        let name = descriptor.environment.as_str();
        let mut env = self.envs.load_or_create(name)?;

        let snapshot = env.markers().snapshot()?;
        let pollution = match assess(self.suite, name, &snapshot, unit)? {
            Verdict::Clean => None,
            Verdict::Dirty(pollution) => {
                for incomplete in &pollution.incomplete {
                    let diagnosis = match unit_state(&snapshot, incomplete, is_pid_alive) {
                        UnitState::Running => "still running",
                        UnitState::Crashed => "crashed",
                        _ => "never completed",
                    };
                    warn!(environment = name, unit = %incomplete, diagnosis, "incomplete unit");
                }
                warn!(environment = name, unit, %pollution, "environment polluted; rebuilding");
                self.envs.wipe(name)?;
                env = self.envs.load_or_create(name)?;
                Some(pollution)
            }
        };

        let prerequisites_run = Resolver::new(self.suite, &self.runner).ensure(&env, unit)?;
        if !prerequisites_run.is_empty() {
            info!(environment = name, unit, chain = ?prerequisites_run, "prerequisites materialized");
        }

        // Until this body succeeds the unit is incomplete, even on a rerun.
        let markers = env.markers();
        markers.put(unit, MarkerKind::Start)?;
        if markers.exists(unit, MarkerKind::Complete)? {
            debug!(environment = name, unit, "revoking previous completion for rerun");
            markers.remove(unit, MarkerKind::Complete)?;
        }
        Ok(Activation {
            unit: unit.to_string(),
            env,
            pollution,
            prerequisites_run,
        })
    }

    /// Step 6: record the outcome of a body started by [`Self::begin`].
    ///
    /// Failure leaves the unit incomplete and returns
    /// [`SeqstateError::UnitFailed`].
    pub fn finish(&self, activation: Activation, outcome: UnitOutcome) -> Result<RunReport> {
        let Activation {
            unit,
            env,
            pollution,
            prerequisites_run,
        } = activation;
        let markers = env.markers();
        markers.remove(&unit, MarkerKind::Running)?;
        match outcome {
            UnitOutcome::Success => {
                markers.put(&unit, MarkerKind::Complete)?;
                info!(environment = env.name(), unit = %unit, "unit complete");
                Ok(RunReport {
                    environment: env.name().to_string(),
                    unit,
                    rebuilt: pollution.is_some(),
                    prerequisites_run,
                })
            }
            UnitOutcome::Failure { detail } => {
                error!(environment = env.name(), unit = %unit, %detail, "unit failed; left incomplete");
                Err(SeqstateError::UnitFailed { unit, detail })
            }
        }
    }

    /// Record completion for a unit prepared in an earlier process.
    ///
    /// The unit must have a `start` marker in its environment.
    #[instrument(skip(self))]
    pub fn mark_complete(&self, unit: &str) -> Result<()> {
        let descriptor = self.suite.require(unit)?;
        let env = self.envs.load_or_create(&descriptor.environment)?;
        let markers = env.markers();
        if !markers.exists(unit, MarkerKind::Start)? {
            return Err(SeqstateError::MarkerContract {
                environment: env.name().to_string(),
                detail: format!("unit '{unit}' was never started"),
            });
        }
        markers.remove(unit, MarkerKind::Running)?;
        markers.put(unit, MarkerKind::Complete)?;
        info!(environment = env.name(), unit, "unit complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, TestState, sequential_suite};

    #[test]
    fn begin_and_finish_split_the_lifecycle() {
        let state = TestState::new();
        let suite = sequential_suite(&["A", "B"]);
        let runner = ScriptedRunner::new();
        let orchestrator = Orchestrator::new(&suite, state.manager(), &runner);

        let activation = orchestrator.begin("B").expect("begin");
        assert_eq!(activation.prerequisites_run(), ["A"]);
        assert!(activation.pollution().is_none());
        let markers = activation.environment().markers().clone();
        assert!(markers.exists("B", MarkerKind::Start).expect("exists"));
        assert!(!markers.exists("B", MarkerKind::Complete).expect("exists"));

        let report = orchestrator
            .finish(activation, UnitOutcome::Success)
            .expect("finish");
        assert_eq!(report.prerequisites_run, vec!["A"]);
        assert!(!report.rebuilt);
        assert!(markers.exists("B", MarkerKind::Complete).expect("exists"));
    }

    #[test]
    fn failed_body_leaves_unit_incomplete() {
        let state = TestState::new();
        let suite = sequential_suite(&["A"]);
        let runner = ScriptedRunner::new().failing("A");
        let orchestrator = Orchestrator::new(&suite, state.manager(), &runner);

        let err = orchestrator.run("A").unwrap_err();
        assert!(matches!(err, SeqstateError::UnitFailed { ref unit, .. } if unit == "A"));

        let env = state.env("seq");
        let snapshot = env.markers().snapshot().expect("snapshot");
        assert!(snapshot.started.contains("A"));
        assert!(!snapshot.completed.contains("A"));
        assert!(snapshot.running.is_empty());
    }

    #[test]
    fn mark_complete_requires_start() {
        let state = TestState::new();
        let suite = sequential_suite(&["A"]);
        let orchestrator = Orchestrator::new(&suite, state.manager(), ScriptedRunner::new());

        let err = orchestrator.mark_complete("A").unwrap_err();
        assert!(matches!(err, SeqstateError::MarkerContract { .. }));

        orchestrator.begin("A").expect("begin");
        orchestrator.mark_complete("A").expect("complete");
        assert!(
            state
                .env("seq")
                .markers()
                .exists("A", MarkerKind::Complete)
                .expect("exists")
        );
    }
}
