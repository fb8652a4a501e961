//! Read-only status report for `seqstate status`.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::detector::unit_state;
use crate::core::suite::Suite;
use crate::core::types::UnitState;
use crate::error::Result;
use crate::io::environment::EnvironmentManager;
use crate::io::liveness::is_pid_alive;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentStatus {
    pub name: String,
    /// False when the environment has not been created yet.
    pub exists: bool,
    pub units: Vec<UnitStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub unit: String,
    pub state: UnitState,
    /// False for markers of units the suite no longer declares.
    pub declared: bool,
}

/// Collect unit states for `only`, or for every declared and on-disk
/// environment. Never creates, locks, or mutates anything.
pub fn collect_status(
    suite: &Suite,
    envs: &EnvironmentManager,
    only: Option<&str>,
) -> Result<Vec<EnvironmentStatus>> {
    let names: BTreeSet<String> = match only {
        Some(name) => BTreeSet::from([name.to_string()]),
        None => {
            let mut names = envs.list()?;
            names.extend(suite.environments().into_iter().map(str::to_string));
            names
        }
    };

    let mut report = Vec::with_capacity(names.len());
    for name in names {
        let env = envs.peek(&name)?;
        let snapshot = match &env {
            Some(env) => env.markers().snapshot()?,
            None => Default::default(),
        };

        // Declared order first, then other units owning this environment,
        // then anything else with markers here.
        let mut listed: Vec<String> = Vec::new();
        if name == suite.sequential_environment() {
            listed.extend(suite.order().iter().cloned());
        }
        for unit in suite.units() {
            if unit.environment == name && !listed.contains(&unit.id) {
                listed.push(unit.id.clone());
            }
        }
        let seen: BTreeSet<&String> = snapshot
            .started
            .iter()
            .chain(snapshot.completed.iter())
            .chain(snapshot.running.keys())
            .collect();
        for unit in seen {
            if !listed.contains(unit) {
                listed.push(unit.clone());
            }
        }

        let units = listed
            .into_iter()
            .map(|unit| UnitStatus {
                state: unit_state(&snapshot, &unit, is_pid_alive),
                declared: suite.unit(&unit).is_some(),
                unit,
            })
            .collect();
        report.push(EnvironmentStatus {
            name,
            exists: env.is_some(),
            units,
        });
    }
    Ok(report)
}

/// Plain-text rendering, one block per environment.
pub fn render_status(report: &[EnvironmentStatus]) -> String {
    let width = report
        .iter()
        .flat_map(|env| env.units.iter().map(|u| u.unit.len()))
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for env in report {
        let suffix = if env.exists { "" } else { " (not created)" };
        out.push_str(&format!("{}{suffix}\n", env.name));
        for unit in &env.units {
            let note = if unit.declared { "" } else { "  (undeclared)" };
            out.push_str(&format!("  {:<width$}  {}{note}\n", unit.unit, unit.state));
        }
    }
    out
}
