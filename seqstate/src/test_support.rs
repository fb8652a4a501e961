//! Test-only helpers: suite builders, scripted runners, scratch state roots.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::suite::Suite;
use crate::core::types::{MarkerKind, MarkerSnapshot, UnitDescriptor, UnitKind, UnitOutcome};
use crate::io::environment::{Environment, EnvironmentManager, LockPolicy};
use crate::io::executor::{UnitRequest, UnitRunner};

/// Environment used by [`sequential`] and [`sequential_suite`].
pub const SEQ_ENV: &str = "seq";

/// Sequential unit in [`SEQ_ENV`] with explicit prerequisites.
pub fn sequential(id: &str, prerequisites: &[&str]) -> UnitDescriptor {
    UnitDescriptor {
        id: id.to_string(),
        kind: UnitKind::Sequential,
        prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
        environment: SEQ_ENV.to_string(),
    }
}

pub fn independent(id: &str, environment: &str, prerequisites: &[&str]) -> UnitDescriptor {
    UnitDescriptor {
        id: id.to_string(),
        kind: UnitKind::Independent,
        prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
        environment: environment.to_string(),
    }
}

/// Linear suite where each unit requires its immediate predecessor.
pub fn sequential_suite(ids: &[&str]) -> Suite {
    suite_with(ids, Vec::new())
}

/// Linear sequential chain plus extra (typically independent) units.
pub fn suite_with(ids: &[&str], extra: Vec<UnitDescriptor>) -> Suite {
    let mut units: Vec<UnitDescriptor> = ids
        .iter()
        .enumerate()
        .map(|(index, id)| {
            let prerequisites: Vec<&str> = index
                .checked_sub(1)
                .map(|prev| vec![ids[prev]])
                .unwrap_or_default();
            sequential(id, &prerequisites)
        })
        .collect();
    units.extend(extra);
    let order = ids.iter().map(|id| id.to_string()).collect();
    Suite::new(SEQ_ENV, order, units).expect("valid test suite")
}

/// Build a marker snapshot from `start` and `complete` unit lists.
pub fn snapshot(started: &[&str], completed: &[&str]) -> MarkerSnapshot {
    MarkerSnapshot {
        started: started.iter().map(|s| s.to_string()).collect(),
        completed: completed.iter().map(|s| s.to_string()).collect(),
        running: Default::default(),
    }
}

/// One recorded call into [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub unit: String,
    pub environment: String,
    /// Whether the unit's `start` marker existed when the body ran.
    pub saw_start: bool,
    /// Whether the unit's `complete` marker existed when the body ran.
    pub saw_complete: bool,
    /// Completed units visible in the environment when the body ran.
    pub completed_before: BTreeSet<String>,
}

/// Runner that records every invocation and succeeds unless told otherwise.
///
/// Each successful body drops `<unit>.artifact` into the work directory so
/// tests can observe what a wipe removed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    failing: BTreeSet<String>,
    erroring: BTreeSet<String>,
    calls: RefCell<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `UnitOutcome::Failure` for `unit`.
    pub fn failing(mut self, unit: &str) -> Self {
        self.failing.insert(unit.to_string());
        self
    }

    /// Return an `Err` for `unit`.
    pub fn erroring(mut self, unit: &str) -> Self {
        self.erroring.insert(unit.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Unit ids in invocation order.
    pub fn units(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|call| call.unit.clone()).collect()
    }

    pub fn reset(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl UnitRunner for ScriptedRunner {
    fn run(&self, request: &UnitRequest) -> Result<UnitOutcome> {
        let markers_dir = request
            .workdir
            .parent()
            .ok_or_else(|| anyhow!("workdir has no parent"))?
            .join("markers");
        let marker = |unit: &str, kind: MarkerKind| markers_dir.join(format!("{unit}.{kind}"));
        let completed_before = fs::read_dir(&markers_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                name.strip_suffix(".complete").map(str::to_string)
            })
            .collect();

        self.calls.borrow_mut().push(Invocation {
            unit: request.unit.clone(),
            environment: request.environment.clone(),
            saw_start: marker(&request.unit, MarkerKind::Start).exists(),
            saw_complete: marker(&request.unit, MarkerKind::Complete).exists(),
            completed_before,
        });

        if self.erroring.contains(&request.unit) {
            return Err(anyhow!("scripted error for {}", request.unit));
        }
        if self.failing.contains(&request.unit) {
            return Ok(UnitOutcome::failure(format!("scripted failure for {}", request.unit)));
        }
        fs::write(request.workdir.join(format!("{}.artifact", request.unit)), "ok")?;
        Ok(UnitOutcome::Success)
    }
}

/// Strip write permission from `dir`.
///
/// Returns `false`, with permissions restored, when the current user is not
/// subject to permission checks (root); callers skip the test then.
#[cfg(unix)]
pub fn make_read_only(dir: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).expect("chmod read-only");
    let check = dir.join(".write-check");
    if fs::write(&check, "").is_ok() {
        fs::remove_file(&check).expect("remove write check");
        make_writable(dir);
        return false;
    }
    true
}

#[cfg(unix)]
pub fn make_writable(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).expect("chmod writable");
}

/// Scratch state root with an unlocked environment manager.
pub struct TestState {
    _temp: tempfile::TempDir,
    manager: EnvironmentManager,
}

impl TestState {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(temp.path(), LockPolicy::Disabled);
        Self {
            _temp: temp,
            manager,
        }
    }

    pub fn path(&self) -> &Path {
        self.manager.state_root()
    }

    pub fn manager(&self) -> &EnvironmentManager {
        &self.manager
    }

    pub fn env(&self, name: &str) -> Environment {
        self.manager.load_or_create(name).expect("load environment")
    }

    /// Write `start` + `complete` markers for `units` in `env`.
    pub fn complete(&self, env: &Environment, units: &[&str]) {
        for unit in units {
            env.markers().put(unit, MarkerKind::Start).expect("start marker");
            env.markers().put(unit, MarkerKind::Complete).expect("complete marker");
        }
    }

    pub fn snapshot(&self, name: &str) -> MarkerSnapshot {
        self.env(name).markers().snapshot().expect("snapshot")
    }
}

impl Default for TestState {
    fn default() -> Self {
        Self::new()
    }
}
