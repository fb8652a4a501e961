//! Unit execution collaborator.
//!
//! The [`UnitRunner`] trait decouples orchestration from how a unit body is
//! actually executed. The CLI uses [`CommandUnitRunner`]; tests use scripted
//! runners that record invocations without spawning processes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::UnitOutcome;
use crate::io::environment::Environment;
use crate::io::process::run_with_timeout;

pub const ENV_UNIT: &str = "SEQSTATE_UNIT";
pub const ENV_ENVIRONMENT: &str = "SEQSTATE_ENVIRONMENT";
pub const ENV_WORKDIR: &str = "SEQSTATE_WORKDIR";

/// Everything a runner needs to execute one unit body.
#[derive(Debug, Clone)]
pub struct UnitRequest {
    pub unit: String,
    pub environment: String,
    /// Working directory owned by the environment.
    pub workdir: PathBuf,
    /// Path for the body's stdout/stderr log.
    pub log_path: PathBuf,
}

impl UnitRequest {
    pub fn new(unit: &str, env: &Environment) -> Self {
        Self {
            unit: unit.to_string(),
            environment: env.name().to_string(),
            workdir: env.work_dir().to_path_buf(),
            log_path: env.log_path(unit),
        }
    }
}

/// Abstraction over unit body execution backends.
///
/// Must be safe to invoke against a freshly wiped environment. An `Err` is
/// treated by the orchestrator as a failure of the unit.
pub trait UnitRunner {
    fn run(&self, request: &UnitRequest) -> Result<UnitOutcome>;
}

impl<R: UnitRunner + ?Sized> UnitRunner for &R {
    fn run(&self, request: &UnitRequest) -> Result<UnitOutcome> {
        (**self).run(request)
    }
}

/// Runner that spawns each unit's configured command.
#[derive(Debug, Clone)]
pub struct CommandUnitRunner {
    commands: HashMap<String, Vec<String>>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandUnitRunner {
    pub fn new(
        commands: HashMap<String, Vec<String>>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            commands,
            timeout,
            output_limit_bytes,
        }
    }
}

impl UnitRunner for CommandUnitRunner {
    #[instrument(skip_all, fields(unit = %request.unit, environment = %request.environment))]
    fn run(&self, request: &UnitRequest) -> Result<UnitOutcome> {
        let argv = self
            .commands
            .get(&request.unit)
            .ok_or_else(|| anyhow!("no command configured for unit '{}'", request.unit))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command for unit '{}'", request.unit))?;

        info!(program = %program, workdir = %request.workdir.display(), "running unit body");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env(ENV_UNIT, &request.unit)
            .env(ENV_ENVIRONMENT, &request.environment)
            .env(ENV_WORKDIR, &request.workdir);

        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run unit '{}'", request.unit))?;
        write_unit_log(&request.log_path, &output.render_log(), self.output_limit_bytes)?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "unit body timed out");
            return Ok(UnitOutcome::failure(format!(
                "timed out after {:?} (log: {})",
                self.timeout,
                request.log_path.display()
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "unit body failed");
            return Ok(UnitOutcome::failure(format!(
                "exited with status {:?} (log: {})",
                output.status.code(),
                request.log_path.display()
            )));
        }

        debug!("unit body succeeded");
        Ok(UnitOutcome::Success)
    }
}

fn write_unit_log(path: &Path, body: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create unit log dir {}", parent.display()))?;
    }
    if body.len() > output_limit {
        let mut cut = output_limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &body[..cut], body.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write unit log {}", path.display()));
    }
    fs::write(path, body).with_context(|| format!("write unit log {}", path.display()))
}
