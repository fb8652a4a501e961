//! Suite configuration stored in `seqstate.toml`.
//!
//! Read once when orchestration starts; nothing mutates it at runtime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::suite::Suite;
use crate::core::types::{UnitDescriptor, UnitKind};
use crate::io::environment::LockPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "seqstate.toml";

/// Top-level configuration (TOML).
///
/// This file is edited by humans. Missing optional fields default to
/// sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeqstateConfig {
    /// Where environments live. Relative paths resolve against the directory
    /// containing the config file.
    pub state_root: PathBuf,

    /// Wall-clock budget for one unit body, in seconds.
    pub unit_timeout_secs: u64,

    /// Truncate unit stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    pub lock: LockConfig,

    pub sequence: SequenceConfig,

    #[serde(rename = "unit")]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub enabled: bool,
    /// Give up waiting after this many seconds; unset waits indefinitely.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SequenceConfig {
    /// Environment shared by every sequential unit.
    pub environment: String,
    /// Sequential unit ids in execution order.
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UnitConfig {
    pub id: String,
    pub kind: UnitKind,
    /// Required for independent units; sequential units default to
    /// `sequence.environment`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Omitted on a sequential unit means "the immediate predecessor".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerequisites: Option<Vec<String>>,
    /// Command for the unit body (e.g. `["cargo","test","--test","clone"]`).
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            environment: "sequential".to_string(),
            order: Vec::new(),
        }
    }
}

impl Default for SeqstateConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(".seqstate"),
            unit_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            lock: LockConfig::default(),
            sequence: SequenceConfig::default(),
            units: Vec::new(),
        }
    }
}

impl SeqstateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.unit_timeout_secs == 0 {
            return Err(anyhow!("unit_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.lock.timeout_secs == Some(0) {
            return Err(anyhow!("lock.timeout_secs must be > 0 when set"));
        }
        self.suite().map(|_| ())
    }

    /// Build the validated suite described by this config.
    pub fn suite(&self) -> Result<Suite> {
        let mut errors = Vec::new();
        let mut descriptors = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let environment = match (unit.kind, &unit.environment) {
                (_, Some(env)) => env.clone(),
                (UnitKind::Sequential, None) => self.sequence.environment.clone(),
                (UnitKind::Independent, None) => {
                    errors.push(format!("independent unit '{}' must name an environment", unit.id));
                    continue;
                }
            };
            let prerequisites = match (&unit.prerequisites, unit.kind) {
                (Some(explicit), _) => explicit.clone(),
                (None, UnitKind::Sequential) => self.predecessor(&unit.id).into_iter().collect(),
                (None, UnitKind::Independent) => Vec::new(),
            };
            descriptors.push(UnitDescriptor {
                id: unit.id.clone(),
                kind: unit.kind,
                prerequisites,
                environment,
            });
        }
        if !errors.is_empty() {
            return Err(anyhow!("invalid suite:\n- {}", errors.join("\n- ")));
        }
        let suite = Suite::new(
            self.sequence.environment.clone(),
            self.sequence.order.clone(),
            descriptors,
        )?;
        Ok(suite)
    }

    /// Unit body commands keyed by unit id (units without a command omitted).
    pub fn commands(&self) -> HashMap<String, Vec<String>> {
        self.units
            .iter()
            .filter(|unit| !unit.command.is_empty())
            .map(|unit| (unit.id.clone(), unit.command.clone()))
            .collect()
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        if !self.lock.enabled {
            return LockPolicy::Disabled;
        }
        LockPolicy::Exclusive {
            timeout: self.lock.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolve `state_root` against `base` (the config file's directory).
    pub fn resolved_state_root(&self, base: &Path) -> PathBuf {
        if self.state_root.is_absolute() {
            self.state_root.clone()
        } else {
            base.join(&self.state_root)
        }
    }

    fn predecessor(&self, id: &str) -> Option<String> {
        let index = self.sequence.order.iter().position(|entry| entry == id)?;
        index
            .checked_sub(1)
            .map(|prev| self.sequence.order[prev].clone())
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<SeqstateConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("load {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<SeqstateConfig> {
    let cfg: SeqstateConfig = toml::from_str(contents).context("parse config toml")?;
    cfg.validate()?;
    Ok(cfg)
}
