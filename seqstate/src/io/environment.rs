//! Named, isolated environments under a state root.
//!
//! # Layout
//!
//! ```text
//! <state_root>/envs/<name>/markers/   marker store (owned 1:1)
//! <state_root>/envs/<name>/work/      working directory for unit bodies
//! <state_root>/envs/<name>/logs/      per-unit execution logs
//! <state_root>/locks/<name>.lock      advisory lock, survives wipes
//! <state_root>/trash/                 staging area for wipes
//! ```
//!
//! Two environments never share a directory. Nothing outside this module and
//! the orchestrator writes under `envs/`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::suite::validate_name;
use crate::error::{IoContext, Result, SeqstateError};
use crate::io::lock::EnvLock;
use crate::io::markers::MarkerStore;

static WIPE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Locking behaviour for [`EnvironmentManager::load_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    Disabled,
    /// Wait for the lock; `None` waits indefinitely.
    Exclusive { timeout: Option<Duration> },
}

/// Handle to one environment.
#[derive(Debug, Clone)]
pub struct Environment {
    name: String,
    root_path: PathBuf,
    work_dir: PathBuf,
    logs_dir: PathBuf,
    markers: MarkerStore,
}

impl Environment {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory exclusively owned by this environment.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log_path(&self, unit: &str) -> PathBuf {
        self.logs_dir.join(format!("{unit}.log"))
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }
}

/// Creates, loads, and destroys environments under one state root.
///
/// Locks taken by `load_or_create` are held until the manager is dropped.
#[derive(Debug)]
pub struct EnvironmentManager {
    state_root: PathBuf,
    lock_policy: LockPolicy,
    held_locks: Mutex<HashMap<String, EnvLock>>,
}

impl EnvironmentManager {
    pub fn new(state_root: impl Into<PathBuf>, lock_policy: LockPolicy) -> Self {
        Self {
            state_root: state_root.into(),
            lock_policy,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn envs_dir(&self) -> PathBuf {
        self.state_root.join("envs")
    }

    fn env_dir(&self, name: &str) -> PathBuf {
        self.envs_dir().join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.state_root.join("locks").join(format!("{name}.lock"))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        validate_name("environment", name)?;
        let dir = self.env_dir(name);
        dir.try_exists()
            .io_context(|| format!("stat environment {}", dir.display()))
    }

    /// Return the environment, creating an empty one if it does not exist.
    ///
    /// Idempotent: an existing environment is returned without mutation.
    pub fn load_or_create(&self, name: &str) -> Result<Environment> {
        validate_name("environment", name)?;
        self.ensure_locked(name)?;

        let root_path = self.env_dir(name);
        let created = !root_path
            .try_exists()
            .io_context(|| format!("stat environment {}", root_path.display()))?;
        let work_dir = root_path.join("work");
        let logs_dir = root_path.join("logs");
        fs::create_dir_all(&work_dir)
            .io_context(|| format!("create work dir {}", work_dir.display()))?;
        fs::create_dir_all(&logs_dir)
            .io_context(|| format!("create log dir {}", logs_dir.display()))?;
        let markers = MarkerStore::open(name, root_path.join("markers"))?;
        if created {
            info!(environment = name, path = %root_path.display(), "created environment");
        } else {
            debug!(environment = name, "loaded environment");
        }
        Ok(Environment {
            name: name.to_string(),
            root_path,
            work_dir,
            logs_dir,
            markers,
        })
    }

    /// Open an existing environment without creating or locking it.
    pub fn peek(&self, name: &str) -> Result<Option<Environment>> {
        if !self.exists(name)? {
            return Ok(None);
        }
        let root_path = self.env_dir(name);
        Ok(Some(Environment {
            name: name.to_string(),
            work_dir: root_path.join("work"),
            logs_dir: root_path.join("logs"),
            markers: MarkerStore::at(name, root_path.join("markers")),
            root_path,
        }))
    }

    /// Delete the environment's working directory and every marker.
    ///
    /// The directory is first renamed into `trash/` so the environment
    /// disappears in one step, then deleted. Either step failing is a
    /// [`SeqstateError::WipeFailed`]; the caller must not continue as if the
    /// environment were clean. Wiping a missing environment is a no-op.
    pub fn wipe(&self, name: &str) -> Result<()> {
        validate_name("environment", name)?;
        self.ensure_locked(name)?;
        let dir = self.env_dir(name);
        let wipe_failed = |path: &Path, source| SeqstateError::WipeFailed {
            environment: name.to_string(),
            path: path.to_path_buf(),
            source,
        };

        match fs::symlink_metadata(&dir) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(environment = name, "nothing to wipe");
                return Ok(());
            }
            Err(err) => return Err(wipe_failed(&dir, err)),
        }

        let trash_dir = self.state_root.join("trash");
        fs::create_dir_all(&trash_dir).map_err(|err| wipe_failed(&trash_dir, err))?;
        let staged = trash_dir.join(format!(
            "{name}-{}-{}",
            std::process::id(),
            WIPE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::rename(&dir, &staged).map_err(|err| wipe_failed(&dir, err))?;
        fs::remove_dir_all(&staged).map_err(|err| wipe_failed(&staged, err))?;

        warn!(environment = name, "environment wiped");
        Ok(())
    }

    /// Names of every environment currently on disk.
    pub fn list(&self) -> Result<BTreeSet<String>> {
        let dir = self.envs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(err).io_context(|| format!("read environments {}", dir.display()));
            }
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.io_context(|| format!("read environments {}", dir.display()))?;
            if let Some(name) = entry.file_name().to_str()
                && validate_name("environment", name).is_ok()
            {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    fn ensure_locked(&self, name: &str) -> Result<()> {
        let LockPolicy::Exclusive { timeout } = self.lock_policy else {
            return Ok(());
        };
        let mut held = self
            .held_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if held.contains_key(name) {
            return Ok(());
        }
        let lock = EnvLock::acquire(name, &self.lock_path(name), timeout)?;
        held.insert(name.to_string(), lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MarkerKind;
    #[cfg(unix)]
    use crate::test_support::{make_read_only, make_writable};

    fn manager(temp: &tempfile::TempDir) -> EnvironmentManager {
        EnvironmentManager::new(temp.path(), LockPolicy::Disabled)
    }

    #[test]
    fn load_or_create_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);

        let env = manager.load_or_create("seq").expect("create");
        assert!(env.work_dir().is_dir());
        fs::write(env.work_dir().join("artifact"), "built").expect("write artifact");
        env.markers().put("A", MarkerKind::Start).expect("start");

        let again = manager.load_or_create("seq").expect("load");
        assert_eq!(again.root_path(), env.root_path());
        assert!(again.work_dir().join("artifact").exists());
        assert!(again.markers().exists("A", MarkerKind::Start).expect("exists"));
    }

    #[test]
    fn wipe_removes_work_and_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);
        let env = manager.load_or_create("seq").expect("create");
        fs::write(env.work_dir().join("artifact"), "built").expect("write artifact");
        env.markers().put("A", MarkerKind::Start).expect("start");

        manager.wipe("seq").expect("wipe");
        assert!(!manager.exists("seq").expect("exists"));

        let fresh = manager.load_or_create("seq").expect("recreate");
        assert!(fresh.markers().snapshot().expect("snapshot").is_empty());
        assert!(!fresh.work_dir().join("artifact").exists());
        let trash: Vec<_> = fs::read_dir(temp.path().join("trash")).expect("trash").collect();
        assert!(trash.is_empty());
    }

    #[test]
    fn peek_never_creates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);
        assert!(manager.peek("seq").expect("peek").is_none());
        assert!(!manager.exists("seq").expect("exists"));

        manager.load_or_create("seq").expect("create");
        let env = manager.peek("seq").expect("peek").expect("present");
        assert_eq!(env.name(), "seq");
    }

    #[test]
    fn wipe_of_missing_environment_is_noop() {
        let temp = tempfile::tempdir().expect("tempdir");
        manager(&temp).wipe("never-created").expect("wipe");
    }

    #[test]
    fn environments_are_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);
        let a = manager.load_or_create("a").expect("a");
        let b = manager.load_or_create("b").expect("b");
        a.markers().put("X", MarkerKind::Start).expect("start");
        fs::write(a.work_dir().join("file"), "a").expect("write");

        assert!(!b.markers().exists("X", MarkerKind::Start).expect("exists"));
        assert!(!b.work_dir().join("file").exists());

        manager.wipe("b").expect("wipe b");
        assert!(a.markers().exists("X", MarkerKind::Start).expect("exists"));
        assert_eq!(
            manager.list().expect("list").into_iter().collect::<Vec<_>>(),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn rejects_path_like_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = manager(&temp).load_or_create("../outside").unwrap_err();
        assert!(matches!(err, SeqstateError::InvalidName { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn wipe_fails_when_environment_cannot_be_moved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);
        let env = manager.load_or_create("seq").expect("create");
        env.markers().put("A", MarkerKind::Start).expect("start");
        let envs_dir = temp.path().join("envs");
        if !make_read_only(&envs_dir) {
            return;
        }

        let result = manager.wipe("seq");
        make_writable(&envs_dir);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            SeqstateError::WipeFailed { ref environment, ref path, .. }
                if environment == "seq" && path == env.root_path()
        ));
        assert!(manager.exists("seq").expect("exists"));
        assert!(env.markers().exists("A", MarkerKind::Start).expect("exists"));
    }

    #[cfg(unix)]
    #[test]
    fn wipe_fails_when_contents_cannot_be_deleted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager(&temp);
        let env = manager.load_or_create("seq").expect("create");
        let locked = env.work_dir().join("locked");
        fs::create_dir_all(&locked).expect("mkdir");
        fs::write(locked.join("file"), "x").expect("write");
        if !make_read_only(&locked) {
            return;
        }

        let err = manager.wipe("seq").unwrap_err();
        let SeqstateError::WipeFailed { ref path, .. } = err else {
            panic!("expected WipeFailed, got {err:?}");
        };
        make_writable(&path.join("work").join("locked"));
        assert!(path.starts_with(temp.path().join("trash")));
        assert!(!manager.exists("seq").expect("exists"));
    }

    #[cfg(unix)]
    #[test]
    fn exclusive_policy_is_reentrant_within_one_manager() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(
            temp.path(),
            LockPolicy::Exclusive {
                timeout: Some(Duration::from_millis(100)),
            },
        );
        manager.load_or_create("seq").expect("first");
        manager.wipe("seq").expect("wipe under lock");
        manager.load_or_create("seq").expect("second");

        let other = EnvironmentManager::new(
            temp.path(),
            LockPolicy::Exclusive {
                timeout: Some(Duration::from_millis(100)),
            },
        );
        let err = other.load_or_create("seq").unwrap_err();
        assert!(matches!(err, SeqstateError::LockTimeout { .. }));
    }
}
