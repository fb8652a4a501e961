//! File-per-fact marker store for one environment.
//!
//! Each `(unit, kind)` pair is one file, `markers/<unit>.<kind>`, holding a
//! JSON [`MarkerRecord`]. Writes are durable before `put` returns.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::core::suite::validate_name;
use crate::core::types::{MarkerKind, MarkerRecord, MarkerSnapshot};
use crate::error::{IoContext, Result};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct MarkerStore {
    environment: String,
    dir: PathBuf,
}

impl MarkerStore {
    /// Open (creating if needed) the marker directory for `environment`.
    pub fn open(environment: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).io_context(|| format!("create marker dir {}", dir.display()))?;
        Ok(Self {
            environment: environment.into(),
            dir,
        })
    }

    /// Handle to a marker directory without touching the filesystem.
    pub fn at(environment: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            environment: environment.into(),
            dir: dir.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, unit: &str, kind: MarkerKind) -> PathBuf {
        self.dir.join(format!("{unit}.{kind}"))
    }

    /// Record `kind` for `unit`. Returns `false` if the marker already existed,
    /// in which case the existing file is left untouched.
    pub fn put(&self, unit: &str, kind: MarkerKind) -> Result<bool> {
        validate_name("unit", unit)?;
        let path = self.path(unit, kind);
        if self.exists(unit, kind)? {
            debug!(environment = %self.environment, unit, %kind, "marker already present");
            return Ok(false);
        }
        let record = MarkerRecord {
            unit: unit.to_string(),
            kind,
            pid: std::process::id(),
            recorded_at_ms: now_ms(),
        };
        let mut buf = serde_json::to_string(&record)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))
            .io_context(|| format!("serialize marker {}", path.display()))?;
        buf.push('\n');
        write_durable(&path, buf.as_bytes())?;
        debug!(environment = %self.environment, unit, %kind, "marker written");
        Ok(true)
    }

    pub fn exists(&self, unit: &str, kind: MarkerKind) -> Result<bool> {
        let path = self.path(unit, kind);
        path.try_exists()
            .io_context(|| format!("stat marker {}", path.display()))
    }

    /// Read a marker's record, if present.
    pub fn read(&self, unit: &str, kind: MarkerKind) -> Result<Option<MarkerRecord>> {
        let path = self.path(unit, kind);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).io_context(|| format!("read marker {}", path.display())),
        };
        let record = serde_json::from_str(&contents)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))
            .io_context(|| format!("parse marker {}", path.display()))?;
        Ok(Some(record))
    }

    /// Remove one marker; absent markers are not an error.
    pub fn remove(&self, unit: &str, kind: MarkerKind) -> Result<()> {
        let path = self.path(unit, kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.dir)?;
                debug!(environment = %self.environment, unit, %kind, "marker removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).io_context(|| format!("remove marker {}", path.display())),
        }
    }

    /// Remove every marker of this environment.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).io_context(|| format!("clear markers {}", self.dir.display()));
            }
        }
        fs::create_dir_all(&self.dir)
            .io_context(|| format!("recreate marker dir {}", self.dir.display()))?;
        debug!(environment = %self.environment, "markers cleared");
        Ok(())
    }

    /// Units with `start` but no `complete`.
    pub fn list_incomplete(&self) -> Result<BTreeSet<String>> {
        Ok(self.snapshot()?.incomplete())
    }

    /// Read every marker into memory.
    pub fn snapshot(&self) -> Result<MarkerSnapshot> {
        let mut snapshot = MarkerSnapshot::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(snapshot),
            Err(err) => {
                return Err(err).io_context(|| format!("read marker dir {}", self.dir.display()));
            }
        };
        for entry in entries {
            let entry = entry.io_context(|| format!("read marker dir {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(environment = %self.environment, file = ?name, "ignoring non-utf8 marker file");
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let Some((unit, kind)) = name
                .rsplit_once('.')
                .and_then(|(unit, raw)| MarkerKind::parse(raw).map(|kind| (unit, kind)))
            else {
                warn!(environment = %self.environment, file = name, "ignoring unrecognized marker file");
                continue;
            };
            match kind {
                MarkerKind::Start => {
                    snapshot.started.insert(unit.to_string());
                }
                MarkerKind::Complete => {
                    snapshot.completed.insert(unit.to_string());
                }
                MarkerKind::Running => {
                    // An unreadable liveness token counts as a dead process.
                    let pid = match self.read(unit, kind) {
                        Ok(Some(record)) => record.pid,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(environment = %self.environment, unit, err = %err, "unreadable running marker");
                            0
                        }
                    };
                    snapshot.running.insert(unit.to_string(), pid);
                }
            }
        }
        Ok(snapshot)
    }
}

/// Write `contents` to `path` via temp file + fsync + rename + directory fsync.
fn write_durable(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "marker path has no parent"))
        .io_context(|| format!("write marker {}", path.display()))?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);

    let mut file =
        File::create(&tmp_path).io_context(|| format!("create {}", tmp_path.display()))?;
    file.write_all(contents)
        .io_context(|| format!("write {}", tmp_path.display()))?;
    file.sync_all()
        .io_context(|| format!("sync {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path).io_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .io_context(|| format!("sync directory {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(temp: &tempfile::TempDir) -> MarkerStore {
        MarkerStore::open("seq", temp.path().join("markers")).expect("open store")
    }

    #[test]
    fn put_then_exists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);

        assert!(!store.exists("A", MarkerKind::Start).expect("exists"));
        assert!(store.put("A", MarkerKind::Start).expect("put"));
        assert!(store.exists("A", MarkerKind::Start).expect("exists"));
        assert!(!store.exists("A", MarkerKind::Complete).expect("exists"));

        let record = store.read("A", MarkerKind::Start).expect("read").expect("record");
        assert_eq!(record.unit, "A");
        assert_eq!(record.kind, MarkerKind::Start);
        assert_eq!(record.pid, std::process::id());
    }

    /// An existing marker file must survive a second `put` byte for byte.
    #[test]
    fn put_leaves_existing_marker_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.put("A", MarkerKind::Complete).expect("put");
        let path = store.path("A", MarkerKind::Complete);
        fs::write(&path, "sentinel").expect("overwrite");

        assert!(!store.put("A", MarkerKind::Complete).expect("put again"));
        assert_eq!(fs::read_to_string(&path).expect("read"), "sentinel");
    }

    #[test]
    fn list_incomplete_reports_started_without_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        for unit in ["A", "B", "C"] {
            store.put(unit, MarkerKind::Start).expect("start");
        }
        store.put("A", MarkerKind::Complete).expect("complete");

        let incomplete = store.list_incomplete().expect("list");
        assert_eq!(
            incomplete.into_iter().collect::<Vec<_>>(),
            vec!["B".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn snapshot_reads_running_pid_and_skips_strays() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.put("010_clone.v2", MarkerKind::Start).expect("start");
        store.put("010_clone.v2", MarkerKind::Running).expect("running");
        fs::write(store.dir().join("notes.txt"), "x").expect("stray");
        fs::write(store.dir().join("B.start.tmp"), "partial").expect("tmp");

        let snapshot = store.snapshot().expect("snapshot");
        assert!(snapshot.has("010_clone.v2", MarkerKind::Start));
        assert_eq!(snapshot.running.get("010_clone.v2"), Some(&std::process::id()));
        assert!(!snapshot.started.contains("B"));
        assert_eq!(snapshot.started.len(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        store.put("A", MarkerKind::Start).expect("start");
        store.put("A", MarkerKind::Running).expect("running");

        store.remove("A", MarkerKind::Running).expect("remove");
        store.remove("A", MarkerKind::Running).expect("remove absent");
        assert!(!store.exists("A", MarkerKind::Running).expect("exists"));

        store.clear().expect("clear");
        assert!(store.snapshot().expect("snapshot").is_empty());
        assert!(store.dir().is_dir());
    }

    #[test]
    fn put_rejects_unsafe_unit_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp);
        assert!(store.put("../escape", MarkerKind::Start).is_err());
    }
}
