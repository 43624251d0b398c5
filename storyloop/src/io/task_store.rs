//! Task set persistence: file locking, atomic writes and validation.
//!
//! Readers take a shared lock on `<file>.lock`, writers an exclusive one, each
//! covering the whole read-validate or validate-write-rename sequence. Writes go
//! to a temp file in the same directory and are renamed over the target, so a
//! reader never observes a half-written document.
//!
//! The agent edits the same file without taking the lock. Callers must reload
//! after every dispatch instead of trusting an in-memory copy.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::{Builder, PersistError};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::invariants::validate_task_set;
use crate::core::schema::task_set_errors;
use crate::error::{LockMode, StoreError, ValidationError};
use crate::io::lock::{self, LockOptions, lock_path_for};
use crate::task_set::TaskSet;

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    options: LockOptions,
    cancel: CancelToken,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>, options: LockOptions, cancel: CancelToken) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            options,
            cancel,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load, parse and validate the task set under a shared lock.
    ///
    /// Parse failures are returned as [`StoreError::Parse`] carrying the raw
    /// document; no repair is attempted here.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<TaskSet, StoreError> {
        let _guard = self.lock(LockMode::Shared)?;
        let raw = self.read_unlocked()?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
            raw: raw.clone(),
        })?;
        let set = check_document(value)?;
        debug!(version = set.version, tasks = set.tasks.len(), "task set loaded");
        Ok(set)
    }

    /// Read the document verbatim under a shared lock.
    pub fn read_raw(&self) -> Result<String, StoreError> {
        let _guard = self.lock(LockMode::Shared)?;
        self.read_unlocked()
    }

    /// Validate and atomically persist `set`, returning the version written.
    ///
    /// The written version is one past the larger of the on-disk version and
    /// `set.version`. Saves are last-writer-wins: a stale `set` overwrites a
    /// newer document rather than failing.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn save(&self, set: &TaskSet) -> Result<u64, StoreError> {
        let value = serde_json::to_value(set).map_err(|err| {
            StoreError::io("serialize task set", &self.path, io::Error::other(err))
        })?;
        check_document(value)?;

        let _guard = self.lock(LockMode::Exclusive)?;
        let on_disk = self.read_version_unlocked();
        let base = on_disk.map_or(set.version, |disk| disk.max(set.version));
        if let Some(disk) = on_disk
            && disk > set.version
        {
            warn!(
                on_disk = disk,
                in_memory = set.version,
                "saving over a newer document (last writer wins)"
            );
        }

        let mut next = set.clone();
        next.version = base + 1;
        let mut payload = serde_json::to_string_pretty(&next).map_err(|err| {
            StoreError::io("serialize task set", &self.path, io::Error::other(err))
        })?;
        payload.push('\n');
        self.write_atomic(&payload)?;
        info!(version = next.version, "task set saved");
        Ok(next.version)
    }

    /// Replace the document with `raw` after checking that it parses and
    /// validates. Used to apply an agent-repaired document.
    pub fn write_raw(&self, raw: &str) -> Result<TaskSet, StoreError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
            raw: raw.to_string(),
        })?;
        let set = check_document(value)?;
        let _guard = self.lock(LockMode::Exclusive)?;
        let mut payload = raw.trim_end().to_string();
        payload.push('\n');
        self.write_atomic(&payload)?;
        Ok(set)
    }

    /// Remove the document. Succeeds if it is already gone.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn delete(&self) -> Result<(), StoreError> {
        let _guard = self.lock(LockMode::Exclusive)?;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("task set deleted");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("task set already absent");
                Ok(())
            }
            Err(err) => Err(StoreError::io("delete", &self.path, err)),
        }
    }

    fn lock(&self, mode: LockMode) -> Result<lock::LockGuard, StoreError> {
        lock::acquire(&self.lock_path, mode, self.options, &self.cancel)
    }

    fn read_unlocked(&self) -> Result<String, StoreError> {
        fs::read_to_string(&self.path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    path: self.path.clone(),
                }
            } else {
                StoreError::io("read", &self.path, err)
            }
        })
    }

    fn read_version_unlocked(&self) -> Option<u64> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let value: Value = serde_json::from_str(&raw).ok()?;
        value.get("version")?.as_u64()
    }

    fn write_atomic(&self, payload: &str) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|err| StoreError::io("create dir", &dir, err))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tasks".to_string());
        let mut tmp = Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|err| StoreError::io("create temp file", &dir, err))?;
        tmp.write_all(payload.as_bytes())
            .map_err(|err| StoreError::io("write temp file", tmp.path(), err))?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| StoreError::io("sync temp file", tmp.path(), err))?;
        set_owner_only(tmp.path())?;

        tmp.persist(&self.path).map_err(|PersistError { error, file }| {
            // Dropping the handle deletes the temp file.
            drop(file);
            StoreError::io("rename", &self.path, error)
        })?;
        Ok(())
    }
}

/// Schema check, typed decode, then invariants. Shared by load and save.
fn check_document(value: Value) -> Result<TaskSet, StoreError> {
    let schema_errors = task_set_errors(&value);
    if !schema_errors.is_empty() {
        return Err(ValidationError::new("document", schema_errors.join("; ")).into());
    }
    let set: TaskSet = serde_json::from_value(value)
        .map_err(|err| ValidationError::new("document", err.to_string()))?;
    validate_task_set(&set)?;
    Ok(set)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|err| StoreError::io("set permissions", path, err))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_set};

    fn store_in(dir: &Path) -> TaskStore {
        TaskStore::new(
            dir.join("prd.json"),
            LockOptions::default(),
            CancelToken::new(),
        )
    }

    #[test]
    fn save_then_load_increments_version_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let mut set = task_set(vec![task("a", 1), task("b", 0)]);
        set.context = Some("shared notes".to_string());
        set.branch_name = Some("feature/demo".to_string());

        let version = store.save(&set).expect("save");
        assert_eq!(version, set.version + 1);

        let loaded = store.load().expect("load");
        let mut expected = set.clone();
        expected.version += 1;
        assert_eq!(loaded, expected);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store_in(temp.path()).load().unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn load_reports_parse_error_with_raw_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        fs::write(store.path(), "{\"version\": 1,").expect("write");

        match store.load().unwrap_err() {
            StoreError::Parse { raw, message, .. } => {
                assert_eq!(raw, "{\"version\": 1,");
                assert!(!message.is_empty());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_negative_priority() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let mut value = serde_json::to_value(task_set(vec![task("a", 0)])).expect("value");
        value["stories"][0]["priority"] = serde_json::json!(-4);
        fs::write(store.path(), value.to_string()).expect("write");

        match store.load().unwrap_err() {
            StoreError::Validation(err) => assert_eq!(err.field, "stories[0].priority"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let set = task_set(vec![task("dup", 0), task("dup", 1)]);
        fs::write(
            store.path(),
            serde_json::to_string(&set).expect("serialize"),
        )
        .expect("write");

        match store.load().unwrap_err() {
            StoreError::Validation(err) => {
                assert_eq!(err.field, "stories[1].id");
                assert!(err.message.contains("dup"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn save_refuses_invalid_state_and_leaves_file_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let good = task_set(vec![task("a", 0)]);
        store.save(&good).expect("save");
        let before = fs::read_to_string(store.path()).expect("read");

        let mut bad = good.clone();
        bad.tasks[0].retry_count = -1;
        let err = store.save(&bad).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref v) if v.field == "stories[0].retry_count"));
        assert_eq!(fs::read_to_string(store.path()).expect("read"), before);
    }

    #[test]
    fn save_uses_newer_on_disk_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let set = task_set(vec![task("a", 0)]);
        store.save(&set).expect("save 1");
        store.save(&set).expect("save 2");
        let version = store.save(&set).expect("save 3");
        assert_eq!(version, 3);
        assert_eq!(store.load().expect("load").version, 3);
    }

    #[cfg(unix)]
    #[test]
    fn save_writes_owner_only_file_without_leftover_temp_files() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.save(&task_set(vec![task("a", 0)])).expect("save");

        let mode = fs::metadata(store.path()).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_rename_removes_the_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        fs::create_dir(store.path()).expect("dir at target");
        fs::write(store.path().join("keep"), "x").expect("fill dir");

        let err = store.save(&task_set(vec![task("a", 0)])).unwrap_err();

        assert!(
            matches!(err, StoreError::Io { action: "rename", .. }),
            "unexpected error: {err}"
        );
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }

    #[test]
    fn delete_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.save(&task_set(vec![task("a", 0)])).expect("save");
        assert!(store.exists());
        store.delete().expect("delete");
        assert!(!store.exists());
        store.delete().expect("delete again");
    }

    #[test]
    fn write_raw_rejects_unparseable_repair() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        fs::write(store.path(), "garbage").expect("write");
        let err = store.write_raw("still garbage").unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
        assert_eq!(fs::read_to_string(store.path()).expect("read"), "garbage");
    }

    #[test]
    fn save_times_out_while_lock_is_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let options = LockOptions {
            timeout: std::time::Duration::from_millis(100),
            poll_interval: std::time::Duration::from_millis(10),
        };
        let store = TaskStore::new(temp.path().join("prd.json"), options, CancelToken::new());
        let _held = lock::acquire(
            store.lock_path(),
            LockMode::Shared,
            options,
            &CancelToken::new(),
        )
        .expect("hold shared");

        let err = store.save(&task_set(vec![task("a", 0)])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::LockTimeout {
                mode: LockMode::Exclusive,
                ..
            }
        ));
    }
}
