use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::models::RequirementSet;

/// How long to wait for another process to release the lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File is locked by another user/process: {0}")]
    FileLocked(PathBuf),

    #[error("Requirement set not found: {0}")]
    NotFound(PathBuf),
}

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

/// Loads and saves a requirement set YAML file, guarded by a sibling lock
/// file so concurrent tools do not interleave writes
pub struct Storage {
    file_path: PathBuf,
    lock_file_path: PathBuf,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        let mut lock_name = file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        lock_name.push(".lock");
        let lock_file_path = file_path.with_file_name(lock_name);
        Self {
            file_path,
            lock_file_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn acquire_lock(&self, kind: LockKind) -> Result<File> {
        if let Some(parent) = self.lock_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file_path)
            .with_context(|| format!("Failed to open lock file: {:?}", self.lock_file_path))?;

        let start = std::time::Instant::now();
        loop {
            let attempt = match kind {
                LockKind::Shared => FileExt::try_lock_shared(&lock_file),
                LockKind::Exclusive => FileExt::try_lock_exclusive(&lock_file),
            };
            match attempt {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(StorageError::FileLocked(self.file_path.clone()).into());
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to acquire lock on {:?}", self.lock_file_path)
                    })
                }
            }
        }
    }

    fn read_unlocked(&self) -> Result<RequirementSet> {
        if !self.file_path.exists() {
            return Err(StorageError::NotFound(self.file_path.clone()).into());
        }
        let file = File::open(&self.file_path)
            .with_context(|| format!("Failed to open file: {:?}", self.file_path))?;
        let set: RequirementSet = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse YAML from {:?}", self.file_path))?;
        Ok(set)
    }

    fn write_unlocked(&self, set: &RequirementSet, lock_file: &mut File) -> Result<()> {
        lock_file
            .set_len(0)
            .and_then(|_| {
                writeln!(
                    lock_file,
                    "Locked by PID {} at {}",
                    std::process::id(),
                    chrono::Utc::now().to_rfc3339()
                )
            })
            .with_context(|| format!("Failed to write lock file: {:?}", self.lock_file_path))?;
        let yaml = serde_yaml::to_string(set)?;
        fs::write(&self.file_path, yaml)
            .with_context(|| format!("Failed to write {:?}", self.file_path))?;
        debug!(path = ?self.file_path, requirements = set.requirements.len(), "requirement set saved");
        Ok(())
    }

    pub fn load(&self) -> Result<RequirementSet> {
        let _lock = self.acquire_lock(LockKind::Shared)?;
        let set = self.read_unlocked()?;
        debug!(path = ?self.file_path, requirements = set.requirements.len(), "requirement set loaded");
        Ok(set)
    }

    pub fn save(&self, set: &RequirementSet) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_file = self.acquire_lock(LockKind::Exclusive)?;
        self.write_unlocked(set, &mut lock_file)
    }

    /// Reload the latest file, apply `update_fn` and save, all under one
    /// exclusive lock
    pub fn update_atomically<F>(&self, update_fn: F) -> Result<RequirementSet>
    where
        F: FnOnce(&mut RequirementSet),
    {
        let mut lock_file = self.acquire_lock(LockKind::Exclusive)?;
        let mut set = self.read_unlocked()?;
        update_fn(&mut set);
        self.write_unlocked(&set, &mut lock_file)?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Analysis, Requirement};
    use tempfile::TempDir;

    fn sample() -> RequirementSet {
        RequirementSet {
            project: "Decagon".to_string(),
            requirements: vec![
                Requirement::new("REQ-1", "Pump stop", "The pump shall stop."),
                Requirement::new("REQ-2", "Display", "The display shall show flow."),
            ],
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("reqs.yaml"));
        storage.save(&sample()).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded.project, "Decagon");
        assert_eq!(loaded.requirements.len(), 2);
        assert!(dir.path().join("reqs.yaml.lock").exists());
    }

    #[test]
    fn test_save_records_lock_owner() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("reqs.yaml"));
        storage.save(&sample()).unwrap();
        storage.update_atomically(|_| {}).unwrap();

        let owner = fs::read_to_string(dir.path().join("reqs.yaml.lock")).unwrap();
        assert!(owner.starts_with(&format!("Locked by PID {} at ", std::process::id())));
        assert_eq!(owner.lines().count(), 1);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("absent.yaml"));
        let err = storage.load().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_atomically() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("reqs.yaml"));
        storage.save(&sample()).unwrap();

        storage
            .update_atomically(|set| {
                if let Some(req) = set.get_mut("REQ-2") {
                    req.apply_analysis(Analysis::analyzed(8));
                }
            })
            .unwrap();

        let loaded = storage.load().unwrap();
        let analysis = loaded.get("REQ-2").unwrap().analysis.as_ref().unwrap();
        assert_eq!(analysis.original_quality_score, 8);
        assert!(loaded.get("REQ-1").unwrap().analysis.is_none());
    }

    #[test]
    fn test_held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("reqs.yaml"));
        storage.save(&sample()).unwrap();

        let _held = storage.acquire_lock(LockKind::Exclusive).unwrap();
        let other = Storage::new(dir.path().join("reqs.yaml"));
        let err = other.save(&sample()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::FileLocked(_))
        ));
    }
}
