//! Checkpoint directory: per-candidate locks, done markers and artifacts.
//!
//! Layout under the root:
//! - `<name>/.lock` - lock sentinel, held with an exclusive `flock` while a worker steps `name`
//! - `<name>/checkpoint.json` - artifact envelope, replaced atomically
//! - `<name>.done` - created once when `name` is fully trained, never removed
//! - `overall.lock`, `overall.json`, `overall.done` - run-wide finalization
//!
//! Lock contention is not an error: `try_lock` returns a handle whose
//! `is_locked` is false. The OS drops a lock when its holder dies.
//!
//! `status` only reads: it takes a shared lock for an instant and never
//! creates lock files, so it cannot leave a worker's claim failing.

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use fs2::FileExt;
use inctune_core::{Candidate, CandidateError, ResourceUsage};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

const LOCK_FILE: &str = ".lock";
const ARTIFACT_FILE: &str = "checkpoint.json";
const DONE_SUFFIX: &str = ".done";
const RUN_NAME: &str = "overall";
const RESERVED: &[&str] = &[RUN_NAME, "logs"];

/// A claim that meets contention is retried this often before giving up, so
/// a momentary shared lock from `status` does not read as another worker.
const CLAIM_ATTEMPTS: usize = 3;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Exclusive claim over a candidate directory or the run.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// On-disk wrapper around a candidate's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub name: String,
    pub saved_at: String,
    pub usage: ResourceUsage,
    pub score: f64,
    pub fully_trained: bool,
    /// `null` when the candidate writes its own checkpoint files.
    #[serde(default)]
    pub state: serde_json::Value,
}

/// One candidate directory as seen by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStatus {
    pub name: String,
    pub done: bool,
    pub locked: bool,
    pub has_artifact: bool,
    pub usage: Option<ResourceUsage>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub candidates: Vec<CandidateStatus>,
    pub finalized: bool,
}

/// Checkpoint directory shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `name`'s lock and artifact.
    pub fn candidate_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn done_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{DONE_SUFFIX}"))
    }

    /// Claim `name` without blocking.
    pub fn try_lock(&self, name: &str) -> Result<LockHandle, StoreError> {
        let dir = self.candidate_dir(name)?;
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;
        try_lock_file(name, dir.join(LOCK_FILE))
    }

    /// Release a lock. Handles that never acquired are ignored.
    pub fn unlock(&self, mut handle: LockHandle) -> Result<(), StoreError> {
        if let Some(file) = handle.file.take() {
            FileExt::unlock(&file).map_err(|e| StoreError::Lock(handle.path.clone(), e))?;
        }
        Ok(())
    }

    pub fn is_done(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(self.done_path(name).exists())
    }

    /// Create `name`'s done marker. Returns false if it already existed.
    pub fn mark_done(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        create_marker(&self.done_path(name))
    }

    #[must_use]
    pub fn has_artifact(&self, name: &str) -> bool {
        self.candidate_dir(name)
            .is_ok_and(|dir| dir.join(ARTIFACT_FILE).exists())
    }

    /// Persist a candidate. Self-checkpointing candidates write their own files
    /// into the candidate directory; the envelope then carries no state.
    pub fn save(
        &self,
        candidate: &mut dyn Candidate,
        usage: ResourceUsage,
    ) -> Result<(), StoreError> {
        let name = candidate.name().to_string();
        let dir = self.candidate_dir(&name)?;
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;

        let state = if let Some(own) = candidate.self_checkpointing() {
            own.save_checkpoint(&dir)?;
            serde_json::Value::Null
        } else {
            candidate.snapshot()?
        };
        let envelope = CheckpointEnvelope {
            name,
            saved_at: now_timestamp(),
            usage,
            score: candidate.score(),
            fully_trained: candidate.is_fully_trained(),
            state,
        };
        write_json_atomic(&dir.join(ARTIFACT_FILE), &envelope)
    }

    /// Read `name`'s envelope, if any.
    pub fn read_envelope(&self, name: &str) -> Result<Option<CheckpointEnvelope>, StoreError> {
        let path = self.candidate_dir(name)?.join(ARTIFACT_FILE);
        let Some(envelope) = read_json::<CheckpointEnvelope>(&path)? else {
            return Ok(None);
        };
        if envelope.name != name {
            return Err(StoreError::Mismatch(path, envelope.name));
        }
        Ok(Some(envelope))
    }

    /// Restore a candidate from its checkpoint. Returns the usage recorded with
    /// it, or `None` when there is nothing to resume from.
    pub fn load(&self, candidate: &mut dyn Candidate) -> Result<Option<ResourceUsage>, StoreError> {
        let name = candidate.name().to_string();
        let dir = self.candidate_dir(&name)?;
        let envelope = self.read_envelope(&name)?;

        if let Some(own) = candidate.self_checkpointing() {
            if !own.load_checkpoint(&dir)? {
                return Ok(None);
            }
            return Ok(Some(envelope.map(|e| e.usage).unwrap_or_default()));
        }
        match envelope {
            Some(envelope) => {
                candidate.restore(envelope.state)?;
                Ok(Some(envelope.usage))
            }
            None => Ok(None),
        }
    }

    /// Claim the run-wide finalization. Fails to lock if another worker holds
    /// it or the run is already finished.
    pub fn try_finalize_run(&self) -> Result<LockHandle, StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| StoreError::Io(self.root.clone(), e))?;
        let lock = try_lock_file(RUN_NAME, self.root.join(format!("{RUN_NAME}.lock")))?;
        if lock.is_locked() && self.is_run_done() {
            self.unlock(lock)?;
            return Ok(LockHandle {
                name: RUN_NAME.to_string(),
                path: self.root.join(format!("{RUN_NAME}.lock")),
                file: None,
            });
        }
        Ok(lock)
    }

    #[must_use]
    pub fn is_run_done(&self) -> bool {
        self.done_path(RUN_NAME).exists()
    }

    /// Write the run report, then the run-wide done marker.
    pub fn finish_run<T: Serialize>(&self, report: &T) -> Result<bool, StoreError> {
        write_json_atomic(&self.root.join(format!("{RUN_NAME}.json")), report)?;
        create_marker(&self.done_path(RUN_NAME))
    }

    pub fn read_report<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        read_json(&self.root.join(format!("{RUN_NAME}.json")))
    }

    /// Snapshot of every candidate directory under the root.
    pub fn status(&self) -> Result<StoreStatus, StoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(StoreStatus {
                    candidates: Vec::new(),
                    finalized: false,
                });
            }
            Err(e) => return Err(StoreError::Io(self.root.clone(), e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| validate_name(name).is_ok())
            .collect();
        names.sort();

        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let envelope = self.read_envelope(&name).ok().flatten();
            candidates.push(CandidateStatus {
                done: self.is_done(&name)?,
                locked: self.is_claimed(&name)?,
                has_artifact: envelope.is_some(),
                usage: envelope.as_ref().map(|e| e.usage),
                score: envelope.as_ref().map(|e| e.score),
                name,
            });
        }
        Ok(StoreStatus {
            candidates,
            finalized: self.is_run_done(),
        })
    }

    /// Whether a worker currently holds `name`.
    fn is_claimed(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.candidate_dir(name)?.join(LOCK_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::Io(path, e)),
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                FileExt::unlock(&file).map_err(|e| StoreError::Lock(path, e))?;
                Ok(false)
            }
            Err(e) if is_contention(&e) => Ok(true),
            Err(e) => Err(StoreError::Lock(path, e)),
        }
    }
}

fn try_lock_file(name: &str, path: PathBuf) -> Result<LockHandle, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| StoreError::Io(path.clone(), e))?;
    let mut attempt = 1;
    let file = loop {
        match file.try_lock_exclusive() {
            Ok(()) => break Some(file),
            Err(e) if is_contention(&e) && attempt < CLAIM_ATTEMPTS => {
                attempt += 1;
                thread::sleep(CLAIM_RETRY_DELAY);
            }
            Err(e) if is_contention(&e) => break None,
            Err(e) => return Err(StoreError::Lock(path, e)),
        }
    };
    Ok(LockHandle {
        name: name.to_string(),
        path,
        file,
    })
}

fn is_contention(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Create-once marker. `Ok(false)` when it already exists.
fn create_marker(path: &Path) -> Result<bool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::Io(path.to_path_buf(), e)),
    }
}

/// Write to a sibling temp file and rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Write(path.to_path_buf(), e.to_string()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&tmp, content).map_err(|e| StoreError::Io(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::Io(path.to_path_buf(), e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(path.to_path_buf(), e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Parse(path.to_path_buf(), e.to_string()))
}

/// Reject names that cannot serve as a candidate directory.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.ends_with(DONE_SUFFIX)
        || name.ends_with(".lock")
        || RESERVED.contains(&name);
    if bad {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Current local time, for envelopes and reports.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read/write checkpoint file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse checkpoint file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write checkpoint file {0}: {1}")]
    Write(PathBuf, String),
    #[error("invalid candidate name {0:?}")]
    InvalidName(String),
    #[error("checkpoint {0} belongs to candidate {1}")]
    Mismatch(PathBuf, String),
    #[error(transparent)]
    Candidate(#[from] CandidateError),
}

#[cfg(test)]
mod tests {
    use inctune_core::test_utils::{ScriptedCandidate, tiny_dataset};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let a = CheckpointStore::new(dir.path());
        let b = CheckpointStore::new(dir.path());

        let first = a.try_lock("knn").unwrap();
        assert!(first.is_locked());
        let second = b.try_lock("knn").unwrap();
        assert!(!second.is_locked());

        a.unlock(first).unwrap();
        b.unlock(second).unwrap();
        let third = b.try_lock("knn").unwrap();
        assert!(third.is_locked());
    }

    #[test]
    fn test_dropped_lock_is_released() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        {
            let held = store.try_lock("x").unwrap();
            assert!(held.is_locked());
        }
        assert!(store.try_lock("x").unwrap().is_locked());
    }

    #[test]
    fn test_mark_done_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(!store.is_done("a").unwrap());
        assert!(store.mark_done("a").unwrap());
        assert!(!store.mark_done("a").unwrap());
        assert!(store.is_done("a").unwrap());
        assert!(dir.path().join("a.done").exists());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let data = tiny_dataset();

        let mut trained = ScriptedCandidate::new("s", 0.7).with_steps(3);
        trained.train(&data).unwrap();
        trained.train(&data).unwrap();
        let usage = ResourceUsage::new(Duration::from_millis(40), 1024);
        store.save(&mut trained, usage).unwrap();
        assert!(store.has_artifact("s"));
        assert!(dir.path().join("s").join("checkpoint.json").exists());

        let mut fresh = ScriptedCandidate::new("s", 0.7).with_steps(3);
        let restored = store.load(&mut fresh).unwrap();
        assert_eq!(restored, Some(usage));
        assert_eq!(fresh.steps_done(), 2);

        let envelope = store.read_envelope("s").unwrap().unwrap();
        assert!(!envelope.fully_trained);
        assert!((envelope.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut fresh = ScriptedCandidate::new("nothing", 0.1);
        assert_eq!(store.load(&mut fresh).unwrap(), None);
    }

    #[test]
    fn test_self_checkpointing_delegates() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let data = tiny_dataset();

        let mut own = ScriptedCandidate::new("own", 0.4)
            .with_steps(2)
            .with_self_checkpointing();
        own.train(&data).unwrap();
        store.save(&mut own, ResourceUsage::default()).unwrap();
        assert!(
            dir.path()
                .join("own")
                .join(inctune_core::test_utils::SCRIPTED_CHECKPOINT_FILE)
                .exists()
        );
        let envelope = store.read_envelope("own").unwrap().unwrap();
        assert!(envelope.state.is_null());

        let mut fresh = ScriptedCandidate::new("own", 0.4)
            .with_steps(2)
            .with_self_checkpointing();
        assert!(store.load(&mut fresh).unwrap().is_some());
        assert_eq!(fresh.steps_done(), 1);
    }

    #[test]
    fn test_envelope_name_mismatch() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut other = ScriptedCandidate::new("other", 0.1);
        store.save(&mut other, ResourceUsage::default()).unwrap();
        std::fs::create_dir_all(dir.path().join("renamed")).unwrap();
        std::fs::copy(
            dir.path().join("other").join("checkpoint.json"),
            dir.path().join("renamed").join("checkpoint.json"),
        )
        .unwrap();
        assert!(matches!(
            store.read_envelope("renamed"),
            Err(StoreError::Mismatch(..))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for name in ["", ".", "..", "a/b", "overall", "x.done", "logs"] {
            assert!(
                matches!(store.try_lock(name), Err(StoreError::InvalidName(_))),
                "{name:?} accepted"
            );
        }
    }

    #[test]
    fn test_finalize_run_once() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let other = CheckpointStore::new(dir.path());

        let lock = store.try_finalize_run().unwrap();
        assert!(lock.is_locked());
        assert!(!other.try_finalize_run().unwrap().is_locked());

        assert!(store.finish_run(&serde_json::json!({"members": 1})).unwrap());
        store.unlock(lock).unwrap();
        assert!(store.is_run_done());
        assert!(!other.try_finalize_run().unwrap().is_locked());

        let report: serde_json::Value = store.read_report().unwrap().unwrap();
        assert_eq!(report["members"], 1);
    }

    #[test]
    fn test_status_lists_candidates() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut a = ScriptedCandidate::new("a", 0.5);
        a.train(&tiny_dataset()).unwrap();
        store.save(&mut a, ResourceUsage::default()).unwrap();
        store.mark_done("a").unwrap();
        let held = store.try_lock("b").unwrap();

        let status = CheckpointStore::new(dir.path()).status().unwrap();
        assert!(!status.finalized);
        assert_eq!(status.candidates.len(), 2);
        assert_eq!(status.candidates[0].name, "a");
        assert!(status.candidates[0].done);
        assert!(status.candidates[0].has_artifact);
        assert!(!status.candidates[0].locked);
        assert!(status.candidates[1].locked);
        assert!(!status.candidates[1].has_artifact);
        store.unlock(held).unwrap();
    }

    #[test]
    fn test_status_does_not_create_lock_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut a = ScriptedCandidate::new("a", 0.5);
        store.save(&mut a, ResourceUsage::default()).unwrap();

        let status = store.status().unwrap();
        assert!(!status.candidates[0].locked);
        assert!(!dir.path().join("a").join(LOCK_FILE).exists());
    }

    #[test]
    fn test_claim_survives_brief_shared_lock() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let held = store.try_lock("busy").unwrap();
        store.unlock(held).unwrap();

        // a reader holding a shared lock for a moment, as `status` does
        let reader = File::open(dir.path().join("busy").join(LOCK_FILE)).unwrap();
        reader.try_lock_shared().unwrap();
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            FileExt::unlock(&reader).unwrap();
        });

        let claim = store.try_lock("busy").unwrap();
        release.join().unwrap();
        assert!(claim.is_locked());
    }

    #[test]
    fn test_status_reports_claim_without_breaking_it() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let held = store.try_lock("busy").unwrap();

        for _ in 0..3 {
            let status = store.status().unwrap();
            assert!(status.candidates[0].locked);
        }
        assert!(!CheckpointStore::new(dir.path()).try_lock("busy").unwrap().is_locked());
        store.unlock(held).unwrap();
        assert!(!store.status().unwrap().candidates[0].locked);
        assert!(store.try_lock("busy").unwrap().is_locked());
    }

    #[test]
    fn test_status_of_missing_root() {
        let dir = tempdir().unwrap();
        let status = CheckpointStore::new(dir.path().join("absent"))
            .status()
            .unwrap();
        assert!(status.candidates.is_empty());
    }
}
