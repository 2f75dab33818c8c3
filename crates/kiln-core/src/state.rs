//! Build State - persisted signature tables
//!
//! Loaded into memory when a build starts, written back to sled when the
//! scheduler flushes. Only the coordinating thread mutates it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::error::{EngineError, Result};
use crate::hasher::Digest;

const TASKS_TREE: &str = "tasks";
const ARTIFACTS_TREE: &str = "artifacts";
const IMPLICIT_TREE: &str = "implicit";

/// Attempts at taking the store lock a previous handle may still hold
const LOCK_ATTEMPTS: u64 = 40;

/// Cached scanner result of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitDeps {
    pub nodes: Vec<Artifact>,
    pub names: Vec<String>,
    /// Task signature without the implicit part, at scan time
    pub basis: Digest,
    /// Digest over the nodes' signatures when they were scanned
    pub digest: Digest,
}

/// Persisted tables of one build variant
pub struct BuildState {
    db: Option<sled::Db>,
    task_signatures: HashMap<Digest, Digest>,
    artifact_signatures: HashMap<Artifact, Digest>,
    implicit_deps: HashMap<Digest, ImplicitDeps>,
    changed_tasks: HashSet<Digest>,
    changed_artifacts: HashSet<Artifact>,
    changed_implicit: HashSet<Digest>,
}

impl BuildState {
    /// State that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            db: None,
            task_signatures: HashMap::new(),
            artifact_signatures: HashMap::new(),
            implicit_deps: HashMap::new(),
            changed_tasks: HashSet::new(),
            changed_artifacts: HashSet::new(),
            changed_implicit: HashSet::new(),
        }
    }

    /// Open (or create) the store at `path` and load every table
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = open_db(path)?;

        let mut state = Self::in_memory();

        for item in db.open_tree(TASKS_TREE)?.iter() {
            let (key, value) = item?;
            state
                .task_signatures
                .insert(decode_digest(&key)?, decode_digest(&value)?);
        }

        for item in db.open_tree(ARTIFACTS_TREE)?.iter() {
            let (key, value) = item?;
            let artifact = Artifact::new(String::from_utf8_lossy(&key).as_ref());
            state
                .artifact_signatures
                .insert(artifact, decode_digest(&value)?);
        }

        for item in db.open_tree(IMPLICIT_TREE)?.iter() {
            let (key, value) = item?;
            let deps: ImplicitDeps = serde_json::from_slice(&value)?;
            state.implicit_deps.insert(decode_digest(&key)?, deps);
        }

        info!(
            "Loaded build state: {} tasks, {} artifacts, {} scans",
            state.task_signatures.len(),
            state.artifact_signatures.len(),
            state.implicit_deps.len()
        );

        state.db = Some(db);
        Ok(state)
    }

    pub fn task_signature(&self, uid: &Digest) -> Option<Digest> {
        self.task_signatures.get(uid).copied()
    }

    pub fn set_task_signature(&mut self, uid: Digest, sig: Digest) {
        self.task_signatures.insert(uid, sig);
        self.changed_tasks.insert(uid);
    }

    pub fn artifact_signature(&self, artifact: &Artifact) -> Option<Digest> {
        self.artifact_signatures.get(artifact).copied()
    }

    pub fn set_artifact_signature(&mut self, artifact: Artifact, sig: Digest) {
        self.changed_artifacts.insert(artifact.clone());
        self.artifact_signatures.insert(artifact, sig);
    }

    pub fn implicit_deps(&self, uid: &Digest) -> Option<&ImplicitDeps> {
        self.implicit_deps.get(uid)
    }

    pub fn set_implicit_deps(&mut self, uid: Digest, deps: ImplicitDeps) {
        self.implicit_deps.insert(uid, deps);
        self.changed_implicit.insert(uid);
    }

    pub fn remove_implicit_deps(&mut self, uid: &Digest) -> Option<ImplicitDeps> {
        self.changed_implicit.insert(*uid);
        self.implicit_deps.remove(uid)
    }

    /// Read-only view of the artifact table
    pub fn artifact_signatures(&self) -> &HashMap<Artifact, Digest> {
        &self.artifact_signatures
    }

    pub fn is_dirty(&self) -> bool {
        !(self.changed_tasks.is_empty()
            && self.changed_artifacts.is_empty()
            && self.changed_implicit.is_empty())
    }

    /// Write changed entries back; a no-op for in-memory state
    pub fn flush(&mut self) -> Result<()> {
        if self.db.is_none() {
            self.clear_changes();
            return Ok(());
        }
        if !self.is_dirty() {
            return Ok(());
        }
        let Some(db) = &self.db else {
            return Ok(());
        };

        let mut batch = sled::Batch::default();
        for uid in &self.changed_tasks {
            if let Some(sig) = self.task_signatures.get(uid) {
                batch.insert(uid.as_bytes().as_slice(), sig.as_bytes().as_slice());
            }
        }
        db.open_tree(TASKS_TREE)?.apply_batch(batch)?;

        let mut batch = sled::Batch::default();
        for artifact in &self.changed_artifacts {
            if let Some(sig) = self.artifact_signatures.get(artifact) {
                batch.insert(artifact.as_str().as_bytes(), sig.as_bytes().as_slice());
            }
        }
        db.open_tree(ARTIFACTS_TREE)?.apply_batch(batch)?;

        let mut batch = sled::Batch::default();
        for uid in &self.changed_implicit {
            match self.implicit_deps.get(uid) {
                Some(deps) => batch.insert(uid.as_bytes().as_slice(), serde_json::to_vec(deps)?),
                None => batch.remove(uid.as_bytes().as_slice()),
            }
        }
        db.open_tree(IMPLICIT_TREE)?.apply_batch(batch)?;

        db.flush()?;
        debug!(
            "Flushed build state: {} tasks, {} artifacts, {} scans",
            self.changed_tasks.len(),
            self.changed_artifacts.len(),
            self.changed_implicit.len()
        );
        self.clear_changes();
        Ok(())
    }

    fn clear_changes(&mut self) {
        self.changed_tasks.clear();
        self.changed_artifacts.clear();
        self.changed_implicit.clear();
    }
}

/// sled releases its file lock in the background after the last handle drops
fn open_db(path: &Path) -> Result<sled::Db> {
    let mut attempt = 1;
    loop {
        match sled::open(path) {
            Err(sled::Error::Io(e)) if attempt < LOCK_ATTEMPTS && is_lock_contention(&e) => {
                debug!("{} is locked, retrying (attempt {})", path.display(), attempt);
                std::thread::sleep(Duration::from_millis(10 * attempt));
                attempt += 1;
            }
            other => return Ok(other?),
        }
    }
}

fn is_lock_contention(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock || e.to_string().contains("could not acquire lock")
}

fn decode_digest(bytes: &[u8]) -> Result<Digest> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EngineError::State(format!("corrupt digest of {} bytes", bytes.len())))?;
    Ok(Digest(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uid = Digest::of(b"task");
        let sig = Digest::of(b"sig");
        let scan_uid = Digest::of(b"scanned");

        {
            let mut state = BuildState::open(dir.path()).unwrap();
            state.set_task_signature(uid, sig);
            state.set_artifact_signature(Artifact::new("out/a.o"), sig);
            state.set_implicit_deps(
                scan_uid,
                ImplicitDeps {
                    nodes: vec![Artifact::new("a.h")],
                    names: vec!["missing.h".into()],
                    basis: uid,
                    digest: sig,
                },
            );
            assert!(state.is_dirty());
            state.flush().unwrap();
            assert!(!state.is_dirty());
        }

        let mut state = BuildState::open(dir.path()).unwrap();
        assert_eq!(state.task_signature(&uid), Some(sig));
        assert_eq!(state.artifact_signature(&Artifact::new("out/a.o")), Some(sig));
        assert_eq!(
            state.implicit_deps(&scan_uid).unwrap().names,
            vec!["missing.h".to_string()]
        );

        state.remove_implicit_deps(&scan_uid);
        state.flush().unwrap();
        drop(state);

        let state = BuildState::open(dir.path()).unwrap();
        assert!(state.implicit_deps(&scan_uid).is_none());
        assert_eq!(state.task_signature(&uid), Some(sig));
    }

    #[test]
    fn test_open_waits_for_previous_handle() {
        let dir = tempfile::tempdir().unwrap();
        let uid = Digest::of(b"task");
        let mut first = BuildState::open(dir.path()).unwrap();
        first.set_task_signature(uid, Digest::of(b"sig"));
        first.flush().unwrap();

        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(first);
        });
        let second = BuildState::open(dir.path()).unwrap();
        holder.join().unwrap();
        assert_eq!(second.task_signature(&uid), Some(Digest::of(b"sig")));
    }

    #[test]
    fn test_in_memory_flush_is_noop() {
        let mut state = BuildState::in_memory();
        state.set_task_signature(Digest::of(b"a"), Digest::of(b"b"));
        state.flush().unwrap();
        assert!(!state.is_dirty());
        assert_eq!(state.task_signature(&Digest::of(b"a")), Some(Digest::of(b"b")));
    }
}
