//! Workspace sandboxing: snapshot before mutation, restore on failure,
//! policy-gated command execution in between.
//!
//! Layout under the snapshot root:
//!
//! ```text
//! <root>/<run_id>/snapshot.json   metadata, kept as a tombstone after discard
//! <root>/<run_id>/tree/           isolated copy of the workspace
//! ```

pub mod policy;
pub mod runner;
pub mod snapshot;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::SandboxError;
use crate::util::write_atomic;

pub use policy::{PolicyDecision, apply_policy};
pub use runner::{CommandOutcome, CommandRecord, CommandRunner};

/// What the workspace looked like when the snapshot was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// The target existed and was copied.
    Existing,
    /// The target did not exist; rolling back means removing it.
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub run_id: String,
    pub target_path: PathBuf,
    pub origin: SnapshotOrigin,
    pub digest: String,
    pub entries: u64,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// A snapshot is live until it has been restored or discarded.
    pub fn is_live(&self) -> bool {
        self.restored_at.is_none() && self.discarded_at.is_none()
    }
}

/// Sole owner of snapshots. Cheap to clone; state lives on disk.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    root: PathBuf,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn meta_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("snapshot.json")
    }

    fn tree_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("tree")
    }

    /// Copy `target` into an isolated location and verify the copy.
    ///
    /// Fail-closed: on any error nothing is left behind and the caller must
    /// not mutate the workspace.
    pub fn snapshot(&self, run_id: &str, target: &Path) -> Result<Snapshot, SandboxError> {
        let fail = |reason: String| SandboxError::Snapshot {
            run_id: run_id.to_string(),
            target: target.to_path_buf(),
            reason,
        };

        if self.meta_path(run_id).exists() {
            return Err(fail("a snapshot for this run already exists".to_string()));
        }
        let run_dir = self.run_dir(run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| {
            fail(format!(
                "cannot create isolated location {}: {}",
                run_dir.display(),
                e
            ))
        })?;

        let result = self.capture(run_id, target);
        match result {
            Ok(snapshot) => {
                info!(
                    run_id,
                    target = %target.display(),
                    origin = ?snapshot.origin,
                    entries = snapshot.entries,
                    bytes = snapshot.bytes,
                    "Snapshot created"
                );
                Ok(snapshot)
            }
            Err(reason) => {
                if let Err(e) = snapshot::remove_path(&run_dir) {
                    warn!(run_id, error = %e, "Failed to clean up partial snapshot");
                }
                Err(fail(reason))
            }
        }
    }

    fn capture(&self, run_id: &str, target: &Path) -> Result<Snapshot, String> {
        let tree = self.tree_path(run_id);
        let (origin, digest, stats) = match std::fs::symlink_metadata(target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
                SnapshotOrigin::Absent,
                snapshot::absent_digest(),
                snapshot::TreeStats::default(),
            ),
            Err(e) => return Err(format!("target is unreadable: {}", e)),
            Ok(meta) if !meta.is_dir() => {
                return Err("target exists but is not a directory".to_string());
            }
            Ok(_) => {
                let source_digest = snapshot::tree_digest(target)
                    .map_err(|e| format!("target is unreadable: {}", e))?;
                let stats = snapshot::copy_tree(target, &tree)
                    .map_err(|e| format!("copy failed: {}", e))?;
                let copy_digest = snapshot::tree_digest(&tree)
                    .map_err(|e| format!("copy is unreadable: {}", e))?;
                if copy_digest != source_digest {
                    return Err(format!(
                        "copy digest {} does not match source digest {}",
                        copy_digest, source_digest
                    ));
                }
                (SnapshotOrigin::Existing, source_digest, stats)
            }
        };

        let snapshot = Snapshot {
            run_id: run_id.to_string(),
            target_path: target.to_path_buf(),
            origin,
            digest,
            entries: stats.entries,
            bytes: stats.bytes,
            created_at: Utc::now(),
            restored_at: None,
            discarded_at: None,
        };
        self.write_meta(&snapshot)
            .map_err(|e| format!("cannot write snapshot metadata: {}", e))?;
        Ok(snapshot)
    }

    fn write_meta(&self, snapshot: &Snapshot) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        write_atomic(&self.meta_path(&snapshot.run_id), &bytes)
    }

    /// Snapshot metadata for `run_id`, including tombstones.
    pub fn load(&self, run_id: &str) -> Result<Option<Snapshot>, SandboxError> {
        let path = self.meta_path(run_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SandboxError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SandboxError::io(path, std::io::Error::other(e)))
    }

    pub fn has_live_snapshot(&self, run_id: &str) -> bool {
        matches!(self.load(run_id), Ok(Some(s)) if s.is_live())
    }

    /// Commands may only run while the workspace can still be rolled back.
    pub fn ensure_live(&self, run_id: &str) -> Result<(), SandboxError> {
        if self.has_live_snapshot(run_id) {
            Ok(())
        } else {
            Err(SandboxError::NoLiveSnapshot {
                run_id: run_id.to_string(),
            })
        }
    }

    /// Put the workspace back exactly as it was at snapshot time.
    ///
    /// A second call after a successful restore is a no-op.
    pub fn restore(&self, run_id: &str) -> Result<Snapshot, SandboxError> {
        let fail = |reason: String| SandboxError::Restore {
            run_id: run_id.to_string(),
            reason,
        };

        let mut snapshot = self
            .load(run_id)
            .map_err(|e| fail(e.to_string()))?
            .ok_or_else(|| fail("no snapshot was taken for this run".to_string()))?;
        if snapshot.restored_at.is_some() {
            debug!(run_id, "Snapshot already restored");
            return Ok(snapshot);
        }
        if snapshot.discarded_at.is_some() {
            return Err(fail("snapshot was discarded before restore".to_string()));
        }

        let target = snapshot.target_path.clone();
        let tree = self.tree_path(run_id);
        if snapshot.origin == SnapshotOrigin::Existing && !tree.is_dir() {
            return Err(fail(format!("snapshot tree {} is missing", tree.display())));
        }
        snapshot::remove_path(&target)
            .map_err(|e| fail(format!("cannot clear {}: {}", target.display(), e)))?;

        if snapshot.origin == SnapshotOrigin::Existing {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| fail(format!("cannot recreate {}: {}", parent.display(), e)))?;
            }
            snapshot::copy_tree(&tree, &target).map_err(|e| fail(format!("copy back failed: {}", e)))?;
            let digest = snapshot::tree_digest(&target)
                .map_err(|e| fail(format!("cannot verify restored tree: {}", e)))?;
            if digest != snapshot.digest {
                return Err(fail(format!(
                    "restored digest {} does not match snapshot digest {}",
                    digest, snapshot.digest
                )));
            }
        }

        snapshot.restored_at = Some(Utc::now());
        self.write_meta(&snapshot)
            .map_err(|e| fail(format!("cannot record restore: {}", e)))?;
        info!(run_id, target = %target.display(), "Workspace restored from snapshot");
        Ok(snapshot)
    }

    /// Delete the snapshot tree and keep the metadata tombstone. Safe to repeat.
    pub fn discard(&self, run_id: &str) -> Result<(), SandboxError> {
        let Some(mut snapshot) = self.load(run_id)? else {
            return Ok(());
        };
        let tree = self.tree_path(run_id);
        snapshot::remove_path(&tree).map_err(|e| SandboxError::io(&tree, e))?;
        if snapshot.discarded_at.is_none() {
            snapshot.discarded_at = Some(Utc::now());
            self.write_meta(&snapshot)
                .map_err(|e| SandboxError::io(self.meta_path(run_id), e))?;
            debug!(run_id, "Snapshot discarded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace(root: &Path) -> PathBuf {
        let target = root.join("workspace");
        fs::create_dir_all(target.join("src")).unwrap();
        fs::create_dir_all(target.join("empty")).unwrap();
        fs::write(target.join("README.md"), "# original\n").unwrap();
        fs::write(target.join("src/app.py"), "print('v1')\n").unwrap();
        target
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let before = snapshot::tree_digest(&target).unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));

        let snap = sandbox.snapshot("run-1", &target).unwrap();
        assert_eq!(snap.origin, SnapshotOrigin::Existing);
        assert_eq!(snap.digest, before);
        assert!(sandbox.has_live_snapshot("run-1"));

        fs::write(target.join("src/app.py"), "print('v2')\n").unwrap();
        fs::write(target.join("new.txt"), "junk").unwrap();
        fs::remove_dir(target.join("empty")).unwrap();

        let restored = sandbox.restore("run-1").unwrap();
        assert!(restored.restored_at.is_some());
        assert_eq!(snapshot::tree_digest(&target).unwrap(), before);
        assert!(target.join("empty").is_dir());
        assert!(!target.join("new.txt").exists());
        assert!(!sandbox.has_live_snapshot("run-1"));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &target).unwrap();

        let first = sandbox.restore("run-1").unwrap();
        // Changes after a completed restore are not touched by a repeat call.
        fs::write(target.join("after.txt"), "kept").unwrap();
        let second = sandbox.restore("run-1").unwrap();
        assert_eq!(first.restored_at, second.restored_at);
        assert!(target.join("after.txt").exists());

        sandbox.discard("run-1").unwrap();
        assert!(sandbox.restore("run-1").is_ok());
    }

    #[test]
    fn test_restore_after_discard_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &target).unwrap();
        sandbox.discard("run-1").unwrap();
        sandbox.discard("run-1").unwrap();

        assert!(!dir.path().join("snapshots/run-1/tree").exists());
        assert!(dir.path().join("snapshots/run-1/snapshot.json").exists());
        assert!(matches!(
            sandbox.restore("run-1"),
            Err(SandboxError::Restore { .. })
        ));
    }

    #[test]
    fn test_missing_tree_fails_without_touching_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &target).unwrap();
        fs::write(target.join("new.txt"), "written by the run").unwrap();
        fs::remove_dir_all(dir.path().join("snapshots/run-1/tree")).unwrap();

        assert!(matches!(
            sandbox.restore("run-1"),
            Err(SandboxError::Restore { .. })
        ));
        assert!(target.join("new.txt").exists());
        assert!(sandbox.has_live_snapshot("run-1"));
    }

    #[test]
    fn test_restore_without_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        assert!(matches!(
            sandbox.restore("run-missing"),
            Err(SandboxError::Restore { .. })
        ));
        // Discarding nothing is fine.
        sandbox.discard("run-missing").unwrap();
    }

    #[test]
    fn test_absent_target_restores_to_absent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not-yet");
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));

        let snap = sandbox.snapshot("run-1", &target).unwrap();
        assert_eq!(snap.origin, SnapshotOrigin::Absent);

        fs::create_dir_all(target.join("generated")).unwrap();
        fs::write(target.join("generated/file.txt"), "x").unwrap();
        sandbox.restore("run-1").unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_snapshot_of_file_target_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.txt");
        fs::write(&target, "not a dir").unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));

        assert!(matches!(
            sandbox.snapshot("run-1", &target),
            Err(SandboxError::Snapshot { .. })
        ));
        assert!(!dir.path().join("snapshots/run-1").exists());
        assert!(sandbox.load("run-1").unwrap().is_none());
    }

    #[test]
    fn test_second_snapshot_for_same_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &target).unwrap();
        assert!(sandbox.snapshot("run-1", &target).is_err());
        // The first snapshot is untouched.
        assert!(sandbox.has_live_snapshot("run-1"));
    }

    #[test]
    fn test_ensure_live() {
        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        assert!(matches!(
            sandbox.ensure_live("run-1"),
            Err(SandboxError::NoLiveSnapshot { .. })
        ));
        sandbox.snapshot("run-1", &target).unwrap();
        assert!(sandbox.ensure_live("run-1").is_ok());
        sandbox.discard("run-1").unwrap();
        assert!(sandbox.ensure_live("run-1").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = workspace(dir.path());
        let script = target.join("run.sh");
        fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let sandbox = SandboxManager::new(dir.path().join("snapshots"));
        sandbox.snapshot("run-1", &target).unwrap();

        fs::set_permissions(&script, fs::Permissions::from_mode(0o600)).unwrap();
        sandbox.restore("run-1").unwrap();

        let mode = fs::metadata(&script).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }
}
