//! Exclusive per-workspace run lock.
//!
//! One run mutates one workspace at a time. The lock file lives under
//! `<state_dir>/locks/` and is named after a digest of the target path, so two
//! spellings of the same absolute path collide as expected.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

use crate::util::sha256_hex;

/// Held for the lifetime of a run; the OS lock is released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(locks_dir: &Path, target: &Path) -> Result<Self> {
        std::fs::create_dir_all(locks_dir)
            .with_context(|| format!("Failed to create lock dir {}", locks_dir.display()))?;
        let path = lock_path(locks_dir, target);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "Another run is already using workspace {} (lock: {})",
                target.display(),
                path.display()
            );
        }

        file.set_len(0).context("Failed to reset lock file")?;
        writeln!(file, "{}\n{}", std::process::id(), target.display())
            .context("Failed to write lock owner")?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(locks_dir: &Path, target: &Path) -> PathBuf {
    let digest = sha256_hex(target.to_string_lossy().as_bytes());
    locks_dir.join(format!("{}.lock", &digest[..16]))
}
