//! Tree copy and digest primitives behind snapshot and restore.
//!
//! A copy preserves regular file bytes and permissions, directories (empty
//! ones included) and symlinks, which are recreated rather than followed.
//! The digest covers exactly those properties, so two trees with the same
//! digest are interchangeable as far as a restore is concerned.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Files, directories and symlinks below the root.
    pub entries: u64,
    pub bytes: u64,
}

/// Copy `src` to `dst`. `dst` must not exist.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<TreeStats> {
    if dst.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        ));
    }
    fs::create_dir_all(dst)?;

    let mut stats = TreeStats::default();
    let mut dirs = vec![(src.to_path_buf(), dst.to_path_buf())];

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            make_symlink(&link, &target)?;
        } else if file_type.is_dir() {
            fs::create_dir(&target)?;
            dirs.push((entry.path().to_path_buf(), target));
        } else {
            // fs::copy carries permission bits over.
            stats.bytes += fs::copy(entry.path(), &target)?;
        }
        stats.entries += 1;
    }

    // Directory modes last, deepest first, so read-only dirs can still be filled.
    for (from, to) in dirs.iter().rev() {
        let perms = fs::metadata(from)?.permissions();
        fs::set_permissions(to, perms)?;
    }

    Ok(stats)
}

#[cfg(unix)]
fn make_symlink(link: &Path, at: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, at: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!(
            "cannot recreate symlink {} -> {}",
            at.display(),
            link.display()
        ),
    ))
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}

/// Stable sha256 over relative paths, entry kinds, modes, file contents and
/// link targets. The root's own mode is included.
pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let root_meta = fs::metadata(root)?;
    hasher.update(format!("root {:o}\n", mode_of(&root_meta)).as_bytes());

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .into_owned();
        let meta = fs::symlink_metadata(entry.path())?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            hasher.update(format!("link {} -> {}\n", rel, link.display()).as_bytes());
        } else if file_type.is_dir() {
            hasher.update(format!("dir {} {:o}\n", rel, mode_of(&meta)).as_bytes());
        } else {
            let contents = Sha256::digest(fs::read(entry.path())?);
            hasher.update(
                format!(
                    "file {} {:o} {}\n",
                    rel,
                    mode_of(&meta),
                    hex::encode(contents)
                )
                .as_bytes(),
            );
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Digest used for a workspace that does not exist.
pub fn absent_digest() -> String {
    hex::encode(Sha256::digest(b"absent"))
}

/// Remove whatever sits at `path`: directory tree, file or symlink.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_writable(path)?;
            fs::remove_dir_all(path)
        }
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read-only directories cannot have entries removed; open them up first.
#[cfg(unix)]
fn make_writable(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let mut perms = entry.metadata().map_err(io::Error::other)?.permissions();
            if perms.mode() & 0o700 != 0o700 {
                perms.set_mode(perms.mode() | 0o700);
                fs::set_permissions(entry.path(), perms)?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(_root: &Path) -> io::Result<()> {
    Ok(())
}
