//! File system utilities for conversion.
//!
//! Provides safe file operations with automatic directory creation,
//! symlink preservation, and path-aware error handling.

use crate::converter::error::{Error, ErrorExt, Result};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Creates all of the directories of the specified path, erasing it first if specified.
pub async fn create_dir_all(path: &Path, erase: bool) -> Result<()> {
    if erase {
        remove_dir_all(path).await?;
    }
    fs::create_dir_all(path)
        .await
        .fs_context("creating directory", path)
}

/// Removes the directory and its contents if it exists.
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).await.is_ok() {
        fs::remove_dir_all(path)
            .await
            .fs_context("removing directory", path)
    } else {
        Ok(())
    }
}

/// Makes a symbolic link.
#[cfg(unix)]
pub fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

/// Makes a symbolic link.
#[cfg(windows)]
pub fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        std::os::windows::fs::symlink_dir(src, dst)
    } else {
        std::os::windows::fs::symlink_file(src, dst)
    }
}

/// Copies a regular file from one path to another, creating any parent
/// directories of the destination path as necessary.
///
/// Fails if the source path is a directory or doesn't exist.
pub async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if !from.is_file() {
        return Err(Error::GenericError(format!("{from:?} is not a file")));
    }
    if let Some(dest_dir) = to.parent() {
        fs::create_dir_all(dest_dir)
            .await
            .fs_context("creating directory", dest_dir)?;
    }
    fs::copy(from, to).await.fs_context("copying file", to)?;
    Ok(())
}

/// Recursively copies a directory from one path to another, creating any
/// parent directories of the destination path as necessary.
///
/// Preserves symlinks (without following them) and file permissions.
/// Fails if the source path is not a directory.
pub async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        return Err(Error::GenericError(format!("{from:?} is not a directory")));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .await
            .fs_context("creating directory", parent)?;
    }

    for entry in walkdir::WalkDir::new(from) {
        let entry = entry?;
        debug_assert!(entry.path().starts_with(from));
        let rel_path = entry.path().strip_prefix(from)?;
        let dest_path = to.join(rel_path);

        if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())
                .await
                .fs_context("reading symlink", entry.path())?;
            symlink(&target, &dest_path).fs_context("creating symlink", &dest_path)?;
        } else if entry.file_type().is_dir() {
            fs::create_dir_all(&dest_path)
                .await
                .fs_context("creating directory", &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)
                .await
                .fs_context("copying file", &dest_path)?;
        }
    }

    Ok(())
}

/// Replaces `to` with a full copy of `from`.
pub async fn replace_dir(from: &Path, to: &Path) -> Result<()> {
    remove_dir_all(to).await?;
    copy_dir(from, to).await
}

/// Moves the directory `staged` to `target` by rename, first moving any
/// existing `target` to `backup`. The previous tree is restored if the move
/// fails and removed once it succeeds. All three paths must share a
/// filesystem.
pub async fn swap_dir(staged: &Path, target: &Path, backup: &Path) -> Result<()> {
    let had_previous = fs::symlink_metadata(target).await.is_ok();
    if had_previous {
        fs::rename(target, backup)
            .await
            .fs_context("moving previous install aside", target)?;
    }

    let moved = fs::rename(staged, target).await;
    if moved.is_err()
        && had_previous
        && let Err(e) = fs::rename(backup, target).await
    {
        log::error!(
            "Could not restore {} from {}: {}",
            target.display(),
            backup.display(),
            e
        );
    }
    moved.fs_context("moving new install into place", target)?;

    if had_previous && let Err(e) = remove_dir_all(backup).await {
        log::warn!("Previous install left at {}: {}", backup.display(), e);
    }
    Ok(())
}

/// Marks a file executable (`0755`). No-op on non-unix platforms.
pub async fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .fs_context("setting permissions", path)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Expands a leading `~/` against the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Returns true if the directory exists and has no entries.
pub fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
