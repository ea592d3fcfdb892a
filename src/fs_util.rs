//! Filesystem helpers shared by the cache and phase implementations:
//! atomic promotion across possibly-different filesystems, and directory
//! removal that tolerates "already gone".

use std::fs;
use std::io;
use std::path::Path;

/// Rename `src` to `dst`. If the rename fails because they live on
/// different filesystems (`EXDEV`), fall back to copy + fsync + remove.
/// Mirrors the promotion contract in spec §6: "the implementation must
/// refuse to promote across filesystems \[directly]; fall back to copy +
/// fsync + rename."
pub fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => copy_then_remove(src, dst),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV on Linux/macOS
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    17 // ERROR_NOT_SAME_DEVICE family differs; best-effort fallback trigger
}

fn copy_then_remove(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst)?;
    let file = fs::File::open(dst)?;
    file.sync_all()?;
    if let Some(parent) = dst.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    fs::remove_file(src)
}

/// Move a directory tree to a new location, same cross-filesystem fallback
/// as `move_file_atomic`. Used to promote `entry/install` to `asset/` and
/// `stage/` to `install/` (spec §3, §4.7).
pub fn move_dir_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            copy_dir_recursive(src, dst)?;
            remove_dir_if_exists(src)
        }
        Err(e) => Err(e),
    }
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            fs::copy(entry.path(), &dst_path)?;
        }
    }
    if let Ok(dir) = fs::File::open(dst) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Remove a directory tree if it exists; a no-op if it is already absent.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// True if the directory exists and contains at least one entry.
pub fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut it| it.next().is_some())
        .unwrap_or(false)
}
