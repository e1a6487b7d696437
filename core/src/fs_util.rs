//! Filesystem helpers shared by the package writers

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Atomically write content to a file
///
/// Writes to a sibling temporary file, fsyncs it, then renames it over
/// the target. The parent directory must exist.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Parent directory does not exist: {}", parent.display()),
            ));
        }
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
}

/// Recursively copy a directory tree, creating `dest`
///
/// Symlinks are followed. Entries resolving to one of `exclude` are left
/// out, which keeps a copy from descending into its own destination. A
/// symlink leading back to a directory already being copied is an error.
pub fn copy_dir_recursive(src: &Path, dest: &Path, exclude: &[PathBuf]) -> io::Result<u64> {
    let exclude: Vec<PathBuf> = exclude.iter().map(|p| resolve(p)).collect();
    copy_tree(src, dest, &exclude, &mut Vec::new())
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    exclude: &[PathBuf],
    ancestors: &mut Vec<PathBuf>,
) -> io::Result<u64> {
    let canonical = fs::canonicalize(src)?;
    if ancestors.contains(&canonical) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Directory cycle through {}", src.display()),
        ));
    }
    ancestors.push(canonical);

    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let path = entry?.path();
        let resolved = fs::canonicalize(&path)?;
        if exclude.contains(&resolved) {
            debug!("Skipping {} while copying {}", path.display(), src.display());
            continue;
        }
        let target = dest.join(path.file_name().unwrap_or_default());
        if resolved.is_dir() {
            copied += copy_tree(&path, &target, exclude, ancestors)?;
        } else {
            fs::copy(&path, &target)?;
            copied += 1;
        }
    }

    ancestors.pop();
    Ok(copied)
}

/// Absolute, symlink-free form of a path that may not exist yet
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Copy a file or directory to `dest`, leaving out `exclude`
pub fn copy_path(src: &Path, dest: &Path, exclude: &[PathBuf]) -> io::Result<u64> {
    if src.is_dir() {
        copy_dir_recursive(src, dest, exclude)
    } else {
        fs::copy(src, dest)?;
        Ok(1)
    }
}
