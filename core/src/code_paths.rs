//! Bundling of custom code paths
//!
//! Every entry lands directly under `code/` by its last path component: a
//! file `src/utils/helpers.py` becomes `code/helpers.py`, a directory
//! `src/utils` becomes `code/utils/` with its own tree intact. Parent
//! directories of an entry are not recreated.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::fs_util::copy_path;

#[derive(Error, Debug)]
pub enum CodePathError {
    #[error("Code path does not exist: {0}")]
    NotFound(String),

    #[error("Code path has no file name: {0}")]
    NoFileName(String),

    #[error("Code paths {first} and {second} would both be copied to code/{name}")]
    Conflict {
        first: String,
        second: String,
        name: String,
    },

    #[error("Failed to copy code path {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CodePathError>;

/// Check every entry exists and that no two entries collide under `code/`
///
/// Runs before anything is written.
pub fn validate_code_paths(paths: &[PathBuf]) -> Result<()> {
    let mut targets: HashMap<OsString, &Path> = HashMap::new();
    for path in paths {
        if !path.exists() {
            return Err(CodePathError::NotFound(path.display().to_string()));
        }
        let name = target_name(path)?;
        if let Some(first) = targets.insert(name.clone(), path) {
            return Err(CodePathError::Conflict {
                first: first.display().to_string(),
                second: path.display().to_string(),
                name: name.to_string_lossy().into_owned(),
            });
        }
    }
    Ok(())
}

/// Last path component, resolving `.`/`..` style references first
fn target_name(path: &Path) -> Result<OsString> {
    if let Some(name) = path.file_name() {
        return Ok(name.to_os_string());
    }
    std::fs::canonicalize(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        .ok_or_else(|| CodePathError::NoFileName(path.display().to_string()))
}

/// Copy validated code paths into `code_dir`, returning the bundled names
///
/// Anything under an entry that resolves to one of `exclude` is skipped.
pub fn copy_code_paths(
    paths: &[PathBuf],
    code_dir: &Path,
    exclude: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    validate_code_paths(paths)?;
    std::fs::create_dir_all(code_dir).map_err(|source| CodePathError::Copy {
        path: code_dir.display().to_string(),
        source,
    })?;

    let mut bundled = Vec::with_capacity(paths.len());
    for path in paths {
        let name = target_name(path)?;
        let dest = code_dir.join(&name);
        let files = copy_path(path, &dest, exclude).map_err(|source| CodePathError::Copy {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Bundled {} ({} files) as code/{}", path.display(), files, name.to_string_lossy());
        bundled.push(PathBuf::from(name));
    }
    Ok(bundled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_is_flattened() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("src").join("utils");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("helpers.py"), "def f(): pass").unwrap();

        let code_dir = temp_dir.path().join("out").join("code");
        let bundled = copy_code_paths(&[nested.join("helpers.py")], &code_dir, &[]).unwrap();

        assert_eq!(bundled, vec![PathBuf::from("helpers.py")]);
        assert!(code_dir.join("helpers.py").is_file());
        assert!(!code_dir.join("src").exists());
    }

    #[test]
    fn test_directory_keeps_structure() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = temp_dir.path().join("src").join("mypkg");
        fs::create_dir_all(pkg.join("sub")).unwrap();
        fs::write(pkg.join("__init__.py"), "").unwrap();
        fs::write(pkg.join("sub").join("mod.py"), "x = 1").unwrap();

        let code_dir = temp_dir.path().join("code");
        copy_code_paths(&[pkg], &code_dir, &[]).unwrap();

        assert!(code_dir.join("mypkg").join("__init__.py").is_file());
        assert!(code_dir.join("mypkg").join("sub").join("mod.py").is_file());
        assert!(!code_dir.join("src").exists());
    }

    #[test]
    fn test_missing_path_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = validate_code_paths(&[temp_dir.path().join("nope.py")]);
        assert!(matches!(result, Err(CodePathError::NotFound(_))));
    }

    #[test]
    fn test_conflicting_names_rejected() {
        let temp_dir = TempDir::new().unwrap();
        for dir in ["a", "b"] {
            fs::create_dir_all(temp_dir.path().join(dir)).unwrap();
            fs::write(temp_dir.path().join(dir).join("utils.py"), "").unwrap();
        }
        let result = validate_code_paths(&[
            temp_dir.path().join("a").join("utils.py"),
            temp_dir.path().join("b").join("utils.py"),
        ]);
        assert!(matches!(result, Err(CodePathError::Conflict { .. })));
    }
}
