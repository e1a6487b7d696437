//! Dependency manifest
//!
//! The manifest is the set of files describing a packaged model's runtime:
//! `python_env.yaml`, `requirements.txt` and `conda.yaml`. All three are
//! rendered from one [`DependencyManifest`]; in particular the pip block of
//! `conda.yaml` and `requirements.txt` come from the same list.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::fs_util::write_atomic;
use crate::requirement::{Requirement, RequirementError, RequirementLine};

pub const PYTHON_ENV_FILE: &str = "python_env.yaml";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const CONDA_ENV_FILE: &str = "conda.yaml";
pub const CONSTRAINTS_FILE: &str = "constraints.txt";

pub const DEFAULT_CONDA_ENV_NAME: &str = "mlflow-env";
pub const DEFAULT_CONDA_CHANNEL: &str = "conda-forge";

/// Build tooling pinned in `python_env.yaml`
pub const BUILD_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} does not declare a python version")]
    MissingPythonVersion(String),

    #[error("Invalid requirement in {path}: {source}")]
    Requirement {
        path: String,
        #[source]
        source: RequirementError,
    },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Contents of `python_env.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonEnv {
    pub python: String,
    #[serde(default)]
    pub build_dependencies: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PythonEnv {
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }

    /// Derive the virtualenv description from a conda environment
    ///
    /// Used for packages that predate `python_env.yaml`.
    pub fn from_conda_env(conda: &CondaEnv, source: &Path) -> Result<Self> {
        let mut python = None;
        let mut build_dependencies = Vec::new();
        for dep in &conda.dependencies {
            if let CondaDependency::Package(spec) = dep {
                let (name, constraint) = split_conda_spec(spec);
                if name == "python" {
                    python = Some(constraint.trim_start_matches('=').to_string());
                } else if BUILD_PACKAGES.contains(&name) {
                    build_dependencies.push(conda_to_pip_spec(name, constraint));
                }
            }
        }

        let python = python
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ManifestError::MissingPythonVersion(source.display().to_string()))?;

        Ok(Self {
            python,
            build_dependencies,
            dependencies: conda.pip_requirements().to_vec(),
        })
    }
}

/// One entry of a conda `dependencies` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondaDependency {
    Package(String),
    Pip { pip: Vec<String> },
}

/// Contents of `conda.yaml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondaEnv {
    #[serde(default = "default_env_name")]
    pub name: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<CondaDependency>,
}

fn default_env_name() -> String {
    DEFAULT_CONDA_ENV_NAME.to_string()
}

impl CondaEnv {
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)
    }

    /// The nested pip block, empty when absent
    pub fn pip_requirements(&self) -> &[String] {
        self.dependencies
            .iter()
            .find_map(|d| match d {
                CondaDependency::Pip { pip } => Some(pip.as_slice()),
                CondaDependency::Package(_) => None,
            })
            .unwrap_or(&[])
    }

    /// Parse the pip block into requirement lines
    pub fn pip_requirement_lines(&self, source: &Path) -> Result<Vec<RequirementLine>> {
        parse_lines(self.pip_requirements(), source)
    }
}

/// `python=3.10.12` -> (`python`, `=3.10.12`)
fn split_conda_spec(spec: &str) -> (&str, &str) {
    let idx = spec
        .find(|c: char| "=<>!~ ".contains(c))
        .unwrap_or(spec.len());
    (spec[..idx].trim(), spec[idx..].trim())
}

fn conda_to_pip_spec(name: &str, constraint: &str) -> String {
    if constraint.is_empty() {
        name.to_string()
    } else if let Some(version) = constraint.strip_prefix('=').filter(|v| !v.starts_with('=')) {
        format!("{}=={}", name, version)
    } else {
        format!("{}{}", name, constraint)
    }
}

fn parse_lines(lines: &[String], source: &Path) -> Result<Vec<RequirementLine>> {
    lines
        .iter()
        .filter_map(|line| RequirementLine::parse(line).transpose())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source_err| ManifestError::Requirement {
            path: source.display().to_string(),
            source: source_err,
        })
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ManifestError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Read `requirements.txt` of a packaged model
///
/// Nested `-r` includes are not followed; packaged manifests are flat.
pub fn read_requirements(path: &Path) -> Result<Vec<RequirementLine>> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    parse_lines(&lines, path)
}

/// The complete dependency description of a packaged model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyManifest {
    pub python_version: String,
    pub build_dependencies: Vec<Requirement>,
    pub pip_requirements: Vec<RequirementLine>,
    pub conda_channels: Vec<String>,
    pub conda_env_name: String,
    /// Conda-level packages besides python and pip
    pub conda_packages: Vec<String>,
    /// Code path references bundled under `code/`, as given at save time
    pub extra_code_paths: Vec<PathBuf>,
}

impl DependencyManifest {
    pub fn new(python_version: impl Into<String>) -> Self {
        Self {
            python_version: python_version.into(),
            build_dependencies: Vec::new(),
            pip_requirements: Vec::new(),
            conda_channels: vec![DEFAULT_CONDA_CHANNEL.to_string()],
            conda_env_name: DEFAULT_CONDA_ENV_NAME.to_string(),
            conda_packages: Vec::new(),
            extra_code_paths: Vec::new(),
        }
    }

    /// Requirement lines as written, shared by `requirements.txt` and the conda pip block
    pub fn pip_lines(&self) -> Vec<String> {
        self.pip_requirements.iter().map(ToString::to_string).collect()
    }

    pub fn requirements_txt(&self) -> String {
        self.pip_lines()
            .iter()
            .map(|line| format!("{}\n", line))
            .collect()
    }

    pub fn python_env(&self) -> PythonEnv {
        PythonEnv {
            python: self.python_version.clone(),
            build_dependencies: self
                .build_dependencies
                .iter()
                .map(ToString::to_string)
                .collect(),
            dependencies: vec![format!("-r {}", REQUIREMENTS_FILE)],
        }
    }

    /// Conda-level entries followed by the pip block
    pub fn conda_dependencies(&self) -> Vec<CondaDependency> {
        let mut deps = vec![CondaDependency::Package(format!(
            "python={}",
            self.python_version
        ))];

        let pip = self
            .build_dependencies
            .iter()
            .find(|r| r.canonical_name().as_deref() == Some("pip"));
        deps.push(CondaDependency::Package(
            match pip.and_then(|r| r.pinned_version()) {
                Some(version) => format!("pip<={}", version),
                None => "pip".to_string(),
            },
        ));

        deps.extend(
            self.conda_packages
                .iter()
                .cloned()
                .map(CondaDependency::Package),
        );
        deps.push(CondaDependency::Pip {
            pip: self.pip_lines(),
        });
        deps
    }

    pub fn conda_env(&self) -> CondaEnv {
        CondaEnv {
            name: self.conda_env_name.clone(),
            channels: self.conda_channels.clone(),
            dependencies: self.conda_dependencies(),
        }
    }

    /// Write the three manifest files into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let python_env = to_yaml(&self.python_env(), PYTHON_ENV_FILE)?;
        let conda_env = to_yaml(&self.conda_env(), CONDA_ENV_FILE)?;

        for (file, content) in [
            (PYTHON_ENV_FILE, python_env),
            (REQUIREMENTS_FILE, self.requirements_txt()),
            (CONDA_ENV_FILE, conda_env),
        ] {
            let path = dir.join(file);
            write_atomic(&path, content.as_bytes()).map_err(|source| ManifestError::Write {
                path: path.display().to_string(),
                source,
            })?;
            debug!("Wrote {}", path.display());
        }
        Ok(())
    }

    /// Human summary for logs
    pub fn summary(&self) -> String {
        format!(
            "python {} with {} pip requirements ({})",
            self.python_version,
            self.pip_requirements.len(),
            self.pip_lines().iter().take(5).join(", ")
        )
    }
}

fn to_yaml<T: Serialize>(value: &T, file: &str) -> Result<String> {
    serde_yaml::to_string(value).map_err(|source| ManifestError::Yaml {
        path: file.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> DependencyManifest {
        let mut manifest = DependencyManifest::new("3.10.12");
        manifest.build_dependencies = ["pip==23.3.1", "setuptools==68.2.2", "wheel==0.41.3"]
            .iter()
            .map(|s| Requirement::parse(s).unwrap())
            .collect();
        manifest.pip_requirements = ["mlflow==2.9.2", "scikit-learn==1.3.1"]
            .iter()
            .map(|s| RequirementLine::parse(s).unwrap().unwrap())
            .collect();
        manifest
    }

    #[test]
    fn test_requirements_txt() {
        assert_eq!(
            manifest().requirements_txt(),
            "mlflow==2.9.2\nscikit-learn==1.3.1\n"
        );
    }

    #[test]
    fn test_conda_pip_block_mirrors_requirements() {
        let manifest = manifest();
        let conda = manifest.conda_env();
        assert_eq!(conda.name, "mlflow-env");
        assert_eq!(conda.channels, vec!["conda-forge".to_string()]);
        assert_eq!(
            conda.dependencies[0],
            CondaDependency::Package("python=3.10.12".to_string())
        );
        assert_eq!(
            conda.dependencies[1],
            CondaDependency::Package("pip<=23.3.1".to_string())
        );
        let txt_lines: Vec<String> = manifest
            .requirements_txt()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(conda.pip_requirements(), txt_lines.as_slice());
    }

    #[test]
    fn test_write_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = manifest();
        manifest.write_to(temp_dir.path()).unwrap();

        let python_env = PythonEnv::load(&temp_dir.path().join(PYTHON_ENV_FILE)).unwrap();
        assert_eq!(python_env.python, "3.10.12");
        assert_eq!(
            python_env.build_dependencies,
            vec!["pip==23.3.1", "setuptools==68.2.2", "wheel==0.41.3"]
        );
        assert_eq!(python_env.dependencies, vec!["-r requirements.txt"]);

        let conda = CondaEnv::load(&temp_dir.path().join(CONDA_ENV_FILE)).unwrap();
        assert_eq!(conda, manifest.conda_env());

        let lines = read_requirements(&temp_dir.path().join(REQUIREMENTS_FILE)).unwrap();
        assert_eq!(lines, manifest.pip_requirements);
    }

    #[test]
    fn test_python_env_from_conda_env() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONDA_ENV_FILE);
        fs::write(
            &path,
            "name: legacy\nchannels:\n- conda-forge\ndependencies:\n- python=3.8.18\n- pip<=23.3.1\n- setuptools=68.2.2\n- pip:\n  - mlflow==2.9.2\n  - cloudpickle==2.2.1\n",
        )
        .unwrap();

        let conda = CondaEnv::load(&path).unwrap();
        let python_env = PythonEnv::from_conda_env(&conda, &path).unwrap();
        assert_eq!(python_env.python, "3.8.18");
        assert_eq!(
            python_env.build_dependencies,
            vec!["pip<=23.3.1", "setuptools==68.2.2"]
        );
        assert_eq!(
            python_env.dependencies,
            vec!["mlflow==2.9.2", "cloudpickle==2.2.1"]
        );
    }

    #[test]
    fn test_conda_env_without_python_is_rejected() {
        let conda = CondaEnv {
            name: "x".to_string(),
            channels: vec![],
            dependencies: vec![CondaDependency::Pip {
                pip: vec!["numpy==1.26.0".to_string()],
            }],
        };
        let result = PythonEnv::from_conda_env(&conda, Path::new("conda.yaml"));
        assert!(matches!(result, Err(ManifestError::MissingPythonVersion(_))));
    }
}
