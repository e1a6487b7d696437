//! What a reconstructed environment must contain

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use modelpack_core::manifest::{read_requirements, CONSTRAINTS_FILE};
use modelpack_core::{
    CondaEnv, ManifestError, PythonEnv, Requirement, RequirementLine, CONDA_ENV_FILE,
    PYTHON_ENV_FILE, REQUIREMENTS_FILE,
};

use super::{EnvManager, ReconstructionError, Result};

/// Interpreter and packages of a saved model, plus per-attempt overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub model_dir: PathBuf,
    pub python_version: String,
    pub build_dependencies: Vec<String>,
    /// Manifest requirements with `-r` includes expanded
    pub requirements: Vec<RequirementLine>,
    /// `requirements.txt` when the package has one
    pub requirements_file: Option<PathBuf>,
    pub conda_env_file: Option<PathBuf>,
    pub overrides: Vec<Requirement>,
}

impl EnvironmentSpec {
    /// Read the manifest of the package at `model_dir`
    ///
    /// `python_env.yaml` is preferred; older packages that only carry
    /// `conda.yaml` get their interpreter and pip block from it instead.
    pub fn from_model_dir(model_dir: &Path, overrides: &[String]) -> Result<Self> {
        if !model_dir.is_dir() {
            return Err(ReconstructionError::ModelNotFound(
                model_dir.display().to_string(),
            ));
        }

        let overrides = parse_overrides(overrides)?;

        let python_env_path = model_dir.join(PYTHON_ENV_FILE);
        let conda_path = model_dir.join(CONDA_ENV_FILE);
        let requirements_path = model_dir.join(REQUIREMENTS_FILE);

        let (python_env, source) = if python_env_path.is_file() {
            (PythonEnv::load(&python_env_path)?, python_env_path)
        } else if conda_path.is_file() {
            warn!(
                "{} has no {}, deriving it from {}",
                model_dir.display(),
                PYTHON_ENV_FILE,
                CONDA_ENV_FILE
            );
            let conda = CondaEnv::load(&conda_path)?;
            (PythonEnv::from_conda_env(&conda, &conda_path)?, conda_path.clone())
        } else {
            return Err(ReconstructionError::MissingManifest(
                model_dir.display().to_string(),
            ));
        };

        let requirements = expand_dependencies(&python_env.dependencies, model_dir, &source)?;
        debug!(
            "Read {} requirements for python {} from {}",
            requirements.len(),
            python_env.python,
            source.display()
        );

        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            python_version: python_env.python,
            build_dependencies: python_env.build_dependencies,
            requirements,
            requirements_file: requirements_path.is_file().then_some(requirements_path),
            conda_env_file: conda_path.is_file().then_some(conda_path),
            overrides,
        })
    }

    /// Requirements as they will be installed: overrides replace manifest
    /// entries of the same name, new names are appended
    pub fn effective_requirements(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::with_capacity(self.requirements.len());
        let mut applied = vec![false; self.overrides.len()];

        for line in &self.requirements {
            let replacement = match line {
                RequirementLine::Requirement(req) => req.canonical_name().and_then(|name| {
                    self.overrides
                        .iter()
                        .position(|o| o.canonical_name().as_deref() == Some(name.as_str()))
                }),
                _ => None,
            };
            match replacement {
                Some(idx) => {
                    applied[idx] = true;
                    lines.push(self.overrides[idx].to_string());
                }
                None => lines.push(line.to_string()),
            }
        }

        lines.extend(
            self.overrides
                .iter()
                .zip(applied)
                .filter(|(_, used)| !used)
                .map(|(o, _)| o.to_string()),
        );
        lines
    }

    /// Stable identity of this environment for `manager`
    ///
    /// Identical manifests with identical overrides map to the same id, so
    /// a cached environment can be reused.
    pub fn fingerprint(&self, manager: EnvManager) -> Uuid {
        let mut content = format!("manager={}\npython={}\n", manager, self.python_version);
        for dep in &self.build_dependencies {
            content.push_str(&format!("build={}\n", dep));
        }
        for line in &self.requirements {
            content.push_str(&format!("req={}\n", line));
        }
        if let Ok(constraints) = fs::read_to_string(self.model_dir.join(CONSTRAINTS_FILE)) {
            content.push_str(&format!("constraints={}\n", constraints));
        }
        if manager == EnvManager::Conda {
            if let Some(conda) = self.conda_env_file.as_ref() {
                if let Ok(conda) = fs::read_to_string(conda) {
                    content.push_str(&format!("conda={}\n", conda));
                }
            }
        }
        for o in &self.overrides {
            content.push_str(&format!("override={}\n", o));
        }
        Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes())
    }

    /// Environment directory name under the environment root
    pub fn env_name(&self, manager: EnvManager) -> String {
        format!("mlflow-{}", self.fingerprint(manager).simple())
    }

    /// `3.10.12` -> `3.10`
    pub fn python_minor_version(&self) -> String {
        self.python_version
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn parse_overrides(overrides: &[String]) -> Result<Vec<Requirement>> {
    overrides
        .iter()
        .map(|input| {
            Requirement::parse(input).map_err(|source| ReconstructionError::InvalidOverride {
                input: input.clone(),
                source,
            })
        })
        .collect()
}

/// Expand `-r` entries of a `python_env.yaml` dependency list
fn expand_dependencies(
    dependencies: &[String],
    model_dir: &Path,
    source: &Path,
) -> Result<Vec<RequirementLine>> {
    let mut lines = Vec::new();
    for dep in dependencies {
        let parsed = RequirementLine::parse(dep).map_err(|err| ManifestError::Requirement {
            path: source.display().to_string(),
            source: err,
        })?;
        match parsed {
            None => {}
            Some(RequirementLine::Include(path)) => {
                lines.extend(read_requirements(&model_dir.join(path))?);
            }
            Some(line) => lines.push(line),
        }
    }
    Ok(lines)
}
