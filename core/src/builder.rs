//! Dependency Manifest Builder
//!
//! Saves a model artifact as a self-describing package: the artifact, an
//! `MLmodel` descriptor, bundled code, an optional input example and the
//! dependency manifest. Everything is assembled in a staging directory next
//! to the destination and moved into place only once complete, so a failed
//! save never leaves a partial package behind.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::code_paths::{copy_code_paths, validate_code_paths, CodePathError};
use crate::descriptor::{DescriptorInputs, ModelDescriptor, CODE_DIR, INPUT_EXAMPLE_FILE};
use crate::flavor::Flavor;
use crate::fs_util::{copy_path, write_atomic};
use crate::inference::{infer_requirements, MLFLOW_PACKAGE};
use crate::manifest::{
    CondaDependency, CondaEnv, DependencyManifest, ManifestError, BUILD_PACKAGES,
    CONSTRAINTS_FILE, DEFAULT_CONDA_CHANNEL, DEFAULT_CONDA_ENV_NAME,
};
use crate::probe::{PackageProbe, RuntimeSnapshot};
use crate::requirement::{
    expand_requirement_args, Requirement, RequirementError, RequirementLine,
};

/// Errors that abort a save; none of them leave files at the destination
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Only one of pip_requirements, extra_pip_requirements and conda_env may be given ({0})")]
    ConflictingRequirements(String),

    #[error(transparent)]
    InvalidRequirement(#[from] RequirementError),

    #[error(transparent)]
    CodePath(#[from] CodePathError),

    #[error("Model artifact does not exist: {0}")]
    ModelArtifactNotFound(String),

    #[error("Constraints file does not exist: {0}")]
    ConstraintsNotFound(String),

    #[error("Output directory already exists and is not empty: {0}")]
    OutputExists(String),

    #[error("Requirement '{0}' has no pinned version and the package is not installed")]
    UnpinnedRequirement(String),

    #[error("Requirement '{requirement}' is not satisfied by installed version {installed}")]
    UnsatisfiedRequirement {
        requirement: String,
        installed: String,
    },

    #[error("Package '{0}' appears more than once in the pip requirements")]
    DuplicateRequirement(String),

    #[error("Failed to inspect the Python runtime: {0}")]
    Probe(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Failed to write model package at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write MLmodel: {0}")]
    Descriptor(String),
}

pub type Result<T> = std::result::Result<T, SaveError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SaveError + '_ {
    move |source| SaveError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// What to save and how to describe its dependencies
#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub flavor: Flavor,
    /// Serialized model file or directory
    pub model_artifact: PathBuf,
    /// Representative input; when given, `predict` is exercised during inference
    pub sample_input: Option<Value>,
    /// Full replacement list; inference is skipped
    pub pip_requirements: Option<Vec<String>>,
    /// Additive list merged over inferred requirements
    pub extra_pip_requirements: Option<Vec<String>>,
    /// User conda environment file whose pip block becomes the requirements
    pub conda_env: Option<PathBuf>,
    pub code_paths: Vec<PathBuf>,
    /// Replace an existing package at the destination
    pub overwrite: bool,
    pub metadata: BTreeMap<String, String>,
}

impl SaveOptions {
    pub fn new(flavor: Flavor, model_artifact: impl Into<PathBuf>) -> Self {
        Self {
            flavor,
            model_artifact: model_artifact.into(),
            sample_input: None,
            pip_requirements: None,
            extra_pip_requirements: None,
            conda_env: None,
            code_paths: Vec::new(),
            overwrite: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn sample_input(mut self, input: Value) -> Self {
        self.sample_input = Some(input);
        self
    }

    pub fn pip_requirements<I, S>(mut self, reqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pip_requirements = Some(reqs.into_iter().map(Into::into).collect());
        self
    }

    pub fn extra_pip_requirements<I, S>(mut self, reqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_pip_requirements = Some(reqs.into_iter().map(Into::into).collect());
        self
    }

    pub fn conda_env(mut self, path: impl Into<PathBuf>) -> Self {
        self.conda_env = Some(path.into());
        self
    }

    pub fn code_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_paths.push(path.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Where the pip requirements come from, after validation
enum RequirementSource {
    Explicit(Vec<RequirementLine>),
    Conda {
        lines: Vec<RequirementLine>,
        env: CondaEnv,
    },
    Inferred {
        extra: Vec<RequirementLine>,
    },
}

impl RequirementSource {
    fn lines_mut(&mut self) -> &mut Vec<RequirementLine> {
        match self {
            RequirementSource::Explicit(lines) => lines,
            RequirementSource::Conda { lines, .. } => lines,
            RequirementSource::Inferred { extra } => extra,
        }
    }
}

/// Validated inputs, computed before anything is written
struct Validated {
    source: RequirementSource,
    /// Contents of every referenced constraints file, concatenated
    constraints: Option<String>,
}

/// A saved model package
#[derive(Debug, Clone)]
pub struct SavedModel {
    pub path: PathBuf,
    pub manifest: DependencyManifest,
    pub descriptor: ModelDescriptor,
    /// `Some(captured)` when requirements were inferred
    pub inference_captured: Option<bool>,
}

/// Builds model packages
pub struct ModelPackager {
    probe: Box<dyn PackageProbe>,
    conda_channels: Vec<String>,
    conda_env_name: String,
}

impl ModelPackager {
    pub fn new(probe: Box<dyn PackageProbe>) -> Self {
        Self {
            probe,
            conda_channels: vec![DEFAULT_CONDA_CHANNEL.to_string()],
            conda_env_name: DEFAULT_CONDA_ENV_NAME.to_string(),
        }
    }

    pub fn with_conda_channels(mut self, channels: Vec<String>) -> Self {
        self.conda_channels = channels;
        self
    }

    pub fn with_conda_env_name(mut self, name: impl Into<String>) -> Self {
        self.conda_env_name = name.into();
        self
    }

    /// Save a model package to `output_dir`
    pub fn save(&self, output_dir: &Path, options: &SaveOptions) -> Result<SavedModel> {
        info!(
            "Saving {} model {} to {}",
            options.flavor,
            options.model_artifact.display(),
            output_dir.display()
        );

        let validated = self.validate(output_dir, options)?;
        let snapshot = self
            .probe
            .snapshot()
            .map_err(|e| SaveError::Probe(format!("{:#}", e)))?;

        let parent = match output_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(io_error(&parent))?;
        let staging = tempfile::Builder::new()
            .prefix(".modelpack-staging-")
            .tempdir_in(&parent)
            .map_err(io_error(&parent))?;
        let stage = staging.path();
        debug!("Staging package in {}", stage.display());

        let artifact_name = options
            .model_artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SaveError::ModelArtifactNotFound(options.model_artifact.display().to_string())
            })?;
        // sources may contain the package being written
        let exclude = [stage.to_path_buf(), output_dir.to_path_buf()];
        copy_path(&options.model_artifact, &stage.join(&artifact_name), &exclude)
            .map_err(io_error(&options.model_artifact))?;

        if !options.code_paths.is_empty() {
            copy_code_paths(&options.code_paths, &stage.join(CODE_DIR), &exclude)?;
        }

        let example_path = match &options.sample_input {
            Some(input) => {
                let path = stage.join(INPUT_EXAMPLE_FILE);
                let content = serde_json::to_vec_pretty(input).map_err(|e| SaveError::Io {
                    path: path.display().to_string(),
                    source: e.into(),
                })?;
                write_atomic(&path, &content).map_err(io_error(&path))?;
                Some(path)
            }
            None => None,
        };

        let python_version = match &validated.source {
            RequirementSource::Conda { env, .. } => {
                conda_python_version(env).unwrap_or_else(|| snapshot.python_version.clone())
            }
            _ => snapshot.python_version.clone(),
        };

        let descriptor = ModelDescriptor::new(DescriptorInputs {
            flavor: options.flavor,
            model_path: Some(&artifact_name),
            python_version: &python_version,
            has_code: !options.code_paths.is_empty(),
            mlflow_version: snapshot.packages.version_of(MLFLOW_PACKAGE),
            flavor_library_version: options
                .flavor
                .default_packages()
                .first()
                .and_then(|p| snapshot.packages.version_of(p)),
            has_input_example: example_path.is_some(),
            metadata: options.metadata.clone(),
        });
        descriptor
            .write(stage)
            .map_err(|e| SaveError::Descriptor(format!("{:#}", e)))?;

        let mut inference_captured = None;
        let mut conda_env = None;
        let lines = match validated.source {
            RequirementSource::Explicit(lines) => {
                info!("Using {} user-supplied pip requirements", lines.len());
                lines
            }
            RequirementSource::Conda { lines, env } => {
                conda_env = Some(env);
                lines
            }
            RequirementSource::Inferred { extra } => {
                let inferred = infer_requirements(
                    options.flavor,
                    stage,
                    example_path.as_deref(),
                    &snapshot,
                    self.probe.as_ref(),
                );
                inference_captured = Some(inferred.captured);
                merge_extra_requirements(inferred.requirements, extra)
            }
        };

        let mut pip_requirements = finalize_requirements(lines, &snapshot)?;
        if let Some(constraints) = &validated.constraints {
            let path = stage.join(CONSTRAINTS_FILE);
            write_atomic(&path, constraints.as_bytes()).map_err(io_error(&path))?;
            pip_requirements.push(RequirementLine::Constraint(PathBuf::from(CONSTRAINTS_FILE)));
        }

        let mut manifest = DependencyManifest::new(python_version);
        manifest.build_dependencies = build_dependencies(&snapshot);
        manifest.pip_requirements = pip_requirements;
        manifest.conda_channels = self.conda_channels.clone();
        manifest.conda_env_name = self.conda_env_name.clone();
        manifest.extra_code_paths = options.code_paths.clone();
        if let Some(env) = conda_env {
            apply_user_conda_env(&mut manifest, env);
        }
        manifest.write_to(stage)?;

        publish(stage, output_dir)?;
        info!("Saved model to {}: {}", output_dir.display(), manifest.summary());

        Ok(SavedModel {
            path: output_dir.to_path_buf(),
            manifest,
            descriptor,
            inference_captured,
        })
    }

    fn validate(&self, output_dir: &Path, options: &SaveOptions) -> Result<Validated> {
        let given: Vec<&str> = [
            options.pip_requirements.as_ref().map(|_| "pip_requirements"),
            options
                .extra_pip_requirements
                .as_ref()
                .map(|_| "extra_pip_requirements"),
            options.conda_env.as_ref().map(|_| "conda_env"),
        ]
        .into_iter()
        .flatten()
        .collect();
        if given.len() > 1 {
            return Err(SaveError::ConflictingRequirements(given.join(", ")));
        }

        if !options.model_artifact.exists() {
            return Err(SaveError::ModelArtifactNotFound(
                options.model_artifact.display().to_string(),
            ));
        }
        validate_code_paths(&options.code_paths)?;

        if output_dir.exists() && !options.overwrite {
            let empty = output_dir
                .read_dir()
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !empty {
                return Err(SaveError::OutputExists(output_dir.display().to_string()));
            }
        }

        let mut source = if let Some(reqs) = &options.pip_requirements {
            RequirementSource::Explicit(expand_requirement_args(reqs)?)
        } else if let Some(path) = &options.conda_env {
            let env = CondaEnv::load(path)?;
            RequirementSource::Conda {
                lines: env.pip_requirement_lines(path)?,
                env,
            }
        } else {
            let extra = match &options.extra_pip_requirements {
                Some(reqs) => expand_requirement_args(reqs)?,
                None => Vec::new(),
            };
            reject_duplicate_names(&extra)?;
            RequirementSource::Inferred { extra }
        };

        let constraints = split_constraints(source.lines_mut())?;
        Ok(Validated {
            source,
            constraints,
        })
    }
}

/// Pull `-c` references out of a line list and read their contents
fn split_constraints(lines: &mut Vec<RequirementLine>) -> Result<Option<String>> {
    let mut kept = Vec::with_capacity(lines.len());
    let mut constraints: Option<String> = None;
    for line in std::mem::take(lines) {
        match line {
            RequirementLine::Constraint(path) => {
                let content = fs::read_to_string(&path)
                    .map_err(|_| SaveError::ConstraintsNotFound(path.display().to_string()))?;
                let merged = constraints.get_or_insert_with(String::new);
                merged.push_str(&content);
                if !merged.ends_with('\n') {
                    merged.push('\n');
                }
            }
            other => kept.push(other),
        }
    }
    *lines = kept;
    Ok(constraints)
}

fn line_name(line: &RequirementLine) -> Option<String> {
    match line {
        RequirementLine::Requirement(req) => req.canonical_name(),
        _ => None,
    }
}

/// A list naming the same package twice is ambiguous
fn reject_duplicate_names(lines: &[RequirementLine]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in lines.iter().filter_map(line_name) {
        if !seen.insert(name.clone()) {
            return Err(SaveError::DuplicateRequirement(name));
        }
    }
    Ok(())
}

/// Merge user extras over inferred requirements
///
/// A colliding extra replaces the inferred entry in place; the rest are
/// appended in the order given.
pub fn merge_extra_requirements(
    inferred: Vec<Requirement>,
    extra: Vec<RequirementLine>,
) -> Vec<RequirementLine> {
    let mut lines: Vec<RequirementLine> = inferred
        .into_iter()
        .map(RequirementLine::Requirement)
        .collect();
    for line in extra {
        if let Some(name) = line_name(&line) {
            if let Some(pos) = lines
                .iter()
                .position(|l| line_name(l).as_deref() == Some(name.as_str()))
            {
                debug!("Extra requirement {} overrides {}", line, lines[pos]);
                lines[pos] = line;
                continue;
            }
        }
        lines.push(line);
    }
    lines
}

/// Pin every named requirement and reject duplicates
pub fn finalize_requirements(
    lines: Vec<RequirementLine>,
    snapshot: &RuntimeSnapshot,
) -> Result<Vec<RequirementLine>> {
    let mut seen = HashSet::new();
    let mut finalized = Vec::with_capacity(lines.len());
    for line in lines {
        let line = match line {
            RequirementLine::Requirement(mut req) => {
                if let Some(name) = req.canonical_name() {
                    if !seen.insert(name.clone()) {
                        return Err(SaveError::DuplicateRequirement(name));
                    }
                }
                if !req.is_pinned() {
                    let name = req.name().unwrap_or_default().to_string();
                    let installed = snapshot
                        .packages
                        .version_of(&name)
                        .ok_or_else(|| SaveError::UnpinnedRequirement(req.to_string()))?;
                    if !req.satisfied_by(installed) {
                        return Err(SaveError::UnsatisfiedRequirement {
                            requirement: req.to_string(),
                            installed: installed.to_string(),
                        });
                    }
                    let original = req.to_string();
                    req.pin(installed);
                    info!("Pinned {} to installed version: {}", original, req);
                }
                RequirementLine::Requirement(req)
            }
            other => other,
        };
        finalized.push(line);
    }
    Ok(finalized)
}

fn build_dependencies(snapshot: &RuntimeSnapshot) -> Vec<Requirement> {
    BUILD_PACKAGES
        .iter()
        .map(|name| {
            let mut req = Requirement::Named {
                name: name.to_string(),
                extras: Vec::new(),
                clauses: Vec::new(),
                marker: None,
            };
            match snapshot.packages.version_of(name) {
                Some(version) => req.pin(version),
                None => warn!("{} is not installed; python_env.yaml leaves it unpinned", name),
            }
            req
        })
        .collect()
}

fn conda_spec_name(spec: &str) -> &str {
    spec.split(|c: char| "=<>!~ ".contains(c))
        .next()
        .unwrap_or_default()
}

/// Version of a `python=X.Y.Z` entry; a bare `python` yields `None`
fn conda_python_version(env: &CondaEnv) -> Option<String> {
    env.dependencies.iter().find_map(|dep| match dep {
        CondaDependency::Package(spec) if conda_spec_name(spec) == "python" => {
            let version = spec["python".len()..].trim().trim_start_matches('=').trim();
            (!version.is_empty()).then(|| version.to_string())
        }
        _ => None,
    })
}

/// Keep the user's conda channels, name and conda-level packages
fn apply_user_conda_env(manifest: &mut DependencyManifest, env: CondaEnv) {
    if !env.channels.is_empty() {
        manifest.conda_channels = env.channels;
    }
    manifest.conda_env_name = env.name;
    manifest.conda_packages = env
        .dependencies
        .into_iter()
        .filter_map(|dep| match dep {
            CondaDependency::Package(spec) => {
                let name = conda_spec_name(&spec);
                (name != "python" && name != "pip").then_some(spec)
            }
            CondaDependency::Pip { .. } => None,
        })
        .collect();
}

/// Move the staged package to its destination, replacing an old one
fn publish(stage: &Path, output_dir: &Path) -> Result<()> {
    if !output_dir.exists() {
        return fs::rename(stage, output_dir).map_err(io_error(output_dir));
    }

    let mut backup_name = output_dir.file_name().unwrap_or_default().to_os_string();
    backup_name.push(".modelpack-old");
    let backup = output_dir.with_file_name(backup_name);
    if backup.exists() {
        fs::remove_dir_all(&backup).map_err(io_error(&backup))?;
    }
    fs::rename(output_dir, &backup).map_err(io_error(output_dir))?;

    if let Err(source) = fs::rename(stage, output_dir) {
        // put the previous package back
        let _ = fs::rename(&backup, output_dir);
        return Err(SaveError::Io {
            path: output_dir.display().to_string(),
            source,
        });
    }
    if let Err(e) = fs::remove_dir_all(&backup) {
        warn!("Failed to remove replaced package {}: {}", backup.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{InstalledPackages, StaticProbe};
    use tempfile::TempDir;

    fn snapshot() -> RuntimeSnapshot {
        let mut packages = InstalledPackages::new();
        packages.insert("pandas", "2.0.3");
        packages.insert("numpy", "1.26.0");
        RuntimeSnapshot {
            python_version: "3.10.12".to_string(),
            packages,
        }
    }

    fn line(s: &str) -> RequirementLine {
        RequirementLine::parse(s).unwrap().unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    #[test]
    fn test_merge_replaces_in_place_and_appends() {
        let merged = merge_extra_requirements(
            vec![req("mlflow==2.9.2"), req("pandas==1.5.3"), req("scikit-learn==1.3.1")],
            vec![line("Pandas==2.0.3"), line("xgboost==2.0.0")],
        );
        let texts: Vec<String> = merged.iter().map(ToString::to_string).collect();
        assert_eq!(
            texts,
            vec![
                "mlflow==2.9.2",
                "Pandas==2.0.3",
                "scikit-learn==1.3.1",
                "xgboost==2.0.0"
            ]
        );
    }

    #[test]
    fn test_finalize_pins_from_snapshot() {
        let lines = finalize_requirements(vec![line("pandas>=2.0"), line("numpy")], &snapshot())
            .unwrap();
        let texts: Vec<String> = lines.iter().map(ToString::to_string).collect();
        assert_eq!(texts, vec!["pandas==2.0.3", "numpy==1.26.0"]);
    }

    #[test]
    fn test_finalize_rejects_unpinnable() {
        let result = finalize_requirements(vec![line("torch")], &snapshot());
        assert!(matches!(result, Err(SaveError::UnpinnedRequirement(_))));

        let result = finalize_requirements(vec![line("pandas<2")], &snapshot());
        assert!(matches!(result, Err(SaveError::UnsatisfiedRequirement { .. })));
    }

    #[test]
    fn test_finalize_rejects_duplicates() {
        let result = finalize_requirements(
            vec![line("pandas==2.0.3"), line("PANDAS==2.0.3")],
            &snapshot(),
        );
        assert!(matches!(result, Err(SaveError::DuplicateRequirement(_))));
    }

    #[test]
    fn test_conflicting_sources_rejected_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = temp_dir.path().join("model.pkl");
        fs::write(&artifact, b"model").unwrap();
        let output = temp_dir.path().join("out");

        let packager = ModelPackager::new(Box::new(StaticProbe::new(
            "3.10.12",
            InstalledPackages::new(),
        )));
        let options = SaveOptions::new(Flavor::Sklearn, &artifact)
            .pip_requirements(["pandas==2.0.3"])
            .extra_pip_requirements(["numpy==1.26.0"]);

        let result = packager.save(&output, &options);
        assert!(matches!(result, Err(SaveError::ConflictingRequirements(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_duplicate_extras_rejected_before_writing() {
        let temp_dir = TempDir::new().unwrap();
        let artifact = temp_dir.path().join("model.pkl");
        fs::write(&artifact, b"model").unwrap();
        let output = temp_dir.path().join("out");

        let packager = ModelPackager::new(Box::new(StaticProbe::new("3.10.12", snapshot().packages)));
        let options = SaveOptions::new(Flavor::Sklearn, &artifact)
            .extra_pip_requirements(["pandas==2.0.3", "Pandas==2.1.0"]);

        let result = packager.save(&output, &options);
        assert!(
            matches!(result, Err(SaveError::DuplicateRequirement(ref name)) if name == "pandas")
        );
        assert!(!output.exists());
    }

    #[test]
    fn test_publish_replaces_existing() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("model");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("stale.txt"), "old").unwrap();

        let stage = temp_dir.path().join("stage");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join("MLmodel"), "new").unwrap();

        publish(&stage, &output).unwrap();
        assert!(output.join("MLmodel").exists());
        assert!(!output.join("stale.txt").exists());
        assert!(!temp_dir.path().join("model.modelpack-old").exists());
    }

    #[test]
    fn test_conda_python_version() {
        let env = CondaEnv {
            name: "x".to_string(),
            channels: vec![],
            dependencies: vec![
                CondaDependency::Package("python-dateutil".to_string()),
                CondaDependency::Package("python=3.9.7".to_string()),
            ],
        };
        assert_eq!(conda_python_version(&env).as_deref(), Some("3.9.7"));
    }
}
