//! Environment reconstruction
//!
//! Rebuilds the runtime described by a saved model's manifest:
//! - `environment`: what to install (`EnvironmentSpec`), read from the package
//! - `plan`: how to install it with a given environment manager
//! - `builder`: running the plan through a `CommandRunner`
//!
//! Overrides only ever change the plan. Files inside the model package are
//! read, never written.

pub mod builder;
pub mod environment;
pub mod plan;

pub use builder::{
    missing_module, unresolved_requirement, CommandRunner, EnvironmentBuilder,
    PreparedEnvironment, ProcessRunner, READY_MARKER,
};
pub use environment::EnvironmentSpec;
pub use plan::{EnvironmentPlan, PlanOptions, ProvisionStep};

use modelpack_core::{ManifestError, RequirementError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("Model directory not found: {0}")]
    ModelNotFound(String),

    #[error("No python_env.yaml or conda.yaml in {0}")]
    MissingManifest(String),

    #[error("The conda environment manager needs conda.yaml in {0}")]
    MissingCondaEnv(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Requirement overrides need an isolated environment; the {0} environment manager does not create one")]
    OverridesUnsupported(EnvManager),

    #[error("Invalid requirement override '{input}': {source}")]
    InvalidOverride {
        input: String,
        #[source]
        source: RequirementError,
    },

    #[error("No module named '{module}' (while running: {command})")]
    MissingModule { module: String, command: String },

    #[error("Could not resolve requirement '{requirement}' (while running: {command})")]
    UnresolvedPackage { requirement: String, command: String },

    #[error("Command failed with exit code {exit_code}: {command}\n{stderr}")]
    StepFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command timed out after {timeout_ms}ms: {command}")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Failed to launch {program}: {reason}")]
    ToolUnavailable { program: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;

impl ReconstructionError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ReconstructionError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Tool used to materialize the environment
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EnvManager {
    /// Use the current interpreter as is
    Local,
    /// `python -m venv` plus pip
    Virtualenv,
    Uv,
    Conda,
}

impl EnvManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvManager::Local => "local",
            EnvManager::Virtualenv => "virtualenv",
            EnvManager::Uv => "uv",
            EnvManager::Conda => "conda",
        }
    }
}

impl fmt::Display for EnvManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvManager {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(EnvManager::Local),
            "virtualenv" | "venv" => Ok(EnvManager::Virtualenv),
            "uv" => Ok(EnvManager::Uv),
            "conda" => Ok(EnvManager::Conda),
            other => Err(format!("unknown environment manager: {}", other)),
        }
    }
}

/// Read the package, plan for `manager` and provision
///
/// Returns the plan alongside the ready environment.
pub fn reconstruct(
    model_dir: &Path,
    manager: EnvManager,
    overrides: &[String],
    options: &PlanOptions,
    builder: &EnvironmentBuilder,
) -> Result<(EnvironmentPlan, PreparedEnvironment)> {
    let spec = EnvironmentSpec::from_model_dir(model_dir, overrides)?;
    let plan = spec.plan(manager, options)?;
    let prepared = builder.provision(&plan)?;
    Ok((plan, prepared))
}
