//! CLI module
//!
//! Provides:
//! - Argument parsing (`args`)
//! - Command dispatch and exit code mapping (`dispatch`)

pub mod args;
pub mod dispatch;

pub use args::{Args, Command};
pub use dispatch::{run, ExitCode};

use modelpack_core::{CodePathError, SaveError};

use crate::config::ConfigError;
use crate::docker::DockerError;
use crate::reconstruction::ReconstructionError;
use crate::scoring::PredictError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    Server(String),
}

/// Exit codes (deterministic)
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INVALID_INPUT: i32 = 2;

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map to an exit code: bad input is 2, everything else 1
    pub fn exit_code(&self) -> i32 {
        let invalid = match self {
            Error::InvalidArgs(_) | Error::Config(_) => true,
            Error::Save(e) => save_input_error(e),
            Error::Reconstruction(e) => reconstruction_input_error(e),
            Error::Predict(PredictError::Reconstruction(e)) => reconstruction_input_error(e),
            Error::Predict(PredictError::Scoring(_)) => false,
            Error::Docker(DockerError::Reconstruction(e)) => reconstruction_input_error(e),
            Error::Docker(DockerError::ContextNotEmpty(_)) => true,
            Error::Docker(_) => false,
            Error::Io(_) | Error::Serialization(_) | Error::Server(_) => false,
        };
        if invalid {
            EXIT_INVALID_INPUT
        } else {
            EXIT_FAILURE
        }
    }
}

fn save_input_error(error: &SaveError) -> bool {
    match error {
        SaveError::ConflictingRequirements(_)
        | SaveError::InvalidRequirement(_)
        | SaveError::ModelArtifactNotFound(_)
        | SaveError::ConstraintsNotFound(_)
        | SaveError::OutputExists(_)
        | SaveError::UnpinnedRequirement(_)
        | SaveError::UnsatisfiedRequirement { .. }
        | SaveError::DuplicateRequirement(_) => true,
        SaveError::CodePath(e) => !matches!(e, CodePathError::Copy { .. }),
        SaveError::Probe(_)
        | SaveError::Manifest(_)
        | SaveError::Io { .. }
        | SaveError::Descriptor(_) => false,
    }
}

fn reconstruction_input_error(error: &ReconstructionError) -> bool {
    matches!(
        error,
        ReconstructionError::InvalidOverride { .. }
            | ReconstructionError::OverridesUnsupported(_)
            | ReconstructionError::ModelNotFound(_)
            | ReconstructionError::MissingManifest(_)
            | ReconstructionError::MissingCondaEnv(_)
    )
}
