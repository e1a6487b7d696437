//! Modelpack: reproducible environments for packaged ML models
//!
//! The packaging side (`modelpack_core`) writes a model together with its
//! dependency manifest. This crate consumes such packages: it rebuilds
//! their Python environment, scores requests in it, serves it over HTTP
//! and prepares Docker build contexts.

pub mod cli;
pub mod config;
pub mod docker;
pub mod logging;
pub mod reconstruction;
pub mod scoring;
pub mod serve;

pub use config::{ConfigError, ConfigFormat, PackagerConfig, ServeConfig};
pub use docker::{build_docker, DockerContext, DockerError, DockerOptions};
pub use reconstruction::{
    reconstruct, CommandRunner, EnvManager, EnvironmentBuilder, EnvironmentPlan, EnvironmentSpec,
    PlanOptions, PreparedEnvironment, ProcessRunner, ProvisionStep, ReconstructionError,
};
pub use scoring::{predict, PredictError, Scorer, ScoringError};
pub use serve::{router, ScoringServer, ServeState};
