//! Command-line arguments
//!
//! ```text
//! modelpack [--config FILE] [--log-format text|json] [-v] <command>
//!
//! COMMANDS:
//!   save           Package a model with its dependency manifest
//!   predict        Score an input file in the model's environment
//!   serve          Serve the model over HTTP
//!   build-docker   Write (and optionally build) a Docker context
//!   env            Print the environment reconstruction plan as JSON
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use modelpack_core::Flavor;

use crate::logging::LogFormat;
use crate::reconstruction::EnvManager;

#[derive(Debug, Parser)]
#[command(name = "modelpack", version, about = "Package ML models with reproducible Python environments")]
pub struct Args {
    /// Config file (TOML, JSON or YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Package a model with its dependency manifest
    Save(SaveArgs),
    /// Score an input file in the model's environment
    Predict(PredictArgs),
    /// Serve the model over HTTP
    Serve(ServeArgs),
    /// Write a Docker build context for the model
    BuildDocker(BuildDockerArgs),
    /// Print the environment reconstruction plan as JSON
    Env(EnvArgs),
}

#[derive(Debug, Clone, ClapArgs)]
pub struct SaveArgs {
    /// Model flavor (sklearn, pytorch, python_function, ...)
    #[arg(long)]
    pub flavor: Flavor,

    /// Serialized model file or directory
    #[arg(long)]
    pub model: PathBuf,

    /// Destination package directory
    #[arg(long)]
    pub output: PathBuf,

    /// Complete pip requirement list, replacing inference
    #[arg(long = "pip-requirement", allow_hyphen_values = true)]
    pub pip_requirements: Vec<String>,

    /// Requirements file used as the complete pip requirement list
    #[arg(long)]
    pub pip_requirements_file: Option<PathBuf>,

    /// Requirement added on top of the inferred ones
    #[arg(long = "extra-pip-requirement", allow_hyphen_values = true)]
    pub extra_pip_requirements: Vec<String>,

    /// Conda environment file used instead of inference
    #[arg(long)]
    pub conda_env: Option<PathBuf>,

    /// File or directory bundled under code/
    #[arg(long = "code-path")]
    pub code_paths: Vec<PathBuf>,

    /// JSON input example stored with the model and used for inference
    #[arg(long)]
    pub input_example: Option<PathBuf>,

    /// KEY=VALUE stored in MLmodel metadata
    #[arg(long = "metadata", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Replace an existing package at the destination
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct EnvironmentArgs {
    /// Packaged model directory
    #[arg(long)]
    pub model: PathBuf,

    /// Environment manager (defaults to the configured one)
    #[arg(long, value_enum)]
    pub env_manager: Option<EnvManager>,

    /// Requirement installed over the manifest for this run only
    #[arg(long = "pip-requirements-override", allow_hyphen_values = true)]
    pub overrides: Vec<String>,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct PredictArgs {
    #[command(flatten)]
    pub env: EnvironmentArgs,

    /// JSON input file, `-` for stdin
    #[arg(long)]
    pub input: PathBuf,

    /// Write predictions here instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct ServeArgs {
    #[command(flatten)]
    pub env: EnvironmentArgs,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Concurrent scoring processes
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct BuildDockerArgs {
    /// Packaged model directory
    #[arg(long)]
    pub model: PathBuf,

    /// Directory the build context is written to
    #[arg(long)]
    pub context: PathBuf,

    /// Image name passed to `docker build -t`
    #[arg(long, default_value = "modelpack-model")]
    pub name: String,

    /// Run `docker build` after writing the context
    #[arg(long)]
    pub build: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct EnvArgs {
    #[command(flatten)]
    pub env: EnvironmentArgs,

    /// Also provision the environment
    #[arg(long)]
    pub provision: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_save() {
        let args = Args::try_parse_from([
            "modelpack",
            "save",
            "--flavor",
            "sklearn",
            "--model",
            "model.pkl",
            "--output",
            "out",
            "--extra-pip-requirement",
            "pandas==2.0.3",
            "--code-path",
            "src/utils/helpers.py",
            "--metadata",
            "team=ml",
        ])
        .unwrap();

        let Command::Save(save) = args.command else {
            panic!("expected save");
        };
        assert_eq!(save.flavor, Flavor::Sklearn);
        assert_eq!(save.extra_pip_requirements, vec!["pandas==2.0.3".to_string()]);
        assert_eq!(save.code_paths, vec![PathBuf::from("src/utils/helpers.py")]);
        assert_eq!(save.metadata, vec![("team".to_string(), "ml".to_string())]);
        assert!(!save.overwrite);
    }

    #[test]
    fn test_parse_predict_with_overrides() {
        let args = Args::try_parse_from([
            "modelpack",
            "-v",
            "--log-format",
            "json",
            "predict",
            "--model",
            "m",
            "--input",
            "in.json",
            "--env-manager",
            "uv",
            "--pip-requirements-override",
            "scikit-learn==1.4.0",
            "--pip-requirements-override",
            "shap",
        ])
        .unwrap();

        assert_eq!(args.verbose, 1);
        assert_eq!(args.log_format, LogFormat::Json);
        let Command::Predict(predict) = args.command else {
            panic!("expected predict");
        };
        assert_eq!(predict.env.env_manager, Some(EnvManager::Uv));
        assert_eq!(predict.env.overrides.len(), 2);
    }

    #[test]
    fn test_unknown_flavor_rejected() {
        let result = Args::try_parse_from([
            "modelpack", "save", "--flavor", "caffe", "--model", "m", "--output", "o",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_value_parser() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }
}
