//! Docker build contexts for packaged models
//!
//! Layout of a generated context:
//! ```text
//! <context>/Dockerfile
//! <context>/model/...        copy of the model package
//! <context>/modelpack        the serving binary
//! ```
//! The image installs the manifest's requirements into the system
//! interpreter and serves with `--env-manager local`.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use modelpack_core::fs_util::copy_dir_recursive;
use modelpack_core::{ProcessArgs, REQUIREMENTS_FILE};

use crate::reconstruction::{builder::tail, CommandRunner, EnvironmentSpec, ReconstructionError};

pub const DOCKERFILE: &str = "Dockerfile";
pub const MODEL_DIR: &str = "model";
pub const BINARY_NAME: &str = "modelpack";
pub const SERVE_PORT: u16 = 8080;

const CONTAINER_ROOT: &str = "/opt/ml";
const BUILD_TIMEOUT_MS: u64 = 3_600_000;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error("Build context {0} already exists and is not empty")]
    ContextNotEmpty(String),

    #[error("Serving binary not found: {0}")]
    BinaryNotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch docker: {0}")]
    Launch(String),

    #[error("docker build failed with exit code {exit_code}:\n{stderr}")]
    BuildFailed { exit_code: i32, stderr: String },
}

pub type Result<T> = std::result::Result<T, DockerError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DockerError + '_ {
    move |source| DockerError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct DockerOptions {
    pub model_dir: PathBuf,
    pub context_dir: PathBuf,
    /// Tag passed to `docker build -t`
    pub image_name: String,
    /// Run `docker build` after writing the context
    pub build: bool,
    /// Binary copied into the image; defaults to the running executable
    pub binary: Option<PathBuf>,
}

impl DockerOptions {
    pub fn new(model_dir: impl Into<PathBuf>, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            context_dir: context_dir.into(),
            image_name: "modelpack-model".to_string(),
            build: false,
            binary: None,
        }
    }
}

/// A written build context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerContext {
    pub context_dir: PathBuf,
    pub dockerfile: PathBuf,
    /// Set when the image was built
    pub image: Option<String>,
}

/// Render the Dockerfile for a package
pub fn render_dockerfile(spec: &EnvironmentSpec, extra_requirements_file: Option<&str>) -> String {
    let model_root = format!("{}/{}", CONTAINER_ROOT, MODEL_DIR);
    let mut lines = vec![
        format!("FROM python:{}-slim", spec.python_version),
        String::new(),
        format!("WORKDIR {}", CONTAINER_ROOT),
        format!("COPY {} {}", MODEL_DIR, model_root),
    ];

    let mut install = Vec::new();
    if !spec.build_dependencies.is_empty() {
        install.push(format!(
            "python -m pip install --no-cache-dir {}",
            spec.build_dependencies
                .iter()
                .map(|d| shell_quote(d))
                .collect::<Vec<_>>()
                .join(" ")
        ));
    }
    match (&spec.requirements_file, extra_requirements_file) {
        (Some(_), _) => install.push(format!(
            "python -m pip install --no-cache-dir -r {}/{}",
            model_root, REQUIREMENTS_FILE
        )),
        (None, Some(file)) => {
            lines.push(format!("COPY {} {}/{}", file, CONTAINER_ROOT, file));
            install.push(format!(
                "python -m pip install --no-cache-dir -r {}/{}",
                CONTAINER_ROOT, file
            ));
        }
        (None, None) => {}
    }
    if !install.is_empty() {
        lines.push(format!("RUN {}", install.join(" \\\n    && ")));
    }

    lines.push(format!("COPY {} /usr/local/bin/{}", BINARY_NAME, BINARY_NAME));
    lines.push(String::new());
    lines.push(format!("EXPOSE {}", SERVE_PORT));
    lines.push(format!(
        r#"ENTRYPOINT ["{}", "serve", "--model", "{}", "--host", "0.0.0.0", "--port", "{}", "--env-manager", "local"]"#,
        BINARY_NAME, model_root, SERVE_PORT
    ));

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.=/:@+".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Write a build context for the package and optionally build it
pub fn build_docker(options: &DockerOptions, runner: &dyn CommandRunner) -> Result<DockerContext> {
    let spec = EnvironmentSpec::from_model_dir(&options.model_dir, &[])?;

    let binary = match &options.binary {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|e| DockerError::BinaryNotFound(e.to_string()))?,
    };
    if !binary.is_file() {
        return Err(DockerError::BinaryNotFound(binary.display().to_string()));
    }

    let context = &options.context_dir;
    if context.exists() {
        let mut entries = fs::read_dir(context).map_err(io_err(context))?;
        if entries.next().is_some() {
            return Err(DockerError::ContextNotEmpty(context.display().to_string()));
        }
    }
    fs::create_dir_all(context).map_err(io_err(context))?;

    let model_copy = context.join(MODEL_DIR);
    let files = copy_dir_recursive(&options.model_dir, &model_copy, &[context.clone()])
        .map_err(io_err(&model_copy))?;
    let binary_copy = context.join(BINARY_NAME);
    fs::copy(&binary, &binary_copy).map_err(io_err(&binary_copy))?;

    // packages without requirements.txt get one generated outside model/
    let generated = if spec.requirements_file.is_none() && !spec.requirements.is_empty() {
        let path = context.join(REQUIREMENTS_FILE);
        let content: String = spec
            .requirements
            .iter()
            .map(|line| format!("{}\n", line))
            .collect();
        fs::write(&path, content).map_err(io_err(&path))?;
        Some(REQUIREMENTS_FILE)
    } else {
        None
    };

    let dockerfile = context.join(DOCKERFILE);
    fs::write(&dockerfile, render_dockerfile(&spec, generated)).map_err(io_err(&dockerfile))?;
    info!(
        "Wrote Docker context {} ({} model files, python {})",
        context.display(),
        files,
        spec.python_version
    );

    let image = if options.build {
        docker_build(runner, context, &options.image_name)?;
        Some(options.image_name.clone())
    } else {
        None
    };

    Ok(DockerContext {
        context_dir: context.clone(),
        dockerfile,
        image,
    })
}

fn docker_build(runner: &dyn CommandRunner, context: &Path, image: &str) -> Result<()> {
    let command = ProcessArgs::new("docker")
        .args(["build", "-t", image])
        .arg(context.to_string_lossy())
        .timeout_ms(BUILD_TIMEOUT_MS);
    info!("Running {}", command.display());

    let result = runner
        .run(&command, None)
        .map_err(|e| DockerError::Launch(format!("{:#}", e)))?;
    if !result.success() {
        return Err(DockerError::BuildFailed {
            exit_code: result.exit_code,
            stderr: tail(&result.stderr, 30),
        });
    }
    info!("Built image {}", image);
    Ok(())
}
