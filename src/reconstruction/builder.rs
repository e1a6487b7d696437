//! Running provisioning plans

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use modelpack_core::{run_process, ProcessArgs, ProcessResult};

use super::{EnvironmentPlan, ReconstructionError, Result};

/// Written into an environment once every step has succeeded
pub const READY_MARKER: &str = ".modelpack-ready";

const STDERR_TAIL_LINES: usize = 20;

/// Executes plan commands
///
/// `Err` means the program could not be launched at all; a non-zero exit
/// is reported through `ProcessResult`.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &ProcessArgs, stdin: Option<&[u8]>) -> anyhow::Result<ProcessResult>;
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &ProcessArgs, stdin: Option<&[u8]>) -> anyhow::Result<ProcessResult> {
        run_process(command, stdin)
    }
}

/// An environment ready to run the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedEnvironment {
    pub python: PathBuf,
    pub env_dir: Option<PathBuf>,
    /// Whether an existing environment was used without running any step
    pub reused: bool,
}

#[derive(Serialize)]
struct ReadyMarker<'a> {
    created_at: String,
    env_manager: String,
    python_version: &'a str,
    requirements: &'a [String],
    overrides: &'a [String],
}

pub struct EnvironmentBuilder {
    runner: Arc<dyn CommandRunner>,
}

impl EnvironmentBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Run `plan`, or reuse its environment when a previous run completed
    ///
    /// The first failing step stops provisioning and the partially built
    /// environment directory is removed.
    pub fn provision(&self, plan: &EnvironmentPlan) -> Result<PreparedEnvironment> {
        let Some(env_dir) = plan.env_dir.as_ref() else {
            debug!("Using interpreter {} as is", plan.python.display());
            return Ok(PreparedEnvironment {
                python: plan.python.clone(),
                env_dir: None,
                reused: true,
            });
        };

        if env_dir.join(READY_MARKER).is_file() {
            info!("Reusing environment {}", env_dir.display());
            return Ok(PreparedEnvironment {
                python: plan.python.clone(),
                env_dir: Some(env_dir.clone()),
                reused: true,
            });
        }

        if env_dir.exists() {
            warn!("Removing incomplete environment {}", env_dir.display());
            fs::remove_dir_all(env_dir).map_err(|e| ReconstructionError::io(env_dir, e))?;
        }
        if let Some(parent) = env_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| ReconstructionError::io(parent, e))?;
        }

        info!(
            "Creating {} environment {} ({} steps)",
            plan.env_manager,
            env_dir.display(),
            plan.steps.len()
        );
        for step in &plan.steps {
            info!(step = %step.name, "Running {}", step.command.display());
            let result = match self.runner.run(&step.command, None) {
                Ok(result) => result,
                Err(e) => {
                    discard(env_dir);
                    return Err(ReconstructionError::ToolUnavailable {
                        program: step.command.program.clone(),
                        reason: format!("{:#}", e),
                    });
                }
            };
            if !result.success() {
                discard(env_dir);
                return Err(diagnose(&step.command, &result));
            }
            debug!(step = %step.name, "Finished in {}ms", result.duration_ms);
        }

        write_marker(plan, env_dir)?;
        Ok(PreparedEnvironment {
            python: plan.python.clone(),
            env_dir: Some(env_dir.clone()),
            reused: false,
        })
    }
}

fn write_marker(plan: &EnvironmentPlan, env_dir: &Path) -> Result<()> {
    fs::create_dir_all(env_dir).map_err(|e| ReconstructionError::io(env_dir, e))?;
    let marker = ReadyMarker {
        created_at: Utc::now().to_rfc3339(),
        env_manager: plan.env_manager.to_string(),
        python_version: &plan.python_version,
        requirements: &plan.effective_requirements,
        overrides: &plan.overrides,
    };
    let path = env_dir.join(READY_MARKER);
    let content = serde_json::to_vec_pretty(&marker)
        .map_err(|e| ReconstructionError::io(&path, std::io::Error::other(e)))?;
    fs::write(&path, content).map_err(|e| ReconstructionError::io(&path, e))
}

fn discard(env_dir: &Path) {
    if env_dir.exists() {
        if let Err(e) = fs::remove_dir_all(env_dir) {
            warn!("Failed to remove {}: {}", env_dir.display(), e);
        }
    }
}

fn missing_module_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"No module named ['"]?([A-Za-z0-9_.]+)['"]?"#).expect("static regex")
    })
}

fn unresolved_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:No matching distribution found for|Could not find a version that satisfies the requirement) ([^\s;()]+)",
        )
        .expect("static regex")
    })
}

/// Module named by a `ModuleNotFoundError` in `output`
pub fn missing_module(output: &str) -> Option<String> {
    missing_module_pattern()
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Requirement pip failed to resolve in `output`
pub fn unresolved_requirement(output: &str) -> Option<String> {
    unresolved_pattern()
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Turn a failed command into the most specific error
pub(crate) fn diagnose(command: &ProcessArgs, result: &ProcessResult) -> ReconstructionError {
    let rendered = command.display();
    if result.timed_out {
        return ReconstructionError::Timeout {
            command: rendered,
            timeout_ms: command.timeout_ms,
        };
    }

    let output = format!("{}\n{}", result.stderr, result.stdout);
    if let Some(module) = missing_module(&output) {
        return ReconstructionError::MissingModule {
            module,
            command: rendered,
        };
    }
    if let Some(requirement) = unresolved_requirement(&output) {
        return ReconstructionError::UnresolvedPackage {
            requirement,
            command: rendered,
        };
    }
    ReconstructionError::StepFailed {
        command: rendered,
        exit_code: result.exit_code,
        stderr: tail(&result.stderr, STDERR_TAIL_LINES),
    }
}

pub(crate) fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
