//! Scoring a packaged model inside its environment
//!
//! The model is loaded by a short Python helper run with the environment's
//! interpreter. The request JSON goes in on stdin and the predictions come
//! back as JSON on the last line of stdout.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use modelpack_core::process::DEFAULT_TIMEOUT_MS;
use modelpack_core::ProcessArgs;

use crate::reconstruction::{
    builder::tail, missing_module, reconstruct, CommandRunner, EnvManager, EnvironmentBuilder,
    PlanOptions, PreparedEnvironment, ReconstructionError,
};

const SCORING_SCRIPT: &str = r#"
import json
import sys

import mlflow.pyfunc


def _to_input(payload):
    if isinstance(payload, dict):
        if "dataframe_split" in payload:
            import pandas as pd
            split = payload["dataframe_split"]
            return pd.DataFrame(split["data"], columns=split.get("columns"), index=split.get("index"))
        if "dataframe_records" in payload:
            import pandas as pd
            return pd.DataFrame(payload["dataframe_records"])
        for key in ("instances", "inputs"):
            if key in payload:
                return payload[key]
    return payload


def _to_json(value):
    if hasattr(value, "tolist"):
        return value.tolist()
    if hasattr(value, "to_dict"):
        return value.to_dict(orient="records")
    return value


model = mlflow.pyfunc.load_model(sys.argv[1])
payload = json.load(sys.stdin)
predictions = model.predict(_to_input(payload))
sys.stdout.write("\n" + json.dumps(_to_json(predictions)) + "\n")
"#;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("No module named '{module}' in the scoring environment")]
    MissingModule { module: String },

    #[error("Scoring failed with exit code {exit_code}:\n{stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("Scoring timed out after {0}ms")]
    Timeout(u64),

    #[error("Failed to launch {python}: {reason}")]
    Launch { python: String, reason: String },

    #[error("Scoring produced no valid JSON: {0}")]
    InvalidOutput(String),
}

pub type Result<T> = std::result::Result<T, ScoringError>;

/// Runs predictions for one model with one interpreter
#[derive(Clone)]
pub struct Scorer {
    runner: Arc<dyn CommandRunner>,
    python: PathBuf,
    model_dir: PathBuf,
    timeout_ms: u64,
}

impl Scorer {
    pub fn new(runner: Arc<dyn CommandRunner>, python: impl Into<PathBuf>, model_dir: &Path) -> Self {
        Self {
            runner,
            python: python.into(),
            model_dir: model_dir.to_path_buf(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn for_environment(
        runner: Arc<dyn CommandRunner>,
        env: &PreparedEnvironment,
        model_dir: &Path,
    ) -> Self {
        Self::new(runner, env.python.clone(), model_dir)
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn command(&self) -> ProcessArgs {
        ProcessArgs::new(self.python.to_string_lossy())
            .args(["-c", SCORING_SCRIPT])
            .arg(self.model_dir.to_string_lossy())
            .current_dir(&self.model_dir)
            .timeout_ms(self.timeout_ms)
    }

    /// Score one request payload
    pub fn score(&self, input: &Value) -> Result<Value> {
        let payload = input.to_string();
        let command = self.command();
        debug!("Scoring {} bytes with {}", payload.len(), self.python.display());

        let result = self
            .runner
            .run(&command, Some(payload.as_bytes()))
            .map_err(|e| ScoringError::Launch {
                python: self.python.display().to_string(),
                reason: format!("{:#}", e),
            })?;

        if result.timed_out {
            return Err(ScoringError::Timeout(self.timeout_ms));
        }
        if !result.success() {
            if let Some(module) = missing_module(&result.stderr) {
                return Err(ScoringError::MissingModule { module });
            }
            return Err(ScoringError::Failed {
                exit_code: result.exit_code,
                stderr: tail(&result.stderr, STDERR_TAIL_LINES),
            });
        }

        parse_predictions(&result.stdout)
    }
}

/// Predictions are the last non-empty stdout line; model code may print before it
fn parse_predictions(stdout: &str) -> Result<Value> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ScoringError::InvalidOutput("empty output".to_string()))?;
    serde_json::from_str(line).map_err(|e| ScoringError::InvalidOutput(e.to_string()))
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

/// Reconstruct the model's environment and score `input` in it
pub fn predict(
    model_dir: &Path,
    input: &Value,
    manager: EnvManager,
    overrides: &[String],
    options: &PlanOptions,
    builder: &EnvironmentBuilder,
) -> std::result::Result<Value, PredictError> {
    let (_, env) = reconstruct(model_dir, manager, overrides, options, builder)?;
    let scorer =
        Scorer::for_environment(builder.runner(), &env, model_dir).timeout_ms(options.timeout_ms);
    Ok(scorer.score(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpack_core::ProcessResult;
    use serde_json::json;
    use std::sync::Mutex;

    struct CannedRunner {
        result: ProcessResult,
        seen_stdin: Mutex<Option<Vec<u8>>>,
    }

    impl CannedRunner {
        fn new(exit_code: i32, stdout: &str, stderr: &str) -> Self {
            Self {
                result: ProcessResult {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    timed_out: false,
                    duration_ms: 1,
                },
                seen_stdin: Mutex::new(None),
            }
        }
    }

    impl CommandRunner for CannedRunner {
        fn run(&self, _command: &ProcessArgs, stdin: Option<&[u8]>) -> anyhow::Result<ProcessResult> {
            *self.seen_stdin.lock().unwrap() = stdin.map(<[u8]>::to_vec);
            Ok(self.result.clone())
        }
    }

    #[test]
    fn test_score_parses_last_line() {
        let runner = Arc::new(CannedRunner::new(0, "loading model\n\n[1, 0, 1]\n", ""));
        let scorer = Scorer::new(runner.clone(), "python", Path::new("/models/m"));

        let input = json!({"inputs": [[1.0, 2.0]]});
        let predictions = scorer.score(&input).unwrap();

        assert_eq!(predictions, json!([1, 0, 1]));
        let stdin = runner.seen_stdin.lock().unwrap().clone().unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&stdin).unwrap(), input);
    }

    #[test]
    fn test_missing_module_surfaces() {
        let runner = Arc::new(CannedRunner::new(
            1,
            "",
            "Traceback (most recent call last):\nModuleNotFoundError: No module named 'xgboost'\n",
        ));
        let scorer = Scorer::new(runner, "python", Path::new("/models/m"));
        let err = scorer.score(&json!([])).unwrap_err();
        assert!(matches!(err, ScoringError::MissingModule { ref module } if module == "xgboost"));
    }

    #[test]
    fn test_invalid_output() {
        let runner = Arc::new(CannedRunner::new(0, "not json", ""));
        let scorer = Scorer::new(runner, "python", Path::new("/models/m"));
        assert!(matches!(
            scorer.score(&json!([])),
            Err(ScoringError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_generic_failure_keeps_stderr() {
        let runner = Arc::new(CannedRunner::new(2, "", "ValueError: bad shape"));
        let scorer = Scorer::new(runner, "python", Path::new("/models/m"));
        match scorer.score(&json!([])).unwrap_err() {
            ScoringError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert!(stderr.contains("bad shape"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
