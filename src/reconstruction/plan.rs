//! Provisioning plans per environment manager

use serde::Serialize;
use std::path::{Path, PathBuf};

use modelpack_core::process::DEFAULT_TIMEOUT_MS;
use modelpack_core::{ProcessArgs, RequirementLine, CONDA_ENV_FILE, REQUIREMENTS_FILE};

use super::{EnvManager, EnvironmentSpec, ReconstructionError, Result};

/// Where and with what the plan runs
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Parent directory of reconstructed environments
    pub env_root: PathBuf,
    /// Interpreter used by `EnvManager::Local`
    pub host_python: String,
    /// Timeout for each step
    pub timeout_ms: u64,
}

impl PlanOptions {
    pub fn new(env_root: impl Into<PathBuf>) -> Self {
        Self {
            env_root: env_root.into(),
            host_python: "python3".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn host_python(mut self, python: impl Into<String>) -> Self {
        self.host_python = python.into();
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// One command of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionStep {
    pub name: String,
    pub command: ProcessArgs,
}

impl ProvisionStep {
    fn new(name: &str, command: ProcessArgs) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }
}

/// Ordered commands that materialize an `EnvironmentSpec`
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentPlan {
    pub env_manager: EnvManager,
    pub model_dir: PathBuf,
    /// `None` for `EnvManager::Local`
    pub env_dir: Option<PathBuf>,
    /// Interpreter inside the environment
    pub python: PathBuf,
    pub python_version: String,
    pub steps: Vec<ProvisionStep>,
    pub effective_requirements: Vec<String>,
    pub overrides: Vec<String>,
}

impl EnvironmentPlan {
    pub fn has_override_step(&self) -> bool {
        self.steps.iter().any(|s| s.name == STEP_OVERRIDES)
    }
}

pub const STEP_CREATE: &str = "create-environment";
pub const STEP_BUILD_DEPS: &str = "install-build-dependencies";
pub const STEP_REQUIREMENTS: &str = "install-requirements";
pub const STEP_OVERRIDES: &str = "install-overrides";

impl EnvironmentSpec {
    /// Plan the provisioning of this spec with `manager`
    ///
    /// Overrides are always their own final step, installed over the
    /// manifest's requirements rather than merged into them.
    pub fn plan(&self, manager: EnvManager, options: &PlanOptions) -> Result<EnvironmentPlan> {
        let overrides: Vec<String> = self.overrides.iter().map(ToString::to_string).collect();

        let (env_dir, python, steps) = match manager {
            EnvManager::Local => {
                if !overrides.is_empty() {
                    return Err(ReconstructionError::OverridesUnsupported(manager));
                }
                (None, PathBuf::from(&options.host_python), Vec::new())
            }
            EnvManager::Virtualenv => {
                let env_dir = options.env_root.join(self.env_name(manager));
                let python = venv_python(&env_dir);
                let installer = PipInstaller::Pip(python.clone());
                let create = ProcessArgs::new(format!("python{}", self.python_minor_version()))
                    .args(["-m", "venv"])
                    .arg(path_arg(&env_dir));
                let steps = self.install_steps(create, &installer, &overrides);
                (Some(env_dir), python, steps)
            }
            EnvManager::Uv => {
                let env_dir = options.env_root.join(self.env_name(manager));
                let python = venv_python(&env_dir);
                let installer = PipInstaller::Uv(python.clone());
                let create = ProcessArgs::new("uv")
                    .args(["venv", "--python", self.python_version.as_str()])
                    .arg(path_arg(&env_dir));
                let steps = self.install_steps(create, &installer, &overrides);
                (Some(env_dir), python, steps)
            }
            EnvManager::Conda => {
                if self.conda_env_file.is_none() {
                    return Err(ReconstructionError::MissingCondaEnv(
                        self.model_dir.display().to_string(),
                    ));
                }
                let env_dir = options.env_root.join(self.env_name(manager));
                let python = conda_python(&env_dir);
                // conda installs the pip block itself, relative to the model dir
                let mut steps = vec![ProvisionStep::new(
                    STEP_CREATE,
                    ProcessArgs::new("conda")
                        .args(["env", "create", "--prefix"])
                        .arg(path_arg(&env_dir))
                        .args(["--file", CONDA_ENV_FILE])
                        .current_dir(&self.model_dir),
                )];
                if !overrides.is_empty() {
                    let installer = PipInstaller::Pip(python.clone());
                    steps.push(ProvisionStep::new(
                        STEP_OVERRIDES,
                        installer.install(overrides.iter().cloned()),
                    ));
                }
                (Some(env_dir), python, steps)
            }
        };

        let steps = steps
            .into_iter()
            .map(|mut step| {
                step.command.timeout_ms = options.timeout_ms;
                step
            })
            .collect();

        Ok(EnvironmentPlan {
            env_manager: manager,
            model_dir: self.model_dir.clone(),
            env_dir,
            python,
            python_version: self.python_version.clone(),
            steps,
            effective_requirements: self.effective_requirements(),
            overrides,
        })
    }

    fn install_steps(
        &self,
        create: ProcessArgs,
        installer: &PipInstaller,
        overrides: &[String],
    ) -> Vec<ProvisionStep> {
        let mut steps = vec![ProvisionStep::new(STEP_CREATE, create)];

        if !self.build_dependencies.is_empty() {
            steps.push(ProvisionStep::new(
                STEP_BUILD_DEPS,
                installer.install(self.build_dependencies.iter().cloned()),
            ));
        }

        let requirement_args = match &self.requirements_file {
            Some(_) => vec!["-r".to_string(), REQUIREMENTS_FILE.to_string()],
            None => pip_args(&self.requirements),
        };
        if !requirement_args.is_empty() {
            // run from the model dir so `-c constraints.txt` resolves
            steps.push(ProvisionStep::new(
                STEP_REQUIREMENTS,
                installer
                    .install(requirement_args)
                    .current_dir(&self.model_dir),
            ));
        }

        if !overrides.is_empty() {
            steps.push(ProvisionStep::new(
                STEP_OVERRIDES,
                installer.install(overrides.iter().cloned()),
            ));
        }
        steps
    }
}

enum PipInstaller {
    Pip(PathBuf),
    Uv(PathBuf),
}

impl PipInstaller {
    fn install<I, S>(&self, args: I) -> ProcessArgs
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            PipInstaller::Pip(python) => ProcessArgs::new(path_arg(python))
                .args(["-m", "pip", "install"])
                .args(args),
            PipInstaller::Uv(python) => ProcessArgs::new("uv")
                .args(["pip", "install", "--python"])
                .arg(path_arg(python))
                .args(args),
        }
    }
}

/// Command-line form of requirement lines
fn pip_args(lines: &[RequirementLine]) -> Vec<String> {
    let mut args = Vec::new();
    for line in lines {
        match line {
            RequirementLine::Requirement(req) => {
                let text = req.to_string();
                match text.strip_prefix("-e ") {
                    Some(target) => {
                        args.push("-e".to_string());
                        args.push(target.to_string());
                    }
                    None => args.push(text),
                }
            }
            RequirementLine::Include(path) => {
                args.push("-r".to_string());
                args.push(path_arg(path));
            }
            RequirementLine::Constraint(path) => {
                args.push("-c".to_string());
                args.push(path_arg(path));
            }
            RequirementLine::Option(raw) => {
                args.extend(raw.split_whitespace().map(str::to_string));
            }
        }
    }
    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn venv_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

fn conda_python(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelpack_core::{CONSTRAINTS_FILE, PYTHON_ENV_FILE};
    use std::fs;
    use tempfile::TempDir;

    fn package(dir: &Path) {
        fs::write(
            dir.join(PYTHON_ENV_FILE),
            "python: 3.10.12\nbuild_dependencies:\n- pip==23.3.1\n- setuptools==68.2.2\ndependencies:\n- -r requirements.txt\n",
        )
        .unwrap();
        fs::write(
            dir.join(REQUIREMENTS_FILE),
            "mlflow==2.9.2\nscikit-learn==1.3.1\n-c constraints.txt\n",
        )
        .unwrap();
        fs::write(dir.join(CONSTRAINTS_FILE), "numpy<2\n").unwrap();
    }

    fn step_names(plan: &EnvironmentPlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_virtualenv_plan() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());
        let env_root = temp_dir.path().join("envs");

        let spec = EnvironmentSpec::from_model_dir(temp_dir.path(), &[]).unwrap();
        let plan = spec
            .plan(EnvManager::Virtualenv, &PlanOptions::new(&env_root))
            .unwrap();

        assert_eq!(
            step_names(&plan),
            vec![STEP_CREATE, STEP_BUILD_DEPS, STEP_REQUIREMENTS]
        );
        let env_dir = plan.env_dir.clone().unwrap();
        assert!(env_dir.starts_with(&env_root));
        assert_eq!(plan.steps[0].command.program, "python3.10");

        let install = &plan.steps[2].command;
        assert_eq!(install.args[install.args.len() - 2..], ["-r", "requirements.txt"]);
        assert_eq!(install.working_dir.as_deref(), Some(temp_dir.path()));
        assert!(!plan.has_override_step());
    }

    #[test]
    fn test_overrides_are_a_separate_final_step() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());

        let spec = EnvironmentSpec::from_model_dir(
            temp_dir.path(),
            &["scikit-learn==1.4.0".to_string()],
        )
        .unwrap();
        let plan = spec
            .plan(EnvManager::Uv, &PlanOptions::new(temp_dir.path().join("envs")))
            .unwrap();

        assert_eq!(
            step_names(&plan),
            vec![STEP_CREATE, STEP_BUILD_DEPS, STEP_REQUIREMENTS, STEP_OVERRIDES]
        );
        let requirements = &plan.steps[2].command;
        assert!(!requirements.args.contains(&"scikit-learn==1.4.0".to_string()));
        let last = &plan.steps[3].command;
        assert_eq!(last.program, "uv");
        assert_eq!(last.args.last().map(String::as_str), Some("scikit-learn==1.4.0"));
        assert!(plan
            .effective_requirements
            .contains(&"scikit-learn==1.4.0".to_string()));
    }

    #[test]
    fn test_local_plan_has_no_steps() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());

        let spec = EnvironmentSpec::from_model_dir(temp_dir.path(), &[]).unwrap();
        let plan = spec
            .plan(
                EnvManager::Local,
                &PlanOptions::new(temp_dir.path()).host_python("/usr/bin/python3"),
            )
            .unwrap();
        assert!(plan.steps.is_empty());
        assert!(plan.env_dir.is_none());
        assert_eq!(plan.python, PathBuf::from("/usr/bin/python3"));
    }

    #[test]
    fn test_local_plan_rejects_overrides() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());

        let spec =
            EnvironmentSpec::from_model_dir(temp_dir.path(), &["pandas==2.0.3".to_string()])
                .unwrap();
        let err = spec
            .plan(EnvManager::Local, &PlanOptions::new(temp_dir.path()))
            .unwrap_err();
        assert!(matches!(
            err,
            ReconstructionError::OverridesUnsupported(EnvManager::Local)
        ));
    }

    #[test]
    fn test_conda_requires_conda_yaml() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());

        let spec = EnvironmentSpec::from_model_dir(temp_dir.path(), &[]).unwrap();
        let err = spec
            .plan(EnvManager::Conda, &PlanOptions::new(temp_dir.path()))
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::MissingCondaEnv(_)));
    }

    #[test]
    fn test_conda_plan_with_override() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());
        fs::write(
            temp_dir.path().join(CONDA_ENV_FILE),
            "name: mlflow-env\nchannels:\n- conda-forge\ndependencies:\n- python=3.10.12\n- pip:\n  - -r requirements.txt\n",
        )
        .unwrap();

        let spec =
            EnvironmentSpec::from_model_dir(temp_dir.path(), &["pandas==2.0.3".to_string()])
                .unwrap();
        let plan = spec
            .plan(EnvManager::Conda, &PlanOptions::new(temp_dir.path().join("envs")))
            .unwrap();
        assert_eq!(step_names(&plan), vec![STEP_CREATE, STEP_OVERRIDES]);
        assert_eq!(plan.steps[0].command.program, "conda");
    }

    #[test]
    fn test_pip_args_from_lines() {
        let lines = vec![
            RequirementLine::parse("pandas==2.0.3").unwrap().unwrap(),
            RequirementLine::parse("-c constraints.txt").unwrap().unwrap(),
            RequirementLine::parse("-e ./local").unwrap().unwrap(),
            RequirementLine::parse("--index-url https://example.org/simple")
                .unwrap()
                .unwrap(),
        ];
        assert_eq!(
            pip_args(&lines),
            vec![
                "pandas==2.0.3",
                "-c",
                "constraints.txt",
                "-e",
                "./local",
                "--index-url",
                "https://example.org/simple",
            ]
        );
    }

    #[test]
    fn test_timeout_applied_to_every_step() {
        let temp_dir = TempDir::new().unwrap();
        package(temp_dir.path());
        let spec = EnvironmentSpec::from_model_dir(temp_dir.path(), &[]).unwrap();
        let plan = spec
            .plan(
                EnvManager::Virtualenv,
                &PlanOptions::new(temp_dir.path()).timeout_ms(5_000),
            )
            .unwrap();
        assert!(plan.steps.iter().all(|s| s.command.timeout_ms == 5_000));
    }
}
