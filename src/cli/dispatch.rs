//! Command dispatch
//!
//! Each command resolves the configuration, builds its collaborators
//! (probe, runner, builder) and maps failures to exit codes.

use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use modelpack_core::{ModelDescriptor, ModelPackager, PythonProbe, SaveOptions};

use crate::cli::args::{
    BuildDockerArgs, EnvArgs, EnvironmentArgs, PredictArgs, SaveArgs, ServeArgs,
};
use crate::cli::{Args, Command, Error, Result, EXIT_SUCCESS};
use crate::config::PackagerConfig;
use crate::docker::{build_docker, DockerOptions};
use crate::reconstruction::{
    reconstruct, CommandRunner, EnvManager, EnvironmentBuilder, EnvironmentSpec, PlanOptions,
    ProcessRunner,
};
use crate::scoring::{predict, Scorer};
use crate::serve::{ScoringServer, ServeState};

/// Exit code wrapper for CLI operations
pub type ExitCode = i32;

/// Run a parsed command line and return the exit code
pub fn run(args: Args) -> ExitCode {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    match run_command(args, runner) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

/// Run with an explicit command runner
pub fn run_command(args: Args, runner: Arc<dyn CommandRunner>) -> Result<()> {
    let config = PackagerConfig::resolve(args.config.as_deref())?;

    match args.command {
        Command::Save(save) => run_save(&config, save),
        Command::Predict(predict) => run_predict(&config, predict, runner),
        Command::Serve(serve) => run_serve(&config, serve, runner),
        Command::BuildDocker(docker) => run_build_docker(docker, runner.as_ref()),
        Command::Env(env) => run_env(&config, env, runner),
    }
}

fn run_save(config: &PackagerConfig, args: SaveArgs) -> Result<()> {
    let mut pip_requirements = args.pip_requirements;
    if let Some(file) = &args.pip_requirements_file {
        pip_requirements.push(format!("-r {}", file.display()));
    }

    let mut options = SaveOptions::new(args.flavor, &args.model).overwrite(args.overwrite);
    if !pip_requirements.is_empty() {
        options = options.pip_requirements(pip_requirements);
    }
    if !args.extra_pip_requirements.is_empty() {
        options = options.extra_pip_requirements(args.extra_pip_requirements);
    }
    if let Some(conda_env) = &args.conda_env {
        options = options.conda_env(conda_env);
    }
    for path in args.code_paths {
        options = options.code_path(path);
    }
    if let Some(example) = &args.input_example {
        options = options.sample_input(read_json(example)?);
    }
    options.metadata.extend(args.metadata);

    let probe = PythonProbe::new(config.python.clone(), config.probe_timeout_ms());
    let packager = ModelPackager::new(Box::new(probe))
        .with_conda_channels(config.conda_channels.clone())
        .with_conda_env_name(config.conda_env_name.clone());

    let saved = packager.save(&args.output, &options)?;
    if saved.inference_captured == Some(false) {
        warn!("Model imports could not be captured; requirements fall back to flavor defaults");
    }
    info!("Saved {}: {}", saved.path.display(), saved.manifest.summary());
    println!("{}", saved.path.display());
    Ok(())
}

fn plan_options(config: &PackagerConfig) -> PlanOptions {
    PlanOptions::new(config.env_root())
        .host_python(config.python.clone())
        .timeout_ms(config.install_timeout_ms())
}

fn env_manager(config: &PackagerConfig, args: &EnvironmentArgs) -> EnvManager {
    args.env_manager.unwrap_or(config.default_env_manager)
}

fn run_predict(
    config: &PackagerConfig,
    args: PredictArgs,
    runner: Arc<dyn CommandRunner>,
) -> Result<()> {
    let input = if args.input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        serde_json::from_str(&buf)
            .map_err(|e| Error::InvalidArgs(format!("stdin is not valid JSON: {}", e)))?
    } else {
        read_json(&args.input)?
    };

    let builder = EnvironmentBuilder::new(runner);
    let predictions = predict(
        &args.env.model,
        &input,
        env_manager(config, &args.env),
        &args.env.overrides,
        &plan_options(config),
        &builder,
    )?;

    let rendered = serde_json::to_string(&predictions)?;
    match &args.output {
        Some(path) => {
            fs::write(path, rendered)?;
            info!("Wrote predictions to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn run_serve(
    config: &PackagerConfig,
    args: ServeArgs,
    runner: Arc<dyn CommandRunner>,
) -> Result<()> {
    let mut serve_config = config.serve.clone();
    if let Some(host) = args.host {
        serve_config.host = host;
    }
    if let Some(port) = args.port {
        serve_config.port = port;
    }
    if let Some(workers) = args.workers {
        serve_config.workers = workers;
    }

    let builder = EnvironmentBuilder::new(runner.clone());
    let (_, env) = reconstruct(
        &args.env.model,
        env_manager(config, &args.env),
        &args.env.overrides,
        &plan_options(config),
        &builder,
    )?;

    let model_uuid = ModelDescriptor::load(&args.env.model)
        .ok()
        .map(|d| d.model_uuid);
    let scorer = Scorer::for_environment(runner, &env, &args.env.model)
        .timeout_ms(serve_config.scoring_timeout_secs.saturating_mul(1000));
    let workers = serve_config.workers;
    let server = ScoringServer::new(serve_config, ServeState::new(scorer, model_uuid, workers));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(server.start())
        .map_err(|e| Error::Server(format!("{:#}", e)))
}

fn run_build_docker(args: BuildDockerArgs, runner: &dyn CommandRunner) -> Result<()> {
    let mut options = DockerOptions::new(&args.model, &args.context);
    options.image_name = args.name;
    options.build = args.build;

    let context = build_docker(&options, runner)?;
    println!("{}", context.context_dir.display());
    Ok(())
}

fn run_env(config: &PackagerConfig, args: EnvArgs, runner: Arc<dyn CommandRunner>) -> Result<()> {
    let spec = EnvironmentSpec::from_model_dir(&args.env.model, &args.env.overrides)?;
    let plan = spec.plan(env_manager(config, &args.env), &plan_options(config))?;

    if args.provision {
        let prepared = EnvironmentBuilder::new(runner).provision(&plan)?;
        info!("Environment ready: {}", prepared.python.display());
    }

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidArgs(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::InvalidArgs(format!("{} is not valid JSON: {}", path.display(), e)))
}
