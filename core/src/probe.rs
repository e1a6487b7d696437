//! Runtime introspection
//!
//! A [`PackageProbe`] answers two questions about the Python runtime a model
//! is saved from: which distributions are installed (and at which
//! versions), and which top-level modules get imported when the model is
//! loaded and, given a sample input, asked to predict.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

use crate::process::{run_process, ProcessArgs};
use crate::requirement::canonicalize_name;

/// An installed distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Distribution name as published
    pub name: String,
    pub version: String,
}

/// Installed distributions keyed by canonical name, plus the module map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackages {
    packages: BTreeMap<String, InstalledPackage>,
    /// Top-level import name -> distributions providing it
    modules: BTreeMap<String, Vec<String>>,
    /// Canonical name -> canonical names of its unconditional requirements
    #[serde(default)]
    requires: BTreeMap<String, Vec<String>>,
}

impl InstalledPackages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.packages.insert(
            canonicalize_name(name),
            InstalledPackage {
                name: name.to_string(),
                version: version.to_string(),
            },
        );
    }

    pub fn map_module(&mut self, module: &str, distribution: &str) {
        let dists = self.modules.entry(module.to_string()).or_default();
        if !dists.iter().any(|d| d == distribution) {
            dists.push(distribution.to_string());
        }
    }

    /// Record that `distribution` requires `dependency`
    pub fn add_dependency(&mut self, distribution: &str, dependency: &str) {
        let dependency = canonicalize_name(dependency);
        let deps = self
            .requires
            .entry(canonicalize_name(distribution))
            .or_default();
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
    }

    /// Everything `name` pulls in when installed, excluding itself
    pub fn requires_recursive(&self, name: &str) -> BTreeSet<String> {
        let root = canonicalize_name(name);
        let mut seen = BTreeSet::new();
        let mut pending = vec![root.clone()];
        while let Some(current) = pending.pop() {
            for dep in self.requires.get(&current).into_iter().flatten() {
                if *dep != root && seen.insert(dep.clone()) {
                    pending.push(dep.clone());
                }
            }
        }
        seen
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.get(&canonicalize_name(name))
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.get(name).map(|p| p.version.as_str())
    }

    /// Distributions providing a top-level module; empty for stdlib or unknown modules
    pub fn distributions_for(&self, module: &str) -> &[String] {
        self.modules.get(module).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// State of the Python runtime at save time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub python_version: String,
    pub packages: InstalledPackages,
}

/// Introspects the Python runtime a model is saved from
pub trait PackageProbe {
    /// Interpreter version and installed distributions
    fn snapshot(&self) -> Result<RuntimeSnapshot>;

    /// Top-level modules imported while loading the packaged model at
    /// `model_dir` and, when `sample_input` is given, running `predict` on it
    fn imported_modules(&self, model_dir: &Path, sample_input: Option<&Path>)
        -> Result<Vec<String>>;
}

const SNAPSHOT_SCRIPT: &str = r#"
import json, re, sys
import importlib.metadata as md
NAME = re.compile(r"[A-Za-z0-9][A-Za-z0-9._-]*")
packages = {}
requires = {}
for dist in md.distributions():
    name = dist.metadata.get("Name")
    if not name:
        continue
    packages[name] = dist.version
    deps = []
    for req in dist.requires or []:
        spec, _, marker = req.partition(";")
        if "extra" in marker:
            continue
        match = NAME.match(spec.strip())
        if match:
            deps.append(match.group(0))
    requires[name] = deps
modules = md.packages_distributions() if hasattr(md, "packages_distributions") else {}
json.dump({
    "python_version": "%d.%d.%d" % sys.version_info[:3],
    "packages": packages,
    "modules": modules,
    "requires": requires,
}, sys.stdout)
"#;

// Only imports made inside load_model/predict are recorded; whatever
// `import mlflow.pyfunc` pulled in beforehand is not.
const CAPTURE_SCRIPT: &str = r#"
import builtins, json, sys
model_dir = sys.argv[1]
import mlflow.pyfunc

captured = set()
real_import = builtins.__import__

def recording_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0:
        top = name.partition(".")[0]
        if top and not top.startswith("_"):
            captured.add(top)
    return real_import(name, globals, locals, fromlist, level)

def recorded(fn, *args):
    builtins.__import__ = recording_import
    try:
        return fn(*args)
    finally:
        builtins.__import__ = real_import

model = recorded(mlflow.pyfunc.load_model, model_dir)
if len(sys.argv) > 2:
    with open(sys.argv[2]) as f:
        payload = json.load(f)
    try:
        import pandas as pd
        if isinstance(payload, dict) and "columns" in payload and "data" in payload:
            payload = pd.DataFrame(payload["data"], columns=payload["columns"])
        elif isinstance(payload, list) and payload and isinstance(payload[0], dict):
            payload = pd.DataFrame(payload)
    except ImportError:
        pass
    recorded(model.predict, payload)
json.dump({"modules": sorted(captured)}, sys.stdout)
"#;

#[derive(Deserialize)]
struct SnapshotOutput {
    python_version: String,
    packages: BTreeMap<String, String>,
    #[serde(default)]
    modules: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    requires: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct CaptureOutput {
    modules: Vec<String>,
}

/// Probe backed by a real Python interpreter subprocess
#[derive(Debug, Clone)]
pub struct PythonProbe {
    python: String,
    timeout_ms: u64,
}

impl PythonProbe {
    pub fn new(python: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            python: python.into(),
            timeout_ms,
        }
    }

    fn run_script(&self, script: &str, extra_args: &[String]) -> Result<String> {
        let args = ProcessArgs::new(&self.python)
            .arg("-c")
            .arg(script)
            .args(extra_args.iter().cloned())
            .timeout_ms(self.timeout_ms);
        let result = run_process(&args, None)
            .with_context(|| format!("Failed to start Python interpreter '{}'", self.python))?;
        if !result.success() {
            return Err(anyhow!(
                "Python probe exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
        }
        Ok(result.stdout)
    }
}

impl PackageProbe for PythonProbe {
    fn snapshot(&self) -> Result<RuntimeSnapshot> {
        let stdout = self.run_script(SNAPSHOT_SCRIPT, &[])?;
        let output: SnapshotOutput =
            serde_json::from_str(&stdout).context("Failed to parse runtime snapshot")?;

        let mut packages = InstalledPackages::new();
        for (name, version) in &output.packages {
            packages.insert(name, version);
        }
        for (module, dists) in &output.modules {
            for dist in dists {
                packages.map_module(module, dist);
            }
        }
        for (dist, deps) in &output.requires {
            for dep in deps {
                packages.add_dependency(dist, dep);
            }
        }

        info!(
            "Probed Python {} with {} installed distributions",
            output.python_version,
            packages.len()
        );
        Ok(RuntimeSnapshot {
            python_version: output.python_version,
            packages,
        })
    }

    fn imported_modules(
        &self,
        model_dir: &Path,
        sample_input: Option<&Path>,
    ) -> Result<Vec<String>> {
        let mut args = vec![model_dir.display().to_string()];
        if let Some(input) = sample_input {
            args.push(input.display().to_string());
        }
        let stdout = self.run_script(CAPTURE_SCRIPT, &args)?;
        let output: CaptureOutput =
            serde_json::from_str(&stdout).context("Failed to parse captured modules")?;
        debug!("Captured {} imported modules", output.modules.len());
        Ok(output.modules)
    }
}

/// Probe with a fixed answer, for offline packaging and tests
#[derive(Debug, Clone)]
pub struct StaticProbe {
    snapshot: RuntimeSnapshot,
    load_modules: BTreeSet<String>,
    predict_modules: BTreeSet<String>,
    fail_capture: bool,
}

impl StaticProbe {
    pub fn new(python_version: &str, packages: InstalledPackages) -> Self {
        Self {
            snapshot: RuntimeSnapshot {
                python_version: python_version.to_string(),
                packages,
            },
            load_modules: BTreeSet::new(),
            predict_modules: BTreeSet::new(),
            fail_capture: false,
        }
    }

    /// Modules imported when the model is loaded
    pub fn with_load_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.load_modules.extend(modules.into_iter().map(Into::into));
        self
    }

    /// Modules imported only along the predict path
    pub fn with_predict_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predict_modules
            .extend(modules.into_iter().map(Into::into));
        self
    }

    /// Make module capture fail, as a crashing model load would
    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }
}

impl PackageProbe for StaticProbe {
    fn snapshot(&self) -> Result<RuntimeSnapshot> {
        Ok(self.snapshot.clone())
    }

    fn imported_modules(
        &self,
        _model_dir: &Path,
        sample_input: Option<&Path>,
    ) -> Result<Vec<String>> {
        if self.fail_capture {
            return Err(anyhow!("model failed to load"));
        }
        let mut modules = self.load_modules.clone();
        if sample_input.is_some() {
            modules.extend(self.predict_modules.iter().cloned());
        }
        Ok(modules.into_iter().collect())
    }
}
