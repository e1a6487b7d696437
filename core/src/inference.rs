//! Dependency inference
//!
//! Turns a flavor's default package set plus the modules observed while
//! loading (and optionally exercising) a model into a pinned pip
//! requirement list.

use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::flavor::Flavor;
use crate::probe::{PackageProbe, RuntimeSnapshot};
use crate::requirement::{canonicalize_name, Requirement};

/// Distribution the scoring runtime itself is published as
pub const MLFLOW_PACKAGE: &str = "mlflow";

/// Packages never emitted by inference: build tooling and the packager runtime
pub const EXCLUDED_PACKAGES: &[&str] = &[
    "pip",
    "setuptools",
    "wheel",
    "mlflow",
    "mlflow-skinny",
    "modelpack",
];

fn is_excluded(canonical: &str) -> bool {
    EXCLUDED_PACKAGES.iter().any(|p| *p == canonical)
}

/// Outcome of inference, with what was observed along the way
#[derive(Debug, Clone)]
pub struct InferredRequirements {
    pub requirements: Vec<Requirement>,
    /// Whether module capture ran; `false` means flavor defaults only
    pub captured: bool,
}

/// Infer the pip requirements of a model
///
/// `model_dir` must already hold the staged model (artifact + `MLmodel`)
/// so the probe can load it. Capture failures degrade to the flavor's
/// default packages with a warning.
pub fn infer_requirements(
    flavor: Flavor,
    model_dir: &Path,
    sample_input: Option<&Path>,
    snapshot: &RuntimeSnapshot,
    probe: &dyn PackageProbe,
) -> InferredRequirements {
    // canonical name -> published name
    let mut selected: BTreeMap<String, String> = BTreeMap::new();
    for package in flavor.default_packages() {
        let name = snapshot
            .packages
            .get(package)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| package.to_string());
        selected.insert(canonicalize_name(package), name);
    }

    let captured = match probe.imported_modules(model_dir, sample_input) {
        Ok(modules) => {
            let mut observed: BTreeMap<String, String> = BTreeMap::new();
            for module in &modules {
                for dist in snapshot.packages.distributions_for(module) {
                    let canonical = canonicalize_name(dist);
                    if is_excluded(&canonical) || selected.contains_key(&canonical) {
                        continue;
                    }
                    let name = snapshot
                        .packages
                        .get(dist)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| dist.clone());
                    observed.entry(canonical).or_insert(name);
                }
            }
            let defaults: Vec<String> = selected.keys().cloned().collect();
            prune_transitive(&mut observed, &defaults, snapshot);
            selected.extend(observed);
            true
        }
        Err(e) => {
            warn!(
                "Failed to capture imported modules for {} model, falling back to default requirements: {:#}",
                flavor, e
            );
            false
        }
    };

    let mut requirements = Vec::with_capacity(selected.len() + 1);
    requirements.push(pinned(MLFLOW_PACKAGE, snapshot));
    for name in selected.values() {
        requirements.push(pinned(name, snapshot));
    }

    info!(
        "Inferred {} requirements for {} model",
        requirements.len(),
        flavor
    );
    InferredRequirements {
        requirements,
        captured,
    }
}

/// Drop observed packages that something else in the list already installs
///
/// A package is implied when it is a recursive requirement of the scoring
/// runtime, of a flavor default, or of another observed package.
fn prune_transitive(
    observed: &mut BTreeMap<String, String>,
    defaults: &[String],
    snapshot: &RuntimeSnapshot,
) {
    let packages = &snapshot.packages;
    let mut implied = packages.requires_recursive(MLFLOW_PACKAGE);
    for root in defaults.iter().chain(observed.keys()) {
        implied.extend(packages.requires_recursive(root));
    }

    observed.retain(|canonical, name| {
        let keep = !implied.contains(canonical);
        if !keep {
            debug!("{} is installed by another requirement; not listing it", name);
        }
        keep
    });
}

/// `name==<installed version>`, or bare `name` when not installed
fn pinned(name: &str, snapshot: &RuntimeSnapshot) -> Requirement {
    let mut req = Requirement::Named {
        name: name.to_string(),
        extras: Vec::new(),
        clauses: Vec::new(),
        marker: None,
    };
    match snapshot.packages.version_of(name) {
        Some(version) => req.pin(version),
        None => debug!("{} is not installed; leaving it unpinned", name),
    }
    req
}
