//! Modelpack Core
//!
//! Model dependency manifests: parsing pip requirements, inferring what a
//! model needs from the Python runtime it is saved from, and writing the
//! package files (`MLmodel`, `python_env.yaml`, `requirements.txt`,
//! `conda.yaml`, `code/`) that later rebuild that runtime.

pub mod builder;
pub mod code_paths;
pub mod descriptor;
pub mod flavor;
pub mod fs_util;
pub mod inference;
pub mod manifest;
pub mod probe;
pub mod process;
pub mod requirement;

pub use builder::{ModelPackager, SaveError, SaveOptions, SavedModel};
pub use code_paths::CodePathError;
pub use descriptor::{ModelDescriptor, CODE_DIR, INPUT_EXAMPLE_FILE, MLMODEL_FILE};
pub use flavor::{Flavor, UnknownFlavor};
pub use manifest::{
    CondaDependency, CondaEnv, DependencyManifest, ManifestError, PythonEnv, CONDA_ENV_FILE,
    CONSTRAINTS_FILE, PYTHON_ENV_FILE, REQUIREMENTS_FILE,
};
pub use probe::{InstalledPackages, PackageProbe, PythonProbe, RuntimeSnapshot, StaticProbe};
pub use process::{run_process, ProcessArgs, ProcessResult};
pub use requirement::{Requirement, RequirementError, RequirementLine};
