//! `MLmodel` descriptor
//!
//! Top-level YAML file of a packaged model recording which flavors can load
//! it and which packaging conventions (environment files, code directory,
//! input example) were used.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::flavor::Flavor;
use crate::fs_util::write_atomic;
use crate::manifest::{CONDA_ENV_FILE, PYTHON_ENV_FILE};

pub const MLMODEL_FILE: &str = "MLmodel";
pub const INPUT_EXAMPLE_FILE: &str = "input_example.json";
pub const CODE_DIR: &str = "code";

/// Environment files referenced from the pyfunc flavor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFiles {
    pub conda: String,
    pub virtualenv: String,
}

impl Default for EnvFiles {
    fn default() -> Self {
        Self {
            conda: CONDA_ENV_FILE.to_string(),
            virtualenv: PYTHON_ENV_FILE.to_string(),
        }
    }
}

/// Generic `python_function` flavor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyFuncConfig {
    pub loader_module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    pub env: EnvFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub python_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavors {
    pub python_function: PyFuncConfig,
    #[serde(flatten)]
    pub others: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputExampleInfo {
    pub artifact_path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Contents of the `MLmodel` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub flavors: Flavors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mlflow_version: Option<String>,
    pub model_uuid: String,
    pub utc_time_created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_input_example_info: Option<InputExampleInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Inputs for a fresh descriptor
#[derive(Debug, Clone)]
pub struct DescriptorInputs<'a> {
    pub flavor: Flavor,
    /// File or directory name of the model artifact inside the package
    pub model_path: Option<&'a str>,
    pub python_version: &'a str,
    pub has_code: bool,
    pub mlflow_version: Option<&'a str>,
    /// Installed version of the flavor's primary library
    pub flavor_library_version: Option<&'a str>,
    pub has_input_example: bool,
    pub metadata: BTreeMap<String, String>,
}

impl ModelDescriptor {
    pub fn new(inputs: DescriptorInputs<'_>) -> Self {
        let code = inputs.has_code.then(|| CODE_DIR.to_string());

        let mut others = BTreeMap::new();
        if inputs.flavor != Flavor::PythonFunction {
            let mut flavor_conf = serde_yaml::Mapping::new();
            flavor_conf.insert(
                "code".into(),
                code.clone().map(Into::into).unwrap_or(serde_yaml::Value::Null),
            );
            if let Some(path) = inputs.model_path {
                flavor_conf.insert("model_path".into(), path.into());
            }
            if let Some(version) = inputs.flavor_library_version {
                flavor_conf.insert(
                    format!("{}_version", inputs.flavor.name()).into(),
                    version.into(),
                );
            }
            others.insert(
                inputs.flavor.name().to_string(),
                serde_yaml::Value::Mapping(flavor_conf),
            );
        }

        Self {
            artifact_path: None,
            flavors: Flavors {
                python_function: PyFuncConfig {
                    loader_module: inputs.flavor.loader_module().to_string(),
                    model_path: inputs.model_path.map(str::to_string),
                    env: EnvFiles::default(),
                    code,
                    python_version: inputs.python_version.to_string(),
                },
                others,
            },
            mlflow_version: inputs.mlflow_version.map(str::to_string),
            model_uuid: Uuid::new_v4().simple().to_string(),
            utc_time_created: Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            saved_input_example_info: inputs.has_input_example.then(|| InputExampleInfo {
                artifact_path: INPUT_EXAMPLE_FILE.to_string(),
                kind: "json_object".to_string(),
            }),
            metadata: inputs.metadata,
        }
    }

    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MLMODEL_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn write(&self, model_dir: &Path) -> Result<()> {
        let path = model_dir.join(MLMODEL_FILE);
        let content = serde_yaml::to_string(self).context("Failed to serialize MLmodel")?;
        write_atomic(&path, content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Names of all flavors able to load the model
    pub fn flavor_names(&self) -> Vec<&str> {
        let mut names = vec!["python_function"];
        names.extend(self.flavors.others.keys().map(String::as_str));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn inputs() -> DescriptorInputs<'static> {
        DescriptorInputs {
            flavor: Flavor::Sklearn,
            model_path: Some("model.pkl"),
            python_version: "3.10.12",
            has_code: true,
            mlflow_version: Some("2.9.2"),
            flavor_library_version: Some("1.3.1"),
            has_input_example: true,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_descriptor_fields() {
        let descriptor = ModelDescriptor::new(inputs());
        let pyfunc = &descriptor.flavors.python_function;
        assert_eq!(pyfunc.loader_module, "mlflow.sklearn");
        assert_eq!(pyfunc.code.as_deref(), Some("code"));
        assert_eq!(pyfunc.env.virtualenv, "python_env.yaml");
        assert_eq!(descriptor.flavor_names(), vec!["python_function", "sklearn"]);
        assert_eq!(descriptor.model_uuid.len(), 32);
        assert_eq!(
            descriptor.saved_input_example_info.as_ref().unwrap().artifact_path,
            "input_example.json"
        );
    }

    #[test]
    fn test_write_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = ModelDescriptor::new(inputs());
        descriptor.write(temp_dir.path()).unwrap();

        let content = fs::read_to_string(temp_dir.path().join(MLMODEL_FILE)).unwrap();
        assert!(content.contains("sklearn_version: 1.3.1"));
        assert!(content.contains("loader_module: mlflow.sklearn"));

        let loaded = ModelDescriptor::load(temp_dir.path()).unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[test]
    fn test_pyfunc_flavor_has_no_extra_entry() {
        let mut inputs = inputs();
        inputs.flavor = Flavor::PythonFunction;
        inputs.has_code = false;
        let descriptor = ModelDescriptor::new(inputs);
        assert!(descriptor.flavors.others.is_empty());
        assert!(descriptor.flavors.python_function.code.is_none());
    }
}
