//! Model flavors
//!
//! A flavor names the integration adapter that logged a model. It decides
//! the loader module recorded in `MLmodel` and the packages every model of
//! that flavor needs regardless of what inference observes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unknown flavor '{0}'")]
pub struct UnknownFlavor(pub String);

/// Supported model flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    Sklearn,
    Xgboost,
    Lightgbm,
    Pytorch,
    Tensorflow,
    Keras,
    Transformers,
    Onnx,
    Statsmodels,
    Prophet,
    PythonFunction,
}

impl Flavor {
    pub const ALL: [Flavor; 11] = [
        Flavor::Sklearn,
        Flavor::Xgboost,
        Flavor::Lightgbm,
        Flavor::Pytorch,
        Flavor::Tensorflow,
        Flavor::Keras,
        Flavor::Transformers,
        Flavor::Onnx,
        Flavor::Statsmodels,
        Flavor::Prophet,
        Flavor::PythonFunction,
    ];

    /// Identifier written as the flavor key in `MLmodel`
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::Sklearn => "sklearn",
            Flavor::Xgboost => "xgboost",
            Flavor::Lightgbm => "lightgbm",
            Flavor::Pytorch => "pytorch",
            Flavor::Tensorflow => "tensorflow",
            Flavor::Keras => "keras",
            Flavor::Transformers => "transformers",
            Flavor::Onnx => "onnx",
            Flavor::Statsmodels => "statsmodels",
            Flavor::Prophet => "prophet",
            Flavor::PythonFunction => "python_function",
        }
    }

    /// Python module exposing `_load_pyfunc` for this flavor
    pub fn loader_module(&self) -> &'static str {
        match self {
            Flavor::Sklearn => "mlflow.sklearn",
            Flavor::Xgboost => "mlflow.xgboost",
            Flavor::Lightgbm => "mlflow.lightgbm",
            Flavor::Pytorch => "mlflow.pytorch",
            Flavor::Tensorflow => "mlflow.tensorflow",
            Flavor::Keras => "mlflow.keras",
            Flavor::Transformers => "mlflow.transformers",
            Flavor::Onnx => "mlflow.onnx",
            Flavor::Statsmodels => "mlflow.statsmodels",
            Flavor::Prophet => "mlflow.prophet",
            Flavor::PythonFunction => "mlflow.pyfunc.model",
        }
    }

    /// Packages the flavor always needs at load time
    pub fn default_packages(&self) -> &'static [&'static str] {
        match self {
            Flavor::Sklearn => &["scikit-learn", "cloudpickle"],
            Flavor::Xgboost => &["xgboost"],
            Flavor::Lightgbm => &["lightgbm"],
            Flavor::Pytorch => &["torch", "cloudpickle"],
            Flavor::Tensorflow => &["tensorflow"],
            Flavor::Keras => &["keras"],
            Flavor::Transformers => &["transformers"],
            Flavor::Onnx => &["onnx", "onnxruntime"],
            Flavor::Statsmodels => &["statsmodels"],
            Flavor::Prophet => &["prophet"],
            Flavor::PythonFunction => &["cloudpickle"],
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Flavor {
    type Err = UnknownFlavor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let flavor = match s.to_lowercase().replace('-', "_").as_str() {
            "sklearn" | "scikit_learn" => Flavor::Sklearn,
            "xgboost" => Flavor::Xgboost,
            "lightgbm" => Flavor::Lightgbm,
            "pytorch" | "torch" => Flavor::Pytorch,
            "tensorflow" | "tf" => Flavor::Tensorflow,
            "keras" => Flavor::Keras,
            "transformers" => Flavor::Transformers,
            "onnx" => Flavor::Onnx,
            "statsmodels" => Flavor::Statsmodels,
            "prophet" => Flavor::Prophet,
            "python_function" | "pyfunc" => Flavor::PythonFunction,
            _ => return Err(UnknownFlavor(s.to_string())),
        };
        Ok(flavor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!("scikit-learn".parse::<Flavor>().unwrap(), Flavor::Sklearn);
        assert_eq!("torch".parse::<Flavor>().unwrap(), Flavor::Pytorch);
        assert_eq!("PyFunc".parse::<Flavor>().unwrap(), Flavor::PythonFunction);
        assert!("caffe".parse::<Flavor>().is_err());
    }

    #[test]
    fn test_names_round_trip() {
        for flavor in Flavor::ALL {
            assert_eq!(flavor.name().parse::<Flavor>().unwrap(), flavor);
            assert!(!flavor.default_packages().is_empty());
        }
    }
}
