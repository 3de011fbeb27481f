use crate::error::LaplaceError;
use crate::likelihood::Likelihood;
use crate::prior::{PriorMean, PriorPrecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Options shared by every Laplace approximation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaplaceOptions {
    /// Default: regression
    pub likelihood: Likelihood,
    /// Observation noise σ; must stay 1 for classification. Default: 1.0
    pub sigma_noise: f64,
    /// Default: scalar 1.0
    pub prior_precision: PriorPrecision,
    /// Default: scalar 0.0
    pub prior_mean: PriorMean,
    /// Temperature T of the likelihood, `h = 1/(σ²T)`. Default: 1.0
    pub temperature: f64,
    /// Kronecker only: regularise each factor with the prior before
    /// forming the product. Default: false
    pub damping: bool,
    /// Seed of the generator behind every random draw. Default: 42
    pub seed: u64,
}

impl Default for LaplaceOptions {
    fn default() -> Self {
        LaplaceOptions {
            likelihood: Likelihood::Regression,
            sigma_noise: 1.0,
            prior_precision: PriorPrecision::Scalar(1.0),
            prior_mean: PriorMean::Scalar(0.0),
            temperature: 1.0,
            damping: false,
            seed: 42,
        }
    }
}

impl LaplaceOptions {
    pub fn regression() -> Self {
        Self::default()
    }

    pub fn classification() -> Self {
        Self {
            likelihood: Likelihood::Classification,
            ..Self::default()
        }
    }

    /// Scalar checks that need no model
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.sigma_noise.is_finite() && self.sigma_noise > 0.0) {
            return Err(LaplaceError::config("sigma_noise must be positive").into());
        }
        if self.likelihood == Likelihood::Classification && self.sigma_noise != 1.0 {
            return Err(LaplaceError::config(
                "sigma_noise cannot be used with a classification likelihood",
            )
            .into());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(LaplaceError::config("temperature must be positive").into());
        }
        Ok(())
    }
}

/// Options of the sparse GP dual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpOptions {
    /// Number of inducing points M. Default: all N training points
    pub n_inducing: Option<usize>,
    /// Independent GP per output channel. Default: false
    pub diagonal_kernel: bool,
    /// Keep only the diagonal of each likelihood-curvature block.
    /// Default: true
    pub diagonal_l: bool,
    /// Seed of the inducing-set draw. Default: 0
    pub subset_seed: u64,
}

impl Default for GpOptions {
    fn default() -> Self {
        GpOptions {
            n_inducing: None,
            diagonal_kernel: false,
            diagonal_l: true,
            subset_seed: 0,
        }
    }
}

/// How predictions are formed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredType {
    /// linearised model with the weight-space posterior
    Glm,
    /// the network itself evaluated at posterior samples
    Nn,
    /// the function-space GP posterior
    Gp,
}

impl FromStr for PredType {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "glm" => Ok(Self::Glm),
            "nn" => Ok(Self::Nn),
            "gp" => Ok(Self::Gp),
            _ => Err(LaplaceError::config(format!("Invalid prediction type {}", s))),
        }
    }
}

impl fmt::Display for PredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glm => write!(f, "glm"),
            Self::Nn => write!(f, "nn"),
            Self::Gp => write!(f, "gp"),
        }
    }
}

/// Curvature structure of a parametric approximation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    Full,
    Kron,
    Diag,
}

impl FromStr for StructureKind {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "kron" => Ok(Self::Kron),
            "diag" => Ok(Self::Diag),
            _ => Err(LaplaceError::config(format!("Invalid curvature structure {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_from_partial_json() -> anyhow::Result<()> {
        let opts: LaplaceOptions = serde_json::from_str(
            r#"{"likelihood": "classification", "prior_precision": {"PerLayer": [1.0, 2.0]}}"#,
        )?;
        assert_eq!(opts.likelihood, Likelihood::Classification);
        assert_eq!(opts.prior_precision, PriorPrecision::PerLayer(vec![1.0, 2.0]));
        assert_eq!(opts.sigma_noise, 1.0);
        assert_eq!(opts.seed, 42);
        opts.validate()?;

        let gp: GpOptions = serde_json::from_str(r#"{"n_inducing": 10}"#)?;
        assert_eq!(gp.n_inducing, Some(10));
        assert!(gp.diagonal_l);
        Ok(())
    }

    #[test]
    fn classification_rejects_noise() {
        let opts = LaplaceOptions {
            sigma_noise: 0.5,
            ..LaplaceOptions::classification()
        };
        assert!(opts.validate().is_err());
        assert!("gp".parse::<PredType>().is_ok());
        assert!("laplace".parse::<PredType>().is_err());
        assert!("block".parse::<StructureKind>().is_err());
    }
}
