//! Gaussian prior `N(mean, diag(precision)^{-1})` over the flat
//! parameter vector.

use crate::error::LaplaceError;
use crate::model::ParamLayout;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

type DVec = DVector<f64>;

/// Prior precision in one of three shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PriorPrecision {
    Scalar(f64),
    /// one value per parameter group
    PerLayer(Vec<f64>),
    /// one value per parameter
    PerParameter(Vec<f64>),
}

impl PriorPrecision {
    /// Classify a raw vector by its length: 1 is a scalar, `P` is per
    /// parameter, `L` is per layer. Any other length is rejected.
    pub fn from_vec(values: Vec<f64>, layout: &ParamLayout) -> anyhow::Result<Self> {
        let ret = match values.len() {
            1 => Self::Scalar(values[0]),
            n if n == layout.n_params() => Self::PerParameter(values),
            n if n == layout.n_layers() => Self::PerLayer(values),
            n => {
                return Err(LaplaceError::config(format!(
                    "prior precision of length {} fits neither 1, L = {} nor P = {}",
                    n,
                    layout.n_layers(),
                    layout.n_params()
                ))
                .into())
            }
        };
        Ok(ret)
    }

    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Scalar(x) => vec![*x],
            Self::PerLayer(v) | Self::PerParameter(v) => v.clone(),
        }
    }

    pub fn is_per_parameter(&self) -> bool {
        matches!(self, Self::PerParameter(_))
    }

    /// Same shape, new values
    pub fn with_values(&self, values: &[f64]) -> anyhow::Result<Self> {
        let expected = self.values().len();
        if values.len() != expected {
            return Err(LaplaceError::config(format!(
                "expected {} prior precision values, got {}",
                expected,
                values.len()
            ))
            .into());
        }
        Ok(match self {
            Self::Scalar(_) => Self::Scalar(values[0]),
            Self::PerLayer(_) => Self::PerLayer(values.to_vec()),
            Self::PerParameter(_) => Self::PerParameter(values.to_vec()),
        })
    }

    fn check(&self, layout: &ParamLayout) -> anyhow::Result<()> {
        let values = self.values();
        let ok_len = match self {
            Self::Scalar(_) => true,
            Self::PerLayer(v) => v.len() == layout.n_layers(),
            Self::PerParameter(v) => v.len() == layout.n_params(),
        };
        if !ok_len {
            return Err(LaplaceError::config(format!(
                "prior precision of length {} does not match the parameter layout",
                values.len()
            ))
            .into());
        }
        if values.iter().any(|x| !x.is_finite() || *x <= 0.0) {
            return Err(
                LaplaceError::config("prior precision must be positive and finite").into(),
            );
        }
        Ok(())
    }
}

/// Prior mean, a scalar or one value per parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PriorMean {
    Scalar(f64),
    PerParameter(Vec<f64>),
}

impl PriorMean {
    pub fn from_vec(values: Vec<f64>, layout: &ParamLayout) -> anyhow::Result<Self> {
        match values.len() {
            1 => Ok(Self::Scalar(values[0])),
            n if n == layout.n_params() => Ok(Self::PerParameter(values)),
            n => Err(LaplaceError::config(format!(
                "prior mean of length {} fits neither 1 nor P = {}",
                n,
                layout.n_params()
            ))
            .into()),
        }
    }
}

/// Prior precision and mean checked against a parameter layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    precision: PriorPrecision,
    mean: PriorMean,
    layout: ParamLayout,
}

impl PriorSpec {
    pub fn new(
        precision: PriorPrecision,
        mean: PriorMean,
        layout: &ParamLayout,
    ) -> anyhow::Result<Self> {
        precision.check(layout)?;
        check_mean(&mean, layout.n_params())?;
        Ok(Self {
            precision,
            mean,
            layout: layout.clone(),
        })
    }

    pub fn n_params(&self) -> usize {
        self.layout.n_params()
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn precision(&self) -> &PriorPrecision {
        &self.precision
    }

    pub fn mean(&self) -> &PriorMean {
        &self.mean
    }

    pub fn set_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()> {
        precision.check(&self.layout)?;
        self.precision = precision;
        Ok(())
    }

    pub fn set_mean(&mut self, mean: PriorMean) -> anyhow::Result<()> {
        check_mean(&mean, self.n_params())?;
        self.mean = mean;
        Ok(())
    }

    /// Per-parameter prior precision, length `P`
    pub fn expand_precision(&self) -> DVec {
        match &self.precision {
            PriorPrecision::Scalar(x) => DVec::from_element(self.n_params(), *x),
            PriorPrecision::PerLayer(v) => DVec::from_iterator(
                self.n_params(),
                self.layout
                    .sizes()
                    .into_iter()
                    .zip(v.iter())
                    .flat_map(|(n, &x)| std::iter::repeat_n(x, n)),
            ),
            PriorPrecision::PerParameter(v) => DVec::from_column_slice(v),
        }
    }

    /// Per-parameter prior mean, length `P`
    pub fn expand_mean(&self) -> DVec {
        match &self.mean {
            PriorMean::Scalar(x) => DVec::from_element(self.n_params(), *x),
            PriorMean::PerParameter(v) => DVec::from_column_slice(v),
        }
    }

    /// `log det diag(precision)`
    pub fn log_det(&self) -> f64 {
        self.expand_precision().iter().map(|x| x.ln()).sum()
    }

    /// Sum a per-parameter quantity back onto the precision's own
    /// shape: identity per parameter, group sums per layer, the total
    /// for a scalar.
    pub fn reduce(&self, per_param: &DVec) -> Vec<f64> {
        match &self.precision {
            PriorPrecision::Scalar(_) => vec![per_param.sum()],
            PriorPrecision::PerLayer(_) => {
                let mut lb = 0;
                self.layout
                    .sizes()
                    .into_iter()
                    .map(|n| {
                        let s = per_param.rows(lb, n).sum();
                        lb += n;
                        s
                    })
                    .collect()
            }
            PriorPrecision::PerParameter(_) => per_param.iter().copied().collect(),
        }
    }
}

fn check_mean(mean: &PriorMean, n_params: usize) -> anyhow::Result<()> {
    let values = match mean {
        PriorMean::Scalar(x) => vec![*x],
        PriorMean::PerParameter(v) => {
            if v.len() != n_params {
                return Err(LaplaceError::config(format!(
                    "prior mean of length {} does not match P = {}",
                    v.len(),
                    n_params
                ))
                .into());
            }
            v.clone()
        }
    };
    if values.iter().any(|x| !x.is_finite()) {
        return Err(LaplaceError::config("prior mean must be finite").into());
    }
    Ok(())
}
