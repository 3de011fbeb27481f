use crate::error::LaplaceError;
use matrix_util::dmatrix_util::softmax_rows;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

type Mat = DMatrix<f64>;

/// Observation model of the trained network.
///
/// * `Regression`: `y ~ N(f, σ² I)`, targets are `n x C` real matrices
/// * `Classification`: `y ~ Cat(softmax(f))`, targets are `n x 1`
///   matrices of class indexes stored as floats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Likelihood {
    Classification,
    Regression,
}

impl FromStr for Likelihood {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(Self::Classification),
            "regression" => Ok(Self::Regression),
            _ => Err(LaplaceError::config(format!("Invalid likelihood type {}", s))),
        }
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => write!(f, "classification"),
            Self::Regression => write!(f, "regression"),
        }
    }
}

impl Likelihood {
    pub fn is_regression(&self) -> bool {
        matches!(self, Self::Regression)
    }

    /// Summed training loss of one batch:
    /// `½ Σ‖y − f‖²` for regression (the unit-noise Gaussian negative
    /// log-likelihood without its normaliser), summed cross-entropy for
    /// classification
    pub fn loss(&self, ff: &Mat, yy: &Mat) -> anyhow::Result<f64> {
        match self {
            Self::Regression => {
                check_regression_targets(ff, yy)?;
                Ok(0.5 * (yy - ff).norm_squared())
            }
            Self::Classification => {
                let labels = class_labels(yy, ff.ncols())?;
                let probs = softmax_rows(ff);
                Ok(labels
                    .iter()
                    .enumerate()
                    .map(|(i, &k)| -probs[(i, k)].max(f64::MIN_POSITIVE).ln())
                    .sum())
            }
        }
    }

    /// `∂loss/∂f` for every example (`n x C`)
    pub fn output_gradient(&self, ff: &Mat, yy: &Mat) -> anyhow::Result<Mat> {
        match self {
            Self::Regression => {
                check_regression_targets(ff, yy)?;
                Ok(ff - yy)
            }
            Self::Classification => {
                let labels = class_labels(yy, ff.ncols())?;
                let mut grad = softmax_rows(ff);
                for (i, &k) in labels.iter().enumerate() {
                    grad[(i, k)] -= 1.0;
                }
                Ok(grad)
            }
        }
    }

    /// Hessian of the per-example loss with respect to the outputs
    /// `f` (`C x C`): the identity for regression, `diag(p) − p p'` for
    /// classification
    pub fn output_hessian(&self, f_row: &DVector<f64>) -> Mat {
        let cc = f_row.len();
        match self {
            Self::Regression => Mat::identity(cc, cc),
            Self::Classification => {
                let probs = softmax_rows(&Mat::from_row_slice(1, cc, f_row.as_slice()));
                let pp = probs.row(0).transpose();
                Mat::from_diagonal(&pp) - &pp * pp.transpose()
            }
        }
    }
}

fn check_regression_targets(ff: &Mat, yy: &Mat) -> anyhow::Result<()> {
    if ff.shape() != yy.shape() {
        return Err(LaplaceError::usage(format!(
            "regression targets [{} x {}] do not match outputs [{} x {}]",
            yy.nrows(),
            yy.ncols(),
            ff.nrows(),
            ff.ncols()
        ))
        .into());
    }
    Ok(())
}

/// Class indexes stored in the first column of `yy`
pub fn class_labels(yy: &Mat, n_classes: usize) -> anyhow::Result<Vec<usize>> {
    if yy.ncols() != 1 {
        return Err(LaplaceError::usage(format!(
            "classification targets must be a single column of class indexes, got {} columns",
            yy.ncols()
        ))
        .into());
    }
    yy.column(0)
        .iter()
        .map(|&y| {
            let k = y.round();
            if (y - k).abs() > 1e-8 || k < 0.0 || k as usize >= n_classes {
                Err(LaplaceError::usage(format!("invalid class label {}", y)).into())
            } else {
                Ok(k as usize)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn unknown_likelihood_is_a_configuration_error() {
        let err = "poisson".parse::<Likelihood>().unwrap_err();
        assert!(matches!(err, LaplaceError::Configuration(_)));
        assert_eq!(
            "Regression".parse::<Likelihood>().unwrap(),
            Likelihood::Regression
        );
    }

    #[test]
    fn classification_hessian_rows_sum_to_zero() {
        let ff = DVector::from_vec(vec![0.3, -1.2, 2.0]);
        let hh = Likelihood::Classification.output_hessian(&ff);
        for row in hh.row_iter() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(hh, hh.transpose(), epsilon = 1e-15);
    }

    #[test]
    fn cross_entropy_of_uniform_logits() -> anyhow::Result<()> {
        let ff = Mat::zeros(4, 3);
        let yy = Mat::from_column_slice(4, 1, &[0.0, 1.0, 2.0, 1.0]);
        let loss = Likelihood::Classification.loss(&ff, &yy)?;
        assert_abs_diff_eq!(loss, 4.0 * 3f64.ln(), epsilon = 1e-12);

        let bad = Mat::from_column_slice(1, 1, &[3.0]);
        assert!(Likelihood::Classification
            .loss(&Mat::zeros(1, 3), &bad)
            .is_err());
        Ok(())
    }
}
