//! Class probabilities from a Gaussian over logits.

use crate::error::LaplaceError;
use log::warn;
use matrix_util::dmatrix_util::{rnorm_vec, softmax_rows};
use matrix_util::traits::PrecisionOps;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkApprox {
    /// Monte-Carlo average of soft-maxed logit samples
    Mc,
    /// soft-max of variance-scaled means
    Probit,
    /// Laplace bridge to a Dirichlet
    Bridge,
}

impl FromStr for LinkApprox {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mc" => Ok(Self::Mc),
            "probit" => Ok(Self::Probit),
            "bridge" => Ok(Self::Bridge),
            _ => Err(LaplaceError::config(format!(
                "Unsupported link approximation {}",
                s
            ))),
        }
    }
}

impl fmt::Display for LinkApprox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mc => write!(f, "mc"),
            Self::Probit => write!(f, "probit"),
            Self::Bridge => write!(f, "bridge"),
        }
    }
}

/// `n x C` class probabilities from per-example logit means `f_mu`
/// (`n x C`) and covariances `f_var` (`C x C` each)
pub fn classification_predictive<R: Rng + ?Sized>(
    f_mu: &Mat,
    f_var: &[Mat],
    link: LinkApprox,
    n_samples: usize,
    rng: &mut R,
) -> anyhow::Result<Mat> {
    if f_var.len() != f_mu.nrows() {
        return Err(LaplaceError::usage(format!(
            "{} covariances for {} logit means",
            f_var.len(),
            f_mu.nrows()
        ))
        .into());
    }
    let cc = f_mu.ncols();
    let mut ret = Mat::zeros(f_mu.nrows(), cc);

    match link {
        LinkApprox::Mc => {
            let n_samples = n_samples.max(1);
            for (i, var) in f_var.iter().enumerate() {
                let mean = f_mu.row(i).transpose();
                let draws = sample_gaussian(&mean, var, n_samples, rng);
                let probs = softmax_rows(&draws);
                ret.set_row(i, &(probs.row_sum() / n_samples as f64));
            }
        }
        LinkApprox::Probit => {
            let mut scaled = f_mu.clone();
            for (i, var) in f_var.iter().enumerate() {
                for c in 0..cc {
                    scaled[(i, c)] /= (1.0 + PI / 8.0 * var[(c, c)]).sqrt();
                }
            }
            ret = softmax_rows(&scaled);
        }
        LinkApprox::Bridge => {
            let kk = cc as f64;
            for (i, var) in f_var.iter().enumerate() {
                let f = f_mu.row(i);
                let sum_exp = f.iter().map(|x| (-x).exp()).sum::<f64>();
                let alpha = DVec::from_iterator(
                    cc,
                    (0..cc).map(|c| {
                        (1.0 - 2.0 / kk + f[c].exp() / (kk * kk) * sum_exp) / var[(c, c)]
                    }),
                );
                let total = alpha.sum();
                for c in 0..cc {
                    let p = alpha[c] / total;
                    ret[(i, c)] = if p.is_nan() { 1.0 } else { p };
                }
            }
        }
    }
    Ok(ret)
}

/// `n x C` draws from `N(mean, cov)`. A covariance that is not
/// positive definite falls back to independent normals with its
/// diagonal as variances.
pub fn sample_gaussian<R: Rng + ?Sized>(mean: &DVec, cov: &Mat, n: usize, rng: &mut R) -> Mat {
    let cc = mean.len();
    let scale = match cov.cholesky_lower() {
        Ok(ll) => ll,
        Err(e) => {
            warn!("falling back to independent logits: {}", e);
            Mat::from_diagonal(&cov.diagonal().map(|x| x.max(0.0).sqrt()))
        }
    };
    let mut ret = Mat::zeros(n, cc);
    for s in 0..n {
        let draw = &scale * rnorm_vec(rng, cc) + mean;
        ret.set_row(s, &draw.transpose());
    }
    ret
}
