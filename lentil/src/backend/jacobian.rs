//! Curvature from explicit per-example Jacobians.
//!
//! The generalized Gauss-Newton (GGN) of a batch is `Σ Jₙᵀ Λₙ Jₙ`
//! where `Λₙ` is the Hessian of the loss w.r.t. the outputs. The
//! Monte-Carlo variant replaces `Λₙ` by `s sᵀ` with `E[s sᵀ] = Λₙ`; the
//! empirical Fisher uses the loss gradient `s = ∂loss/∂f` instead.

use super::{CurvatureBackend, GpBatch, KronFactors};
use crate::error::LaplaceError;
use crate::likelihood::Likelihood;
use crate::model::{DifferentiableModel, ParamShape};
use matrix_util::dmatrix_util::{rnorm_vec, softmax_rows};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::str::FromStr;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FisherType {
    /// generalized Gauss-Newton
    Ggn,
    /// empirical Fisher, sum of outer products of loss gradients
    Empirical,
}

impl FromStr for FisherType {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ggn" => Ok(Self::Ggn),
            "ef" | "empirical" => Ok(Self::Empirical),
            _ => Err(LaplaceError::config(format!("Invalid fisher type {}", s))),
        }
    }
}

/// Per-example curvature of the loss w.r.t. the outputs
enum OutputCurvature {
    Exact(Vec<Mat>),
    /// `Λₙ ≈ sₙ sₙᵀ`
    RankOne(Vec<DVec>),
}

pub struct JacobianBackend {
    likelihood: Likelihood,
    fisher: FisherType,
    stochastic: bool,
    rng: RefCell<StdRng>,
}

impl JacobianBackend {
    /// Exact GGN backend for `likelihood`
    pub fn new(likelihood: Likelihood) -> Self {
        Self {
            likelihood,
            fisher: FisherType::Ggn,
            stochastic: false,
            rng: RefCell::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn with_fisher(mut self, fisher: FisherType) -> Self {
        self.fisher = fisher;
        self
    }

    /// Monte-Carlo curvature for the diagonal and Kronecker structures
    pub fn with_stochastic(mut self, seed: u64) -> Self {
        self.stochastic = true;
        self.rng = RefCell::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn fisher(&self) -> FisherType {
        self.fisher
    }

    pub fn is_stochastic(&self) -> bool {
        self.stochastic
    }

    fn output_curvature(&self, ff: &Mat, yy: &Mat) -> anyhow::Result<OutputCurvature> {
        match (self.fisher, self.stochastic) {
            (FisherType::Empirical, _) => {
                let grad = self.likelihood.output_gradient(ff, yy)?;
                Ok(OutputCurvature::RankOne(
                    grad.row_iter().map(|r| r.transpose()).collect(),
                ))
            }
            (FisherType::Ggn, false) => Ok(OutputCurvature::Exact(
                ff.row_iter()
                    .map(|r| self.likelihood.output_hessian(&r.transpose()))
                    .collect(),
            )),
            (FisherType::Ggn, true) => Ok(OutputCurvature::RankOne(self.mc_scores(ff))),
        }
    }

    /// Draws `s` with `E[s sᵀ]` equal to the output Hessian
    fn mc_scores(&self, ff: &Mat) -> Vec<DVec> {
        let mut rng = self.rng.borrow_mut();
        let cc = ff.ncols();
        match self.likelihood {
            Likelihood::Regression => (0..ff.nrows()).map(|_| rnorm_vec(&mut *rng, cc)).collect(),
            Likelihood::Classification => {
                let probs = softmax_rows(ff);
                probs
                    .row_iter()
                    .map(|p| {
                        let u: f64 = rng.random();
                        let mut acc = 0.0;
                        let mut k = cc - 1;
                        for (c, &pc) in p.iter().enumerate() {
                            acc += pc;
                            if u < acc {
                                k = c;
                                break;
                            }
                        }
                        let mut s = p.transpose();
                        s[k] -= 1.0;
                        s
                    })
                    .collect()
            }
        }
    }

    /// `Σ Dₙᵀ Λₙ Dₙ` for per-example `C x k` matrices `Dₙ`
    fn sandwich(&self, dd: &[Mat], curv: &OutputCurvature, kk: usize) -> Mat {
        let zero = || Mat::zeros(kk, kk);
        match curv {
            OutputCurvature::Exact(lambdas) => dd
                .par_iter()
                .zip(lambdas.par_iter())
                .map(|(d, l)| d.transpose() * l * d)
                .reduce(zero, |a, b| a + b),
            OutputCurvature::RankOne(scores) => dd
                .par_iter()
                .zip(scores.par_iter())
                .map(|(d, s)| {
                    let g = d.transpose() * s;
                    &g * g.transpose()
                })
                .reduce(zero, |a, b| a + b),
        }
    }
}

impl<M: DifferentiableModel> CurvatureBackend<M> for JacobianBackend {
    fn likelihood(&self) -> Likelihood {
        self.likelihood
    }

    fn full(&self, model: &M, xx: &Mat, yy: &Mat, _n_data: usize) -> anyhow::Result<(f64, Mat)> {
        if self.stochastic && self.fisher == FisherType::Ggn {
            return Err(LaplaceError::StochasticUnavailable("full".into()).into());
        }
        let (jacs, ff) = model.jacobians(xx)?;
        let loss = self.likelihood.loss(&ff, yy)?;
        let curv = self.output_curvature(&ff, yy)?;
        let pp = model.layout().n_params();
        Ok((loss, self.sandwich(&jacs, &curv, pp)))
    }

    fn kron(
        &self,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, KronFactors)> {
        if self.fisher == FisherType::Empirical {
            return Err(LaplaceError::unsupported(
                "Kronecker factors of the empirical Fisher are not implemented",
            )
            .into());
        }
        let layout = model.layout();
        let terms = model.layer_terms(xx)?;
        if terms.len() != layout.n_layers() {
            return Err(LaplaceError::usage(format!(
                "model reported {} layer terms for {} parameter groups",
                terms.len(),
                layout.n_layers()
            ))
            .into());
        }

        let ff = model.forward(xx)?;
        let loss = self.likelihood.loss(&ff, yy)?;
        let curv = self.output_curvature(&ff, yy)?;
        let denom = n_data.max(1) as f64;

        let groups = terms
            .iter()
            .zip(layout.groups())
            .map(|(term, group)| match (group.shape, &term.inputs) {
                (ParamShape::Matrix { rows, cols }, Some(hh)) if hh.ncols() == cols => {
                    let gg = self.sandwich(&term.output_jacobians, &curv, rows);
                    let aa = hh.transpose() * hh / denom;
                    Ok(vec![gg, aa])
                }
                (ParamShape::Vector(n), None) => {
                    Ok(vec![self.sandwich(&term.output_jacobians, &curv, n)])
                }
                _ => Err(anyhow::Error::from(LaplaceError::usage(format!(
                    "layer terms do not match the shape of group {}",
                    group.name
                )))),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok((loss, KronFactors { groups }))
    }

    fn diag(&self, model: &M, xx: &Mat, yy: &Mat, _n_data: usize) -> anyhow::Result<(f64, DVec)> {
        let (jacs, ff) = model.jacobians(xx)?;
        let loss = self.likelihood.loss(&ff, yy)?;
        let curv = self.output_curvature(&ff, yy)?;
        let pp = model.layout().n_params();
        let zero = || DVec::zeros(pp);

        let diag = match &curv {
            OutputCurvature::Exact(lambdas) => jacs
                .par_iter()
                .zip(lambdas.par_iter())
                .map(|(j, l)| {
                    let lj = l * j;
                    DVec::from_iterator(pp, (0..pp).map(|p| j.column(p).dot(&lj.column(p))))
                })
                .reduce(zero, |a, b| a + b),
            OutputCurvature::RankOne(scores) => jacs
                .par_iter()
                .zip(scores.par_iter())
                .map(|(j, s)| (j.transpose() * s).map(|x| x * x))
                .reduce(zero, |a, b| a + b),
        };
        Ok((loss, diag))
    }

    fn jacobians(&self, model: &M, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)> {
        model.jacobians(xx)
    }

    fn gp_quantities(
        &self,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        h_factor: f64,
    ) -> anyhow::Result<GpBatch> {
        if self.fisher != FisherType::Ggn {
            return Err(LaplaceError::config(
                "the GP dual is only defined for the generalized Gauss-Newton",
            )
            .into());
        }
        let (jacobians, outputs) = model.jacobians(xx)?;
        let loss = self.likelihood.loss(&outputs, yy)?;
        let lambdas = outputs
            .row_iter()
            .map(|r| self.likelihood.output_hessian(&r.transpose()) * h_factor)
            .collect();
        Ok(GpBatch {
            loss,
            jacobians,
            outputs,
            lambdas,
        })
    }

    fn supports_functional(&self) -> bool {
        self.fisher == FisherType::Ggn
    }
}
