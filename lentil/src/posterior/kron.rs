//! Block-diagonal curvature with one Kronecker-factored block per
//! parameter group.
//!
//! A matrix group `W (rows x cols)` carries `G ⊗ A`, a vector group a
//! single factor. After [`Kron::decompose`] every factor is held as
//! eigenpairs, and all queries work group by group in the eigenbasis:
//! with `Q = Q₁ ⊗ Q₂`, the posterior precision of a group is
//! `Q diag(λ) Qᵀ`, so `Q₁((Q₁ᵀ X Q₂) ∘ λ^e)Q₂ᵀ` applies its `e`-th
//! power to a reshaped parameter block `X`.

use super::dense::check_columns;
use super::PosteriorStructure;
use crate::backend::{CurvatureBackend, KronFactors};
use crate::error::LaplaceError;
use crate::model::{Model, ParamLayout, ParamShape};
use crate::prior::PriorPrecision;
use log::info;
use matrix_util::traits::{PrecisionOps, RowMajorOps, SampleOps};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kron {
    shapes: Vec<ParamShape>,
    offsets: Vec<usize>,
    factors: Vec<Vec<Mat>>,
    eigen: Option<Vec<GroupEigen>>,
    damping: bool,
}

/// Eigenpairs of one group's factors. A vector group is stored as a
/// `n x 1` block with the trivial second factor `[1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupEigen {
    q1: Mat,
    l1: DVec,
    q2: Mat,
    l2: DVec,
    single: bool,
}

impl GroupEigen {
    fn block_shape(&self) -> (usize, usize) {
        (self.q1.nrows(), self.q2.nrows())
    }

    /// Eigenvalues of the group's posterior precision as a
    /// `rows x cols` block
    fn precision_values(&self, h: f64, delta: f64, damping: bool) -> Mat {
        let (nr, nc) = self.block_shape();
        if self.single {
            return Mat::from_fn(nr, nc, |a, _| h * self.l1[a] + delta);
        }
        if damping {
            let (sh, sd) = (h.sqrt(), delta.sqrt());
            Mat::from_fn(nr, nc, |a, b| {
                (sh * self.l1[a] + sd) * (sh * self.l2[b] + sd)
            })
        } else {
            Mat::from_fn(nr, nc, |a, b| h * self.l1[a] * self.l2[b] + delta)
        }
    }

    /// `Q₁ᵀ X Q₂`
    fn rotate(&self, xx: &Mat) -> Mat {
        self.q1.transpose() * xx * &self.q2
    }

    /// `Q₁ X Q₂ᵀ`
    fn rotate_back(&self, xx: &Mat) -> Mat {
        &self.q1 * xx * self.q2.transpose()
    }
}

impl Kron {
    pub fn factors(&self) -> &[Vec<Mat>] {
        &self.factors
    }

    pub fn is_decomposed(&self) -> bool {
        self.eigen.is_some()
    }

    pub fn damping(&self) -> bool {
        self.damping
    }

    fn decomposed(&self) -> anyhow::Result<&[GroupEigen]> {
        self.eigen.as_deref().ok_or_else(|| {
            LaplaceError::usage("Kronecker curvature must be decomposed before any query").into()
        })
    }

    /// Per-group prior precision, read at each group's first parameter.
    ///
    /// A Kronecker block only takes a scalar prior, so every entry of a
    /// group must carry the same value; `check_prior` rejects
    /// per-parameter priors before they reach here.
    fn group_priors(&self, prior_diag: &DVec) -> anyhow::Result<Vec<f64>> {
        let pp = self.offsets.last().copied().unwrap_or(0)
            + self.shapes.last().map(|s| s.len()).unwrap_or(0);
        if prior_diag.len() != pp {
            return Err(LaplaceError::usage(format!(
                "prior of length {} does not match P = {}",
                prior_diag.len(),
                pp
            ))
            .into());
        }
        Ok(self
            .offsets
            .iter()
            .zip(&self.shapes)
            .map(|(&lb, s)| {
                if s.is_empty() {
                    return 1.0;
                }
                debug_assert!(
                    prior_diag.rows(lb, s.len()).iter().all(|&p| p == prior_diag[lb]),
                    "prior precision varies within the group at offset {}",
                    lb
                );
                prior_diag[lb]
            })
            .collect())
    }

    /// Eigenvalue blocks of every group
    fn precision_values(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<Vec<Mat>> {
        let eigen = self.decomposed()?;
        let deltas = self.group_priors(prior_diag)?;
        let values = eigen
            .iter()
            .zip(deltas)
            .map(|(e, d)| e.precision_values(h_factor, d, self.damping))
            .collect::<Vec<_>>();
        if values
            .iter()
            .any(|v| v.iter().any(|x| *x <= 0.0 || !x.is_finite()))
        {
            return Err(LaplaceError::numerical(
                "Kronecker posterior precision is not positive definite",
            )
            .into());
        }
        Ok(values)
    }

    /// Parameter block of group `g` as a `rows x cols` matrix
    fn block(&self, g: usize, flat: &[f64]) -> anyhow::Result<Mat> {
        match self.shapes[g] {
            ParamShape::Matrix { rows, cols } => Mat::from_row_major(flat, rows, cols),
            ParamShape::Vector(n) => Ok(Mat::from_column_slice(n, 1, flat)),
        }
    }

    /// The posterior precision as an explicit `P x P` matrix. Only
    /// sensible for small models.
    pub fn dense_precision(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<Mat> {
        let eigen = self.decomposed()?;
        let values = self.precision_values(h_factor, prior_diag)?;
        let pp = prior_diag.len();
        let mut ret = Mat::zeros(pp, pp);
        for ((e, lam), &lb) in eigen.iter().zip(values.iter()).zip(self.offsets.iter()) {
            let qq = e.q1.kronecker(&e.q2);
            let lam = DVec::from_vec(lam.to_row_major());
            let block = &qq * Mat::from_diagonal(&lam) * qq.transpose();
            let n = block.nrows();
            ret.view_mut((lb, lb), (n, n)).copy_from(&block);
        }
        Ok(ret)
    }
}

impl PosteriorStructure for Kron {
    type Curvature = KronFactors;

    fn name() -> &'static str {
        "kron"
    }

    fn init(layout: &ParamLayout) -> Self {
        let shapes = layout.groups().iter().map(|g| g.shape).collect::<Vec<_>>();
        let factors = shapes
            .iter()
            .map(|s| match *s {
                ParamShape::Matrix { rows, cols } => {
                    vec![Mat::zeros(rows, rows), Mat::zeros(cols, cols)]
                }
                ParamShape::Vector(n) => vec![Mat::zeros(n, n)],
            })
            .collect();
        Self {
            shapes,
            offsets: layout.offsets(),
            factors,
            eigen: None,
            damping: false,
        }
    }

    fn check_prior(prior: &PriorPrecision) -> anyhow::Result<()> {
        if prior.is_per_parameter() {
            return Err(LaplaceError::config(
                "per-parameter prior precision cannot be combined with Kronecker curvature",
            )
            .into());
        }
        Ok(())
    }

    fn curvature<M: Model, B: CurvatureBackend<M>>(
        backend: &B,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, KronFactors)> {
        backend.kron(model, xx, yy, n_data)
    }

    fn accumulate(&mut self, batch: KronFactors) -> anyhow::Result<()> {
        if self.eigen.is_some() {
            return Err(LaplaceError::usage(
                "cannot accumulate into decomposed Kronecker curvature",
            )
            .into());
        }
        let ok = batch.groups.len() == self.factors.len()
            && batch.groups.iter().zip(&self.factors).all(|(b, f)| {
                b.len() == f.len() && b.iter().zip(f).all(|(x, y)| x.shape() == y.shape())
            });
        if !ok {
            return Err(LaplaceError::usage(
                "batch Kronecker factors do not match the parameter layout",
            )
            .into());
        }
        for (acc, batch) in self.factors.iter_mut().zip(batch.groups) {
            for (a, b) in acc.iter_mut().zip(batch) {
                *a += b;
            }
        }
        Ok(())
    }

    /// Eigendecompose every factor once. With `damping` the prior
    /// enters each factor as an offset before the Kronecker product
    /// instead of being added to the product's eigenvalues.
    fn decompose(&mut self, damping: bool) -> anyhow::Result<()> {
        if self.eigen.is_some() {
            return Err(LaplaceError::usage("Kronecker curvature already decomposed").into());
        }
        let eigen = self
            .factors
            .par_iter()
            .map(|f| match f.as_slice() {
                [single] => {
                    let (l1, q1) = single.psd_eigen();
                    Ok(GroupEigen {
                        q1,
                        l1,
                        q2: Mat::identity(1, 1),
                        l2: DVec::from_element(1, 1.0),
                        single: true,
                    })
                }
                [gg, aa] => {
                    let (l1, q1) = gg.psd_eigen();
                    let (l2, q2) = aa.psd_eigen();
                    Ok(GroupEigen {
                        q1,
                        l1,
                        q2,
                        l2,
                        single: false,
                    })
                }
                _ => Err(anyhow::Error::from(LaplaceError::usage(
                    "a parameter group needs one or two Kronecker factors",
                ))),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        info!(
            "decomposed {} Kronecker groups (damping = {})",
            eigen.len(),
            damping
        );
        self.eigen = Some(eigen);
        self.damping = damping;
        Ok(())
    }

    fn log_det(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<f64> {
        let values = self.precision_values(h_factor, prior_diag)?;
        Ok(values
            .iter()
            .map(|v| v.iter().map(|x| x.ln()).sum::<f64>())
            .sum())
    }

    fn bilinear(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        jacs: &[Mat],
    ) -> anyhow::Result<Vec<Mat>> {
        let eigen = self.decomposed()?;
        check_columns(jacs, prior_diag.len())?;
        let inv_sqrt = self
            .precision_values(h_factor, prior_diag)?
            .into_iter()
            .map(|v| v.map(|x| 1.0 / x.sqrt()))
            .collect::<Vec<_>>();

        jacs.par_iter()
            .map(|jj| {
                let cc = jj.nrows();
                let mut ret = Mat::zeros(cc, cc);
                for (g, (e, w)) in eigen.iter().zip(inv_sqrt.iter()).enumerate() {
                    let (lb, n) = (self.offsets[g], self.shapes[g].len());
                    let mut rr = Mat::zeros(cc, n);
                    for c in 0..cc {
                        let row = jj.view((c, lb), (1, n)).iter().copied().collect::<Vec<_>>();
                        let xx = self.block(g, &row)?;
                        let r = e.rotate(&xx).component_mul(w);
                        rr.row_mut(c).copy_from_slice(&r.to_row_major());
                    }
                    ret += &rr * rr.transpose();
                }
                Ok::<_, anyhow::Error>(ret)
            })
            .collect()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        mean: &DVec,
        n: usize,
        rng: &mut R,
    ) -> anyhow::Result<Mat> {
        let eigen = self.decomposed()?;
        let values = self.precision_values(h_factor, prior_diag)?;
        let mut ret = Mat::zeros(mean.len(), n);
        for s in 0..n {
            let mut col = ret.column_mut(s);
            for (g, (e, lam)) in eigen.iter().zip(values.iter()).enumerate() {
                let (nr, nc) = e.block_shape();
                let zz = Mat::rnorm_with(rng, nr, nc).component_div(&lam.map(|x| x.sqrt()));
                let draw = e.rotate_back(&zz).to_row_major();
                col.rows_mut(self.offsets[g], draw.len())
                    .copy_from_slice(&draw);
            }
            col += mean;
        }
        Ok(ret)
    }

    fn log_det_gradient(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<DVec> {
        let eigen = self.decomposed()?;
        let values = self.precision_values(h_factor, prior_diag)?;
        let deltas = self.group_priors(prior_diag)?;
        let mut ret = DVec::zeros(prior_diag.len());

        for (g, ((e, lam), delta)) in eigen.iter().zip(values.iter()).zip(deltas).enumerate() {
            let (lb, n) = (self.offsets[g], self.shapes[g].len());
            if self.damping && !e.single {
                // ∂λ_ab/∂δ = ((√h l₂ᵦ + √δ) + (√h l₁ₐ + √δ)) / (2√δ)
                let (sh, sd) = (h_factor.sqrt(), delta.sqrt());
                let total = lam
                    .iter()
                    .enumerate()
                    .map(|(k, x)| {
                        let (a, b) = (k % lam.nrows(), k / lam.nrows());
                        let d = (sh * e.l2[b] + sd + sh * e.l1[a] + sd) / (2.0 * sd);
                        d / x
                    })
                    .sum::<f64>();
                ret.rows_mut(lb, n).fill(total / n as f64);
            } else {
                // diagonal of the group covariance
                let q1sq = e.q1.map(|x| x * x);
                let q2sq = e.q2.map(|x| x * x);
                let var = q1sq * lam.map(|x| 1.0 / x) * q2sq.transpose();
                ret.rows_mut(lb, n).copy_from_slice(&var.to_row_major());
            }
        }
        Ok(ret)
    }
}
