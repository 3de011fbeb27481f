use super::dense::check_columns;
use super::PosteriorStructure;
use crate::backend::CurvatureBackend;
use crate::error::LaplaceError;
use crate::model::{Model, ParamLayout};
use matrix_util::traits::SampleOps;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Diagonal curvature, `O(P)` throughout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagonal {
    hessian: DVec,
}

impl Diagonal {
    pub fn hessian(&self) -> &DVec {
        &self.hessian
    }

    pub fn precision(&self, h_factor: f64, prior_diag: &DVec) -> DVec {
        &self.hessian * h_factor + prior_diag
    }

    pub fn variance(&self, h_factor: f64, prior_diag: &DVec) -> DVec {
        self.precision(h_factor, prior_diag).map(|x| 1.0 / x)
    }

    pub fn scale(&self, h_factor: f64, prior_diag: &DVec) -> DVec {
        self.precision(h_factor, prior_diag).map(|x| 1.0 / x.sqrt())
    }
}

impl PosteriorStructure for Diagonal {
    type Curvature = DVec;

    fn name() -> &'static str {
        "diag"
    }

    fn init(layout: &ParamLayout) -> Self {
        Self {
            hessian: DVec::zeros(layout.n_params()),
        }
    }

    fn curvature<M: Model, B: CurvatureBackend<M>>(
        backend: &B,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, DVec)> {
        backend.diag(model, xx, yy, n_data)
    }

    fn accumulate(&mut self, batch: DVec) -> anyhow::Result<()> {
        if batch.len() != self.hessian.len() {
            return Err(LaplaceError::usage(format!(
                "batch curvature of length {} does not match P = {}",
                batch.len(),
                self.hessian.len()
            ))
            .into());
        }
        self.hessian += batch;
        Ok(())
    }

    fn log_det(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<f64> {
        Ok(self
            .precision(h_factor, prior_diag)
            .iter()
            .map(|x| x.ln())
            .sum())
    }

    fn bilinear(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        jacs: &[Mat],
    ) -> anyhow::Result<Vec<Mat>> {
        check_columns(jacs, self.hessian.len())?;
        let var = self.variance(h_factor, prior_diag);
        Ok(jacs
            .par_iter()
            .map(|j| {
                let mut jv = j.clone();
                for (mut col, v) in jv.column_iter_mut().zip(var.iter()) {
                    col *= *v;
                }
                jv * j.transpose()
            })
            .collect())
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        mean: &DVec,
        n: usize,
        rng: &mut R,
    ) -> anyhow::Result<Mat> {
        let scale = self.scale(h_factor, prior_diag);
        let mut ret = Mat::rnorm_with(rng, scale.len(), n);
        for mut col in ret.column_iter_mut() {
            col.component_mul_assign(&scale);
            col += mean;
        }
        Ok(ret)
    }

    fn log_det_gradient(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<DVec> {
        Ok(self.variance(h_factor, prior_diag))
    }
}
