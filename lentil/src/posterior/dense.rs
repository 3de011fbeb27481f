use super::PosteriorStructure;
use crate::backend::CurvatureBackend;
use crate::error::{numerical, LaplaceError};
use crate::model::{Model, ParamLayout};
use matrix_util::dmatrix_linalg::add_diag;
use matrix_util::traits::{PrecisionOps, SampleOps};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Full `P x P` curvature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    hessian: Mat,
    #[serde(skip)]
    cache: RefCell<Option<ScaleCache>>,
}

/// Posterior scale for one `(h, p0)` pair
#[derive(Debug, Clone)]
struct ScaleCache {
    h_factor: f64,
    prior_diag: DVec,
    scale: Mat,
}

impl Dense {
    pub fn hessian(&self) -> &Mat {
        &self.hessian
    }

    /// `h·H + diag(p0)`
    pub fn precision(&self, h_factor: f64, prior_diag: &DVec) -> Mat {
        add_diag(&(&self.hessian * h_factor), prior_diag)
    }

    /// Lower-triangular `L` with `L Lᵀ` the posterior covariance,
    /// cached until the key `(h, p0)` changes or the cache is dropped
    pub fn scale(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<Ref<'_, Mat>> {
        let stale = match &*self.cache.borrow() {
            Some(c) => c.h_factor != h_factor || c.prior_diag != *prior_diag,
            None => true,
        };
        if stale {
            let scale = self
                .precision(h_factor, prior_diag)
                .inv_sqrt_precision()
                .map_err(numerical("posterior precision"))?;
            *self.cache.borrow_mut() = Some(ScaleCache {
                h_factor,
                prior_diag: prior_diag.clone(),
                scale,
            });
        }
        Ref::filter_map(self.cache.borrow(), |c| c.as_ref().map(|c| &c.scale))
            .map_err(|_| anyhow::anyhow!("posterior scale cache is empty"))
    }

    /// `L Lᵀ`
    pub fn covariance(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<Mat> {
        let ll = self.scale(h_factor, prior_diag)?;
        Ok(&*ll * ll.transpose())
    }
}

impl PosteriorStructure for Dense {
    type Curvature = Mat;

    fn name() -> &'static str {
        "full"
    }

    fn init(layout: &ParamLayout) -> Self {
        let pp = layout.n_params();
        Self {
            hessian: Mat::zeros(pp, pp),
            cache: RefCell::new(None),
        }
    }

    fn curvature<M: Model, B: CurvatureBackend<M>>(
        backend: &B,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, Mat)> {
        backend.full(model, xx, yy, n_data)
    }

    fn accumulate(&mut self, batch: Mat) -> anyhow::Result<()> {
        if batch.shape() != self.hessian.shape() {
            return Err(LaplaceError::usage(format!(
                "batch curvature [{} x {}] does not match P = {}",
                batch.nrows(),
                batch.ncols(),
                self.hessian.nrows()
            ))
            .into());
        }
        self.hessian += batch;
        self.invalidate();
        Ok(())
    }

    fn log_det(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<f64> {
        self.precision(h_factor, prior_diag)
            .log_det_spd()
            .map_err(numerical("posterior precision"))
    }

    fn bilinear(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        jacs: &[Mat],
    ) -> anyhow::Result<Vec<Mat>> {
        let ll = self.scale(h_factor, prior_diag)?;
        let ll: &Mat = &ll;
        check_columns(jacs, ll.nrows())?;
        Ok(jacs
            .par_iter()
            .map(|j| {
                let jl = j * ll;
                &jl * jl.transpose()
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
        let ll = self.scale(h_factor, prior_diag)?;
        let zz = Mat::rnorm_with(rng, ll.nrows(), n);
        let mut ret = &*ll * zz;
        for mut col in ret.column_iter_mut() {
            col += mean;
        }
        Ok(ret)
    }

    fn log_det_gradient(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<DVec> {
        let ll = self.scale(h_factor, prior_diag)?;
        Ok(DVec::from_iterator(
            ll.nrows(),
            ll.row_iter().map(|r| r.norm_squared()),
        ))
    }

    fn invalidate(&self) {
        self.cache.replace(None);
    }
}

pub(crate) fn check_columns(jacs: &[Mat], n_params: usize) -> anyhow::Result<()> {
    if let Some(j) = jacs.iter().find(|j| j.ncols() != n_params) {
        return Err(LaplaceError::usage(format!(
            "Jacobian has {} columns, expected P = {}",
            j.ncols(),
            n_params
        ))
        .into());
    }
    Ok(())
}
