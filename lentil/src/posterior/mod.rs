//! Posterior precision `h·H + diag(p0)` under three structural
//! assumptions on the accumulated curvature `H`.
//!
//! Every query takes the H factor `h = 1/(σ²T)` and the expanded prior
//! precision `p0`, so a structure never holds on to prior state except
//! in the explicit [`dense::Dense`] scale cache.

pub mod dense;
pub mod diag;
pub mod kron;

use crate::backend::CurvatureBackend;
use crate::model::{Model, ParamLayout};
use crate::prior::PriorPrecision;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use dense::Dense;
pub use diag::Diagonal;
pub use kron::Kron;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

pub trait PosteriorStructure: Sized + Clone + Serialize + DeserializeOwned {
    /// batch curvature in this structure's representation
    type Curvature;

    fn name() -> &'static str;

    /// Empty accumulator for a model with this layout
    fn init(layout: &ParamLayout) -> Self;

    /// Reject prior shapes the structure cannot combine with
    fn check_prior(_prior: &PriorPrecision) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ask the backend for one batch of curvature
    fn curvature<M: Model, B: CurvatureBackend<M>>(
        backend: &B,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, Self::Curvature)>;

    fn accumulate(&mut self, batch: Self::Curvature) -> anyhow::Result<()>;

    /// One-time step after the accumulation pass
    fn decompose(&mut self, _damping: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// `log det(h·H + p0)`
    fn log_det(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<f64>;

    /// `J Σ Jᵀ` for every per-example `C x P` Jacobian, `Σ` being the
    /// posterior covariance
    fn bilinear(&self, h_factor: f64, prior_diag: &DVec, jacs: &[Mat])
        -> anyhow::Result<Vec<Mat>>;

    /// `n` draws from `N(mean, Σ)` as the columns of a `P x n` matrix
    fn sample<R: Rng + ?Sized>(
        &self,
        h_factor: f64,
        prior_diag: &DVec,
        mean: &DVec,
        n: usize,
        rng: &mut R,
    ) -> anyhow::Result<Mat>;

    /// `∂ log det(h·H + p0) / ∂p0` laid out per parameter. For a
    /// structure whose prior is tied within a group, only group sums
    /// are meaningful.
    fn log_det_gradient(&self, h_factor: f64, prior_diag: &DVec) -> anyhow::Result<DVec>;

    /// Drop cached derived state after a prior or noise change
    fn invalidate(&self) {}
}
