//! The differentiation collaborator: losses, Jacobians and curvature of
//! one batch in the representation a posterior structure asks for.

pub mod jacobian;

use crate::likelihood::Likelihood;
use crate::model::Model;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

pub use jacobian::{FisherType, JacobianBackend};

/// Kronecker factors of one batch, one entry per parameter group.
///
/// A matrix group `rows x cols` carries `[G (rows x rows), A (cols x
/// cols)]` so that its curvature block is `G ⊗ A` under row-major
/// flattening; a vector group carries a single factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KronFactors {
    pub groups: Vec<Vec<Mat>>,
}

/// Everything the GP dual needs from one batch
pub struct GpBatch {
    pub loss: f64,
    /// `C x P` per example
    pub jacobians: Vec<Mat>,
    /// model outputs at the MAP, `n x C`
    pub outputs: Mat,
    /// likelihood curvature w.r.t. the outputs, scaled by the
    /// H factor, `C x C` per example
    pub lambdas: Vec<Mat>,
}

/// Supplies per-batch losses and curvature for a model.
///
/// `n_data` is the size of the full training set; backends use it to
/// scale batch statistics so that summing over all batches gives
/// whole-data curvature.
pub trait CurvatureBackend<M: Model> {
    fn likelihood(&self) -> Likelihood;

    /// Loss and `P x P` curvature
    fn full(&self, model: &M, xx: &Mat, yy: &Mat, n_data: usize) -> anyhow::Result<(f64, Mat)>;

    /// Loss and Kronecker factors per parameter group
    fn kron(
        &self,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        n_data: usize,
    ) -> anyhow::Result<(f64, KronFactors)>;

    /// Loss and the diagonal of the curvature
    fn diag(&self, model: &M, xx: &Mat, yy: &Mat, n_data: usize) -> anyhow::Result<(f64, DVec)>;

    /// Per-example `C x P` Jacobians and the `n x C` outputs
    fn jacobians(&self, model: &M, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)>;

    fn gp_quantities(
        &self,
        model: &M,
        xx: &Mat,
        yy: &Mat,
        h_factor: f64,
    ) -> anyhow::Result<GpBatch>;

    /// Whether the curvature is a generalized Gauss-Newton, the only
    /// kind the GP dual is defined for
    fn supports_functional(&self) -> bool {
        true
    }
}
