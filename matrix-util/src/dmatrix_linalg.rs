use crate::traits::PrecisionOps;
use nalgebra::{DMatrix, DVector};

impl PrecisionOps for DMatrix<f64> {
    type Mat = Self;
    type DVec = DVector<f64>;
    type Scalar = f64;

    fn log_det_spd(&self) -> anyhow::Result<f64> {
        let ll = self.cholesky_lower()?;
        Ok(2.0 * ll.diagonal().iter().map(|x| x.ln()).sum::<f64>())
    }

    /// Flip the precision `A` along both axes, take the Cholesky
    /// factor `C` of the flipped matrix, then flip `C^{-T}` back:
    /// `J C^{-T} J` is lower triangular and squares to `A^{-1}`.
    fn inv_sqrt_precision(&self) -> anyhow::Result<Self::Mat> {
        let nn = self.nrows();
        if nn != self.ncols() {
            anyhow::bail!("precision must be square: [{} x {}]", nn, self.ncols());
        }
        let flipped = flip_both(self);
        let cc = flipped.cholesky_lower()?;
        let cc_inv = cc
            .solve_lower_triangular(&DMatrix::<f64>::identity(nn, nn))
            .ok_or_else(|| anyhow::anyhow!("singular Cholesky factor"))?;
        Ok(flip_both(&cc_inv.transpose()))
    }

    fn cholesky_lower(&self) -> anyhow::Result<Self::Mat> {
        if self.iter().any(|x| !x.is_finite()) {
            anyhow::bail!("matrix has non-finite entries");
        }
        let chol = self
            .clone()
            .cholesky()
            .ok_or_else(|| anyhow::anyhow!("matrix is not positive definite"))?;
        Ok(chol.l())
    }

    fn symmetrize(&self) -> Self::Mat {
        (self + self.transpose()) * 0.5
    }

    fn psd_eigen(&self) -> (Self::DVec, Self::Mat) {
        let eig = self.symmetrize().symmetric_eigen();
        let values = eig.eigenvalues.map(|x| x.max(0.0));
        (values, eig.eigenvectors)
    }
}

/// `J A J` for the exchange matrix `J`
fn flip_both(aa: &DMatrix<f64>) -> DMatrix<f64> {
    let (nr, nc) = aa.shape();
    DMatrix::<f64>::from_fn(nr, nc, |i, j| aa[(nr - 1 - i, nc - 1 - j)])
}

/// `A + diag(d)`
pub fn add_diag(aa: &DMatrix<f64>, dd: &DVector<f64>) -> DMatrix<f64> {
    let mut ret = aa.clone();
    for (i, d) in dd.iter().enumerate() {
        ret[(i, i)] += d;
    }
    ret
}

/// `A + c * I`
pub fn add_scaled_identity(aa: &DMatrix<f64>, cc: f64) -> DMatrix<f64> {
    let mut ret = aa.clone();
    for i in 0..ret.nrows().min(ret.ncols()) {
        ret[(i, i)] += cc;
    }
    ret
}
