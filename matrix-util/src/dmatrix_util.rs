use crate::traits::{RowMajorOps, SampleOps};
pub use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

impl SampleOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    /// Sample d,n matrix from U(0,1)
    fn runif_with<R: Rng + ?Sized>(rng: &mut R, dd: usize, nn: usize) -> Self::Mat {
        let rvec = (0..(dd * nn)).map(|_| rng.random::<f64>()).collect::<Vec<_>>();
        DMatrix::<f64>::from_vec(dd, nn, rvec)
    }

    /// Sample d,n matrix from N(0,1)
    fn rnorm_with<R: Rng + ?Sized>(rng: &mut R, dd: usize, nn: usize) -> Self::Mat {
        let rvec = (0..(dd * nn))
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect::<Vec<_>>();
        DMatrix::<f64>::from_vec(dd, nn, rvec)
    }
}

impl RowMajorOps for DMatrix<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn from_row_major(data: &[f64], nrows: usize, ncols: usize) -> anyhow::Result<Self::Mat> {
        if data.len() != nrows * ncols {
            anyhow::bail!(
                "cannot reshape {} elements into [{} x {}]",
                data.len(),
                nrows,
                ncols
            );
        }
        Ok(DMatrix::<f64>::from_row_slice(nrows, ncols, data))
    }

    fn to_row_major(&self) -> Vec<f64> {
        // column-major storage of the transpose is row-major of self
        self.transpose().as_slice().to_vec()
    }
}

/// Sample a length-n vector from N(0,1)
pub fn rnorm_vec<R: Rng + ?Sized>(rng: &mut R, nn: usize) -> DVector<f64> {
    DVector::<f64>::from_iterator(nn, (0..nn).map(|_| rng.sample::<f64, _>(StandardNormal)))
}

/// Numerically stable soft-max of every row
pub fn softmax_rows(logits: &DMatrix<f64>) -> DMatrix<f64> {
    let mut ret = logits.clone();
    for mut row in ret.row_iter_mut() {
        let mx = row.max();
        row.apply(|x| *x = (*x - mx).exp());
        let denom = row.sum();
        row /= denom;
    }
    ret
}

/// Stack the rows of every matrix in `blocks` on top of each other
pub fn vstack(blocks: &[DMatrix<f64>]) -> anyhow::Result<DMatrix<f64>> {
    let ncols = match blocks.first() {
        Some(b) => b.ncols(),
        None => return Ok(DMatrix::zeros(0, 0)),
    };
    if blocks.iter().any(|b| b.ncols() != ncols) {
        anyhow::bail!("vstack: blocks disagree in the number of columns");
    }
    let nrows = blocks.iter().map(|b| b.nrows()).sum::<usize>();
    let mut ret = DMatrix::<f64>::zeros(nrows, ncols);
    let mut lb = 0;
    for b in blocks {
        ret.view_mut((lb, 0), (b.nrows(), ncols)).copy_from(b);
        lb += b.nrows();
    }
    Ok(ret)
}
