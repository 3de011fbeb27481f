use crate::error::LaplaceError;
use matrix_util::utils::generate_minibatch_intervals;
use nalgebra::DMatrix;

type Mat = DMatrix<f64>;

/// A finite, replayable sequence of `(inputs, targets)` batches.
///
/// Every call to [`DataSource::batch_intervals`] yields the same
/// intervals, and `select` on the same rows returns the same data, so
/// the sequence can be walked as many times as needed (the GP dual
/// walks it once per inducing block, and again on every refit).
pub trait DataSource {
    /// total number of examples `N`
    fn num_data(&self) -> usize;

    /// fixed number of examples per batch (the last one may be short)
    fn batch_size(&self) -> usize;

    /// Inputs and targets of the given rows, in the given order
    fn select(&self, rows: &[usize]) -> anyhow::Result<(Mat, Mat)>;

    fn batch_intervals(&self) -> Vec<(usize, usize)> {
        generate_minibatch_intervals(self.num_data(), self.batch_size().max(1))
    }

    fn batch(&self, lb: usize, ub: usize) -> anyhow::Result<(Mat, Mat)> {
        self.select(&(lb..ub).collect::<Vec<_>>())
    }
}

/// Data held as two row-aligned matrices
#[derive(Debug, Clone)]
pub struct InMemoryData {
    xx: Mat,
    yy: Mat,
    batch_size: usize,
}

impl InMemoryData {
    /// * `xx` - `n x d` inputs
    /// * `yy` - `n x C` regression targets or `n x 1` class indexes
    /// * `batch_size` - number of rows per batch
    pub fn new(xx: Mat, yy: Mat, batch_size: usize) -> anyhow::Result<Self> {
        if xx.nrows() != yy.nrows() {
            return Err(LaplaceError::usage(format!(
                "inputs have {} rows but targets have {}",
                xx.nrows(),
                yy.nrows()
            ))
            .into());
        }
        if xx.nrows() == 0 {
            return Err(LaplaceError::usage("empty data set").into());
        }
        if batch_size == 0 {
            return Err(LaplaceError::config("batch size must be positive").into());
        }
        Ok(Self { xx, yy, batch_size })
    }

    pub fn inputs(&self) -> &Mat {
        &self.xx
    }

    pub fn targets(&self) -> &Mat {
        &self.yy
    }
}

impl DataSource for InMemoryData {
    fn num_data(&self) -> usize {
        self.xx.nrows()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn select(&self, rows: &[usize]) -> anyhow::Result<(Mat, Mat)> {
        if let Some(&r) = rows.iter().find(|&&r| r >= self.num_data()) {
            return Err(LaplaceError::usage(format!(
                "row {} out of range for {} examples",
                r,
                self.num_data()
            ))
            .into());
        }
        Ok((self.xx.select_rows(rows), self.yy.select_rows(rows)))
    }
}
