use nalgebra::DMatrix;

type Mat = DMatrix<f64>;

/// Predictive distribution over a batch of test inputs
#[derive(Debug, Clone)]
pub enum Predictive {
    /// Gaussian over outputs: `n x C` means and one `C x C`
    /// covariance per example
    Regression { mean: Mat, covariance: Vec<Mat> },
    /// `n x C` class probabilities
    Classification { probs: Mat },
}

impl Predictive {
    /// Predictive means, or class probabilities
    pub fn mean(&self) -> &Mat {
        match self {
            Self::Regression { mean, .. } => mean,
            Self::Classification { probs } => probs,
        }
    }

    /// `n x C` marginal variances; `None` for classification
    pub fn variance(&self) -> Option<Mat> {
        match self {
            Self::Regression { mean, covariance } => Some(Mat::from_fn(
                mean.nrows(),
                mean.ncols(),
                |i, c| covariance[i][(c, c)],
            )),
            Self::Classification { .. } => None,
        }
    }

    /// Index of the most probable class of every example
    pub fn argmax(&self) -> Vec<usize> {
        self.mean().row_iter().map(|r| r.transpose().argmax().0).collect()
    }
}
