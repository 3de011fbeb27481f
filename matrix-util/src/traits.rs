use crate::common_io::Delimiter;
use rand::Rng;

/// Operations to sample random matrices from a caller-owned generator,
/// so that every draw is reproducible for a fixed seed
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif_with<R: Rng + ?Sized>(rng: &mut R, dd: usize, nn: usize) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm_with<R: Rng + ?Sized>(rng: &mut R, dd: usize, nn: usize) -> Self::Mat;
}

/// Routines on symmetric positive (semi-)definite matrices
pub trait PrecisionOps {
    type Mat;
    type DVec;
    type Scalar;

    /// `log det(A)` through the Cholesky factor; fails unless `A` is
    /// positive definite
    fn log_det_spd(&self) -> anyhow::Result<Self::Scalar>;

    /// Lower-triangular `L` such that `L * L' = A^{-1}`, obtained
    /// without ever inverting `A` itself
    fn inv_sqrt_precision(&self) -> anyhow::Result<Self::Mat>;

    /// Lower Cholesky factor `L` with `L * L' = A`
    fn cholesky_lower(&self) -> anyhow::Result<Self::Mat>;

    /// `(A + A') / 2`
    fn symmetrize(&self) -> Self::Mat;

    /// Eigenvalues (clamped at zero) and eigenvectors of a symmetric
    /// matrix
    fn psd_eigen(&self) -> (Self::DVec, Self::Mat);
}

/// Reshape a flat, row-major block to and from a matrix
pub trait RowMajorOps {
    type Mat;
    type Scalar;

    fn from_row_major(data: &[Self::Scalar], nrows: usize, ncols: usize)
        -> anyhow::Result<Self::Mat>;

    fn to_row_major(&self) -> Vec<Self::Scalar>;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", skip)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    fn to_csv(&self, csv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(csv_file, ",")
    }
}
