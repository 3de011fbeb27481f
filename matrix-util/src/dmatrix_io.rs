use crate::common_io::{read_numeric_lines, write_lines, Delimiter};
use crate::traits::IoOps;
pub use nalgebra::{DMatrix, DVector};

impl IoOps for DMatrix<f64> {
    type Scalar = f64;
    type Mat = Self;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let data = read_numeric_lines(file, delim, skip)?;

        if data.is_empty() {
            return Err(anyhow::anyhow!("No data in file"));
        }

        let ncols = data[0].len();
        let nrows = data.len();
        if data.iter().any(|row| row.len() != ncols) {
            anyhow::bail!("{}: rows have different numbers of columns", file);
        }
        let data = data.into_iter().flatten().collect::<Vec<_>>();

        Ok(DMatrix::<f64>::from_row_iterator(nrows, ncols, data))
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines(&lines, file)?;
        Ok(())
    }
}
