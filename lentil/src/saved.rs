use lentil::backend::FisherType;
use lentil::persist::FittedState;
use lentil::posterior::{Dense, Diagonal, Kron};
use lentil::predictive::Predictive;
use matrix_util::common_io::{open_buf_reader, open_buf_writer};
use matrix_util::traits::IoOps;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavedPosterior {
    Full(FittedState<Dense>),
    Kron(FittedState<Kron>),
    Diag(FittedState<Diagonal>),
}

/// A fitted approximation together with what it takes to rebuild the
/// model and the backend
#[derive(Serialize, Deserialize)]
pub struct SavedModel {
    pub sizes: Vec<usize>,
    pub fisher: FisherType,
    pub laplace: SavedPosterior,
}

impl SavedModel {
    pub fn to_json_file(&self, file_path: &str) -> anyhow::Result<()> {
        let mut buf = open_buf_writer(file_path)?;
        serde_json::to_writer(&mut buf, self)?;
        buf.flush()?;
        Ok(())
    }

    pub fn from_json_file(file_path: &str) -> anyhow::Result<Self> {
        let buf = open_buf_reader(file_path)?;
        Ok(serde_json::from_reader(buf)?)
    }
}

/// `{out}.mean.tsv` and `{out}.var.tsv`, or `{out}.probs.tsv`
pub fn write_predictive(pred: &Predictive, out: &str) -> anyhow::Result<()> {
    match pred {
        Predictive::Regression { mean, .. } => {
            mean.to_tsv(&(out.to_string() + ".mean.tsv"))?;
            if let Some(var) = pred.variance() {
                var.to_tsv(&(out.to_string() + ".var.tsv"))?;
            }
        }
        Predictive::Classification { probs } => {
            probs.to_tsv(&(out.to_string() + ".probs.tsv"))?;
        }
    }
    Ok(())
}
