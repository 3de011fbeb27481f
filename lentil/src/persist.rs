//! Saving and restoring a fitted weight-space approximation.
//!
//! The state is written as JSON (gzipped when the file name ends with
//! `.gz`). Floats round-trip exactly, so a restored approximation
//! reproduces the log marginal likelihood and predictions bit for bit.

use crate::model::ParamLayout;
use crate::options::LaplaceOptions;
use crate::posterior::PosteriorStructure;
use matrix_util::common_io::{open_buf_reader, open_buf_writer};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Everything a fitted approximation holds besides the model and the
/// backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "S: PosteriorStructure"))]
pub struct FittedState<S> {
    /// "full", "kron" or "diag"
    pub structure: Box<str>,
    pub options: LaplaceOptions,
    pub layout: ParamLayout,
    pub map: Vec<f64>,
    pub posterior: S,
    pub loss: f64,
    pub n_data: usize,
    pub n_outputs: usize,
}

impl<S: PosteriorStructure> FittedState<S> {
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

