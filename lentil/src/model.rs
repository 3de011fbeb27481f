//! What the core needs to know about a trained model.
//!
//! The Laplace core never differentiates anything itself. It reads the
//! parameter layout, reads and writes the flat parameter vector, and
//! evaluates the model; everything involving derivatives goes through a
//! [`crate::backend::CurvatureBackend`].

use crate::error::LaplaceError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Shape of one parameter group ("layer") in the flat vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamShape {
    /// a `rows x cols` matrix flattened row by row
    Matrix { rows: usize, cols: usize },
    Vector(usize),
}

impl ParamShape {
    pub fn len(&self) -> usize {
        match self {
            Self::Matrix { rows, cols } => rows * cols,
            Self::Vector(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: Box<str>,
    pub shape: ParamShape,
}

/// Ordered parameter groups of a model. `P` is the total number of
/// parameters, `L` the number of groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    groups: Vec<ParamGroup>,
}

impl ParamLayout {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn n_params(&self) -> usize {
        self.groups.iter().map(|g| g.shape.len()).sum()
    }

    pub fn n_layers(&self) -> usize {
        self.groups.len()
    }

    /// Number of parameters in each group
    pub fn sizes(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.shape.len()).collect()
    }

    /// Starting position of each group in the flat vector
    pub fn offsets(&self) -> Vec<usize> {
        self.groups
            .iter()
            .scan(0, |acc, g| {
                let lb = *acc;
                *acc += g.shape.len();
                Some(lb)
            })
            .collect()
    }
}

/// A trained model with a flat parameter vector
pub trait Model {
    fn layout(&self) -> &ParamLayout;

    /// Current parameters, flattened group by group
    fn parameters(&self) -> DVec;

    fn set_parameters(&mut self, theta: &DVec) -> anyhow::Result<()>;

    /// Outputs for a batch of inputs: `n x d` to `n x C`
    fn forward(&self, xx: &Mat) -> anyhow::Result<Mat>;

    /// Switch into evaluation mode (no dropout, frozen statistics)
    fn eval(&mut self) {}
}

/// Per-group quantities behind Kronecker-factored curvature
pub struct LayerTerms {
    /// inputs of the layer (`n x cols`); `None` for vector groups
    pub inputs: Option<Mat>,
    /// Jacobian of the model outputs with respect to the group's
    /// pre-activations, one `C x rows` matrix per example
    pub output_jacobians: Vec<Mat>,
}

/// A model able to report its own derivatives
pub trait DifferentiableModel: Model {
    /// Per-example Jacobians `∂f/∂θ` (each `C x P`) and the outputs
    fn jacobians(&self, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)>;

    /// One entry per parameter group, in layout order
    fn layer_terms(&self, _xx: &Mat) -> anyhow::Result<Vec<LayerTerms>> {
        Err(LaplaceError::unsupported("this model does not expose per-layer terms").into())
    }
}

/// Writes parameter samples into a model and puts the MAP back on
/// every exit path, including early returns through `?` and panics.
pub struct ParameterCheckpoint<'a, M: Model> {
    model: &'a mut M,
    saved: DVec,
    restored: bool,
}

impl<'a, M: Model> ParameterCheckpoint<'a, M> {
    pub fn new(model: &'a mut M, saved: DVec) -> Self {
        Self {
            model,
            saved,
            restored: false,
        }
    }

    /// Overwrite the live parameters and evaluate
    pub fn forward_at(&mut self, theta: &DVec, xx: &Mat) -> anyhow::Result<Mat> {
        self.restored = false;
        self.model.set_parameters(theta)?;
        self.model.forward(xx)
    }

    /// Put the saved parameters back, surfacing any failure
    pub fn restore(mut self) -> anyhow::Result<()> {
        self.restored = true;
        self.model.set_parameters(&self.saved)
    }
}

impl<M: Model> Drop for ParameterCheckpoint<'_, M> {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = self.model.set_parameters(&self.saved) {
                log::error!("failed to restore MAP parameters: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_and_sizes() {
        let layout = ParamLayout::new(vec![
            ParamGroup {
                name: "w".into(),
                shape: ParamShape::Matrix { rows: 3, cols: 2 },
            },
            ParamGroup {
                name: "b".into(),
                shape: ParamShape::Vector(3),
            },
        ]);
        assert_eq!(layout.n_params(), 9);
        assert_eq!(layout.n_layers(), 2);
        assert_eq!(layout.offsets(), vec![0, 6]);
        assert_eq!(layout.sizes(), vec![6, 3]);
    }
}
