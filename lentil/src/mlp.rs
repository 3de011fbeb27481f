//! A tanh multilayer perceptron with analytic Jacobians, the reference
//! model behind the command line and the integration tests.

use crate::error::LaplaceError;
use crate::model::{DifferentiableModel, LayerTerms, Model, ParamGroup, ParamLayout, ParamShape};
use matrix_util::traits::{RowMajorOps, SampleOps};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// Layers `d → h₁ → … → C`, tanh between layers and a linear output.
///
/// Layer `l` owns the groups `layer{l}.weight` (`out x in`, flattened
/// row by row) and `layer{l}.bias`.
#[derive(Debug, Clone)]
pub struct Mlp {
    sizes: Vec<usize>,
    weights: Vec<Mat>,
    biases: Vec<DVec>,
    layout: ParamLayout,
}

impl Mlp {
    /// Weights drawn from `N(0, 1/in)`, zero biases
    pub fn random(sizes: &[usize], seed: u64) -> anyhow::Result<Self> {
        let layout = Self::layout_of(sizes)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = sizes
            .windows(2)
            .map(|w| Mat::rnorm_with(&mut rng, w[1], w[0]) / (w[0] as f64).sqrt())
            .collect();
        let biases = sizes[1..].iter().map(|&n| DVec::zeros(n)).collect();
        Ok(Self {
            sizes: sizes.to_vec(),
            weights,
            biases,
            layout,
        })
    }

    pub fn from_parameters(sizes: &[usize], theta: &DVec) -> anyhow::Result<Self> {
        let mut ret = Self::random(sizes, 0)?;
        ret.set_parameters(theta)?;
        Ok(ret)
    }

    fn layout_of(sizes: &[usize]) -> anyhow::Result<ParamLayout> {
        if sizes.len() < 2 || sizes.contains(&0) {
            return Err(LaplaceError::config(format!(
                "an MLP needs at least two positive layer sizes, got {:?}",
                sizes
            ))
            .into());
        }
        let groups = sizes
            .windows(2)
            .enumerate()
            .flat_map(|(l, w)| {
                [
                    ParamGroup {
                        name: format!("layer{}.weight", l).into_boxed_str(),
                        shape: ParamShape::Matrix {
                            rows: w[1],
                            cols: w[0],
                        },
                    },
                    ParamGroup {
                        name: format!("layer{}.bias", l).into_boxed_str(),
                        shape: ParamShape::Vector(w[1]),
                    },
                ]
            })
            .collect();
        Ok(ParamLayout::new(groups))
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn n_inputs(&self) -> usize {
        self.sizes[0]
    }

    pub fn n_outputs(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    fn check_inputs(&self, xx: &Mat) -> anyhow::Result<()> {
        if xx.ncols() != self.n_inputs() {
            return Err(LaplaceError::usage(format!(
                "inputs have {} columns, the model expects {}",
                xx.ncols(),
                self.n_inputs()
            ))
            .into());
        }
        Ok(())
    }

    /// Inputs of every layer followed by the outputs, `n x size` each
    fn activations(&self, xx: &Mat) -> Vec<Mat> {
        let n_layers = self.weights.len();
        let mut ret = Vec::with_capacity(n_layers + 1);
        ret.push(xx.clone());
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let mut z = &ret[l] * w.transpose();
            for mut row in z.row_iter_mut() {
                row += b.transpose();
            }
            if l + 1 < n_layers {
                z.apply(|x| *x = x.tanh());
            }
            ret.push(z);
        }
        ret
    }

    /// `∂f/∂z_l` (`C x out_l`) of one example, for every layer
    fn output_jacobians(&self, acts: &[Mat], i: usize) -> Vec<Mat> {
        let n_layers = self.weights.len();
        let mut ret = vec![Mat::zeros(0, 0); n_layers];
        let mut dd = Mat::identity(self.n_outputs(), self.n_outputs());
        for l in (0..n_layers).rev() {
            let next = if l > 0 {
                let mut d = &dd * &self.weights[l];
                for (k, mut col) in d.column_iter_mut().enumerate() {
                    let a = acts[l][(i, k)];
                    col *= 1.0 - a * a;
                }
                Some(d)
            } else {
                None
            };
            ret[l] = dd;
            match next {
                Some(d) => dd = d,
                None => break,
            }
        }
        ret
    }
}

impl Model for Mlp {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn parameters(&self) -> DVec {
        let mut ret = Vec::with_capacity(self.layout.n_params());
        for (w, b) in self.weights.iter().zip(self.biases.iter()) {
            ret.extend(w.to_row_major());
            ret.extend(b.iter());
        }
        DVec::from_vec(ret)
    }

    fn set_parameters(&mut self, theta: &DVec) -> anyhow::Result<()> {
        if theta.len() != self.layout.n_params() {
            return Err(LaplaceError::usage(format!(
                "{} parameters for a model with P = {}",
                theta.len(),
                self.layout.n_params()
            ))
            .into());
        }
        let mut lb = 0;
        for (w, b) in self.weights.iter_mut().zip(self.biases.iter_mut()) {
            let (rows, cols) = w.shape();
            *w = Mat::from_row_major(&theta.as_slice()[lb..lb + rows * cols], rows, cols)?;
            lb += rows * cols;
            b.copy_from(&theta.rows(lb, rows));
            lb += rows;
        }
        Ok(())
    }

    fn forward(&self, xx: &Mat) -> anyhow::Result<Mat> {
        self.check_inputs(xx)?;
        let mut acts = self.activations(xx);
        acts.pop()
            .ok_or_else(|| anyhow::anyhow!("model has no layers"))
    }
}

impl DifferentiableModel for Mlp {
    fn jacobians(&self, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)> {
        self.check_inputs(xx)?;
        let acts = self.activations(xx);
        let pp = self.layout.n_params();
        let cc = self.n_outputs();

        let jacs = (0..xx.nrows())
            .into_par_iter()
            .map(|i| {
                let dds = self.output_jacobians(&acts, i);
                let mut jac = Mat::zeros(cc, pp);
                let mut lb = 0;
                for (l, dd) in dds.iter().enumerate() {
                    let (rows, cols) = self.weights[l].shape();
                    for o in 0..rows {
                        for k in 0..cols {
                            let a = acts[l][(i, k)];
                            jac.column_mut(lb + o * cols + k)
                                .copy_from(&(dd.column(o) * a));
                        }
                    }
                    lb += rows * cols;
                    jac.columns_mut(lb, rows).copy_from(dd);
                    lb += rows;
                }
                jac
            })
            .collect();

        let ff = acts
            .last()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("model has no layers"))?;
        Ok((jacs, ff))
    }

    fn layer_terms(&self, xx: &Mat) -> anyhow::Result<Vec<LayerTerms>> {
        self.check_inputs(xx)?;
        let acts = self.activations(xx);
        let per_example = (0..xx.nrows())
            .into_par_iter()
            .map(|i| self.output_jacobians(&acts, i))
            .collect::<Vec<_>>();

        let mut ret = Vec::with_capacity(2 * self.weights.len());
        for l in 0..self.weights.len() {
            let dds = per_example.iter().map(|d| d[l].clone()).collect::<Vec<_>>();
            ret.push(LayerTerms {
                inputs: Some(acts[l].clone()),
                output_jacobians: dds.clone(),
            });
            ret.push(LayerTerms {
                inputs: None,
                output_jacobians: dds,
            });
        }
        Ok(ret)
    }
}
