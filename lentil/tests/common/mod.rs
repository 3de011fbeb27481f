#![allow(dead_code)]

use lentil::backend::JacobianBackend;
use lentil::data::InMemoryData;
use lentil::error::{error_kind, ErrorKind};
use lentil::likelihood::Likelihood;
use lentil::mlp::Mlp;
use lentil::model::{DifferentiableModel, LayerTerms, Model, ParamGroup, ParamLayout, ParamShape};
use matrix_util::traits::SampleOps;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub type Mat = DMatrix<f64>;
pub type DVec = DVector<f64>;

/// `y = sin(2x₀) + 0.5 x₁ + noise` on `n` points
pub fn toy_regression(n: usize, noise: f64, seed: u64) -> (Mat, Mat) {
    let mut rng = StdRng::seed_from_u64(seed);
    let xx = Mat::runif_with(&mut rng, n, 2).map(|x| 4.0 * x - 2.0);
    let eps = Mat::rnorm_with(&mut rng, n, 1);
    let yy = Mat::from_fn(n, 1, |i, _| {
        (2.0 * xx[(i, 0)]).sin() + 0.5 * xx[(i, 1)] + noise * eps[(i, 0)]
    });
    (xx, yy)
}

/// Two-output regression targets on the same inputs
pub fn toy_regression2(n: usize, seed: u64) -> (Mat, Mat) {
    let (xx, y0) = toy_regression(n, 0.1, seed);
    let yy = Mat::from_fn(n, 2, |i, c| if c == 0 { y0[(i, 0)] } else { xx[(i, 0)] * xx[(i, 1)] });
    (xx, yy)
}

/// Three classes split by the sign pattern of the inputs
pub fn toy_classification(n: usize, seed: u64) -> (Mat, Mat) {
    let mut rng = StdRng::seed_from_u64(seed);
    let xx = Mat::rnorm_with(&mut rng, n, 2);
    let yy = Mat::from_fn(n, 1, |i, _| {
        if xx[(i, 0)] > 0.5 {
            0.0
        } else if xx[(i, 1)] > 0.0 {
            1.0
        } else {
            2.0
        }
    });
    (xx, yy)
}

pub fn data(xx: &Mat, yy: &Mat, batch_size: usize) -> InMemoryData {
    InMemoryData::new(xx.clone(), yy.clone(), batch_size).expect("toy data")
}

pub fn mlp(sizes: &[usize], seed: u64) -> Mlp {
    Mlp::random(sizes, seed).expect("mlp")
}

pub fn regression_backend() -> JacobianBackend {
    JacobianBackend::new(Likelihood::Regression)
}

pub fn classification_backend() -> JacobianBackend {
    JacobianBackend::new(Likelihood::Classification)
}

pub fn assert_kind<T>(res: anyhow::Result<T>, kind: ErrorKind) {
    match res {
        Ok(_) => panic!("expected a {:?} error", kind),
        Err(e) => assert_eq!(error_kind(&e), Some(kind), "{}", e),
    }
}

/// `f(x) = W x` with a single `C x d` weight group and no bias
#[derive(Debug, Clone)]
pub struct Linear {
    ww: Mat,
    layout: ParamLayout,
}

impl Linear {
    pub fn new(ww: Mat) -> Self {
        let layout = ParamLayout::new(vec![ParamGroup {
            name: "weight".into(),
            shape: ParamShape::Matrix {
                rows: ww.nrows(),
                cols: ww.ncols(),
            },
        }]);
        Self { ww, layout }
    }
}

impl Model for Linear {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn parameters(&self) -> DVec {
        DVec::from_vec(self.ww.transpose().as_slice().to_vec())
    }

    fn set_parameters(&mut self, theta: &DVec) -> anyhow::Result<()> {
        anyhow::ensure!(theta.len() == self.ww.len(), "wrong parameter count");
        self.ww = Mat::from_row_slice(self.ww.nrows(), self.ww.ncols(), theta.as_slice());
        Ok(())
    }

    fn forward(&self, xx: &Mat) -> anyhow::Result<Mat> {
        Ok(xx * self.ww.transpose())
    }
}

impl DifferentiableModel for Linear {
    fn jacobians(&self, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)> {
        let (cc, dd) = self.ww.shape();
        let jacs = xx
            .row_iter()
            .map(|x| Mat::from_fn(cc, cc * dd, |c, p| if p / dd == c { x[p % dd] } else { 0.0 }))
            .collect();
        Ok((jacs, self.forward(xx)?))
    }

    fn layer_terms(&self, xx: &Mat) -> anyhow::Result<Vec<LayerTerms>> {
        let cc = self.ww.nrows();
        Ok(vec![LayerTerms {
            inputs: Some(xx.clone()),
            output_jacobians: vec![Mat::identity(cc, cc); xx.nrows()],
        }])
    }
}
