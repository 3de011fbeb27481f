//! Weight-space Laplace approximation `N(θ_MAP, (h·H + diag(p0))⁻¹)`.

use crate::backend::CurvatureBackend;
use crate::data::DataSource;
use crate::error::LaplaceError;
use crate::likelihood::Likelihood;
use crate::link::{classification_predictive, sample_gaussian, LinkApprox};
use crate::model::{Model, ParameterCheckpoint};
use crate::optim::LaplaceApproximation;
use crate::options::{LaplaceOptions, PredType};
use crate::persist::FittedState;
use crate::posterior::{Dense, Diagonal, Kron, PosteriorStructure};
use crate::predictive::Predictive;
use crate::prior::{PriorMean, PriorPrecision, PriorSpec};
use log::{debug, info};
use matrix_util::dmatrix_util::softmax_rows;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::f64::consts::PI;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

pub type FullLaplace<M, B> = ParametricLaplace<Dense, M, B>;
pub type KronLaplace<M, B> = ParametricLaplace<Kron, M, B>;
pub type DiagLaplace<M, B> = ParametricLaplace<Diagonal, M, B>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    Unfit,
    Fitting,
    Fitted,
}

pub struct ParametricLaplace<S, M, B> {
    model: M,
    backend: B,
    options: LaplaceOptions,
    prior: PriorSpec,
    map: DVec,
    posterior: S,
    state: FitState,
    loss: f64,
    n_data: usize,
    n_outputs: usize,
    rng: StdRng,
}

impl<S, M, B> ParametricLaplace<S, M, B>
where
    S: PosteriorStructure,
    M: Model,
    B: CurvatureBackend<M>,
{
    /// Wrap a trained model; its current parameters become the MAP
    pub fn new(model: M, backend: B, options: LaplaceOptions) -> anyhow::Result<Self> {
        options.validate()?;
        if backend.likelihood() != options.likelihood {
            return Err(LaplaceError::LikelihoodUnsupported(format!(
                "backend computes {} curvature, approximation expects {}",
                backend.likelihood(),
                options.likelihood
            ))
            .into());
        }
        S::check_prior(&options.prior_precision)?;
        let layout = model.layout().clone();
        let prior = PriorSpec::new(
            options.prior_precision.clone(),
            options.prior_mean.clone(),
            &layout,
        )?;
        let map = model.parameters();
        if map.len() != layout.n_params() {
            return Err(LaplaceError::usage(format!(
                "model reports {} parameters for a layout of P = {}",
                map.len(),
                layout.n_params()
            ))
            .into());
        }
        let rng = StdRng::seed_from_u64(options.seed);

        Ok(Self {
            model,
            backend,
            posterior: S::init(&layout),
            options,
            prior,
            map,
            state: FitState::Unfit,
            loss: 0.0,
            n_data: 0,
            n_outputs: 0,
            rng,
        })
    }

    /// One pass over `data`, accumulating loss and curvature. A fitted
    /// approximation cannot be fitted again.
    pub fn fit(&mut self, data: &dyn DataSource) -> anyhow::Result<()> {
        if self.state != FitState::Unfit {
            return Err(LaplaceError::usage("approximation is already fitted").into());
        }
        self.state = FitState::Fitting;
        match self.fit_pass(data) {
            Ok(()) => {
                self.state = FitState::Fitted;
                info!(
                    "fitted {} Laplace: N = {}, C = {}, P = {}, loss = {:.4}",
                    S::name(),
                    self.n_data,
                    self.n_outputs,
                    self.map.len(),
                    self.loss
                );
                Ok(())
            }
            Err(e) => {
                self.posterior = S::init(self.prior.layout());
                self.loss = 0.0;
                self.n_data = 0;
                self.n_outputs = 0;
                self.state = FitState::Unfit;
                Err(e)
            }
        }
    }

    fn fit_pass(&mut self, data: &dyn DataSource) -> anyhow::Result<()> {
        self.model.eval();
        let n_data = data.num_data();
        if n_data == 0 {
            return Err(LaplaceError::usage("cannot fit on an empty data set").into());
        }
        let (x0, _) = data.batch(0, 1)?;
        let n_outputs = self.model.forward(&x0)?.ncols();

        let mut posterior = S::init(self.prior.layout());
        let mut loss = 0.0;
        for (lb, ub) in data.batch_intervals() {
            let (xx, yy) = data.batch(lb, ub)?;
            let (loss_batch, curv) = S::curvature(&self.backend, &self.model, &xx, &yy, n_data)?;
            debug!("batch [{}, {}): loss {:.4}", lb, ub, loss_batch);
            loss += loss_batch;
            posterior.accumulate(curv)?;
        }
        posterior.decompose(self.options.damping)?;

        self.posterior = posterior;
        self.loss = loss;
        self.n_data = n_data;
        self.n_outputs = n_outputs;
        Ok(())
    }

    fn check_fit(&self) -> anyhow::Result<()> {
        if self.state != FitState::Fitted {
            return Err(LaplaceError::usage("Laplace not fitted; run fit() first").into());
        }
        Ok(())
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn likelihood(&self) -> Likelihood {
        self.options.likelihood
    }

    pub fn options(&self) -> &LaplaceOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn map(&self) -> &DVec {
        &self.map
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    pub fn posterior(&self) -> &S {
        &self.posterior
    }

    pub fn sigma_noise(&self) -> f64 {
        self.options.sigma_noise
    }

    pub fn loss(&self) -> anyhow::Result<f64> {
        self.check_fit()?;
        Ok(self.loss)
    }

    pub fn n_data(&self) -> anyhow::Result<usize> {
        self.check_fit()?;
        Ok(self.n_data)
    }

    pub fn n_outputs(&self) -> anyhow::Result<usize> {
        self.check_fit()?;
        Ok(self.n_outputs)
    }

    /// `1 / (σ² T)`
    pub fn h_factor(&self) -> f64 {
        1.0 / (self.options.sigma_noise.powi(2) * self.options.temperature)
    }

    pub fn set_prior_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()> {
        S::check_prior(&precision)?;
        self.prior.set_precision(precision.clone())?;
        self.options.prior_precision = precision;
        self.posterior.invalidate();
        Ok(())
    }

    pub fn set_prior_mean(&mut self, mean: PriorMean) -> anyhow::Result<()> {
        self.prior.set_mean(mean.clone())?;
        self.options.prior_mean = mean;
        Ok(())
    }

    pub fn set_sigma_noise(&mut self, sigma_noise: f64) -> anyhow::Result<()> {
        if self.likelihood() == Likelihood::Classification {
            return Err(LaplaceError::config(
                "sigma_noise cannot be used with a classification likelihood",
            )
            .into());
        }
        if !(sigma_noise.is_finite() && sigma_noise > 0.0) {
            return Err(LaplaceError::config("sigma_noise must be positive").into());
        }
        self.options.sigma_noise = sigma_noise;
        self.posterior.invalidate();
        Ok(())
    }

    /// `(θ − m)ᵀ diag(p0) (θ − m)`
    pub fn scatter(&self) -> anyhow::Result<f64> {
        self.check_fit()?;
        let delta = &self.map - self.prior.expand_mean();
        Ok(delta
            .iter()
            .zip(self.prior.expand_precision().iter())
            .map(|(d, p)| d * d * p)
            .sum())
    }

    pub fn log_det_prior_precision(&self) -> f64 {
        self.prior.log_det()
    }

    pub fn log_det_posterior_precision(&self) -> anyhow::Result<f64> {
        self.check_fit()?;
        self.posterior
            .log_det(self.h_factor(), &self.prior.expand_precision())
    }

    pub fn log_det_ratio(&self) -> anyhow::Result<f64> {
        Ok(self.log_det_posterior_precision()? - self.log_det_prior_precision())
    }

    /// `−h·loss`, minus `N·C·log(σ√(2π))` for regression
    pub fn log_likelihood(&self) -> anyhow::Result<f64> {
        self.check_fit()?;
        let mut ret = -self.h_factor() * self.loss;
        if self.likelihood().is_regression() {
            let nc = (self.n_data * self.n_outputs) as f64;
            ret -= nc * (self.options.sigma_noise * (2.0 * PI).sqrt()).ln();
        }
        Ok(ret)
    }

    /// `log p(D) ≈ log_likelihood − ½(log_det_ratio + scatter)`,
    /// optionally after replacing the prior precision and noise
    pub fn log_marginal_likelihood(
        &mut self,
        prior_precision: Option<PriorPrecision>,
        sigma_noise: Option<f64>,
    ) -> anyhow::Result<f64> {
        self.check_fit()?;
        if let Some(p) = prior_precision {
            self.set_prior_precision(p)?;
        }
        if let Some(s) = sigma_noise {
            self.set_sigma_noise(s)?;
        }
        Ok(self.log_likelihood()? - 0.5 * (self.log_det_ratio()? + self.scatter()?))
    }

    /// Gradient of the log marginal likelihood w.r.t. the log prior
    /// precision, in the prior's own shape
    pub fn log_marginal_likelihood_gradient(&self) -> anyhow::Result<Vec<f64>> {
        self.check_fit()?;
        let p0 = self.prior.expand_precision();
        let dlogdet = self.posterior.log_det_gradient(self.h_factor(), &p0)?;
        let delta = &self.map - self.prior.expand_mean();
        let grad = DVec::from_iterator(
            p0.len(),
            (0..p0.len()).map(|i| -0.5 * (dlogdet[i] - 1.0 / p0[i] + delta[i] * delta[i])),
        );
        Ok(self
            .prior
            .reduce(&grad)
            .into_iter()
            .zip(self.prior.precision().values())
            .map(|(g, lam)| g * lam)
            .collect())
    }

    /// `n` parameter draws as the columns of a `P x n` matrix
    pub fn sample(&mut self, n: usize) -> anyhow::Result<Mat> {
        self.check_fit()?;
        let (h, p0) = (self.h_factor(), self.prior.expand_precision());
        self.posterior.sample(h, &p0, &self.map, n, &mut self.rng)
    }

    /// `J Σ Jᵀ` for externally computed Jacobians
    pub fn functional_variance(&self, jacs: &[Mat]) -> anyhow::Result<Vec<Mat>> {
        self.check_fit()?;
        self.check_jacobians(jacs, None)?;
        self.posterior
            .bilinear(self.h_factor(), &self.prior.expand_precision(), jacs)
    }

    fn check_jacobians(&self, jacs: &[Mat], n_rows: Option<usize>) -> anyhow::Result<()> {
        if let Some(n) = n_rows {
            if jacs.len() != n {
                return Err(LaplaceError::usage(format!(
                    "{} Jacobians for {} inputs",
                    jacs.len(),
                    n
                ))
                .into());
            }
        }
        let expected = (self.n_outputs, self.map.len());
        if let Some(j) = jacs.iter().find(|j| j.shape() != expected) {
            return Err(LaplaceError::usage(format!(
                "Jacobian of shape {:?}, expected {:?}",
                j.shape(),
                expected
            ))
            .into());
        }
        Ok(())
    }

    /// Linearised predictive: outputs at the MAP and `J Σ Jᵀ`
    pub fn glm_predictive_distribution(&self, xx: &Mat) -> anyhow::Result<(Mat, Vec<Mat>)> {
        self.check_fit()?;
        let (jacs, f_mu) = self.backend.jacobians(&self.model, xx)?;
        self.check_jacobians(&jacs, Some(xx.nrows()))?;
        let f_var = self
            .posterior
            .bilinear(self.h_factor(), &self.prior.expand_precision(), &jacs)?;
        Ok((f_mu, f_var))
    }

    /// Model outputs at `n` posterior draws; the MAP is back in the
    /// model on return, whether or not evaluation succeeded
    fn nn_samples(&mut self, xx: &Mat, n: usize) -> anyhow::Result<Vec<Mat>> {
        let thetas = self.sample(n)?;
        let mut guard = ParameterCheckpoint::new(&mut self.model, self.map.clone());
        let outputs = thetas
            .column_iter()
            .map(|theta| guard.forward_at(&theta.into_owned(), xx))
            .collect::<anyhow::Result<Vec<_>>>()?;
        guard.restore()?;
        Ok(outputs)
    }

    pub fn predict(
        &mut self,
        xx: &Mat,
        pred_type: PredType,
        link: LinkApprox,
        n_samples: usize,
    ) -> anyhow::Result<Predictive> {
        self.check_fit()?;
        match pred_type {
            PredType::Glm => {
                let (f_mu, f_var) = self.glm_predictive_distribution(xx)?;
                match self.likelihood() {
                    Likelihood::Regression => Ok(Predictive::Regression {
                        mean: f_mu,
                        covariance: f_var,
                    }),
                    Likelihood::Classification => {
                        let probs = classification_predictive(
                            &f_mu,
                            &f_var,
                            link,
                            n_samples,
                            &mut self.rng,
                        )?;
                        Ok(Predictive::Classification { probs })
                    }
                }
            }
            PredType::Nn => {
                if link != LinkApprox::Mc {
                    return Err(LaplaceError::config(format!(
                        "only mc link approximation is supported for nn prediction, got {}",
                        link
                    ))
                    .into());
                }
                let n = n_samples.max(1);
                let outputs = self.nn_samples(xx, n)?;
                match self.likelihood() {
                    Likelihood::Regression => {
                        let (mean, var) = sample_moments(&outputs);
                        let covariance = var
                            .row_iter()
                            .map(|r| Mat::from_diagonal(&r.transpose()))
                            .collect();
                        Ok(Predictive::Regression { mean, covariance })
                    }
                    Likelihood::Classification => {
                        let probs = outputs
                            .iter()
                            .map(softmax_rows)
                            .fold(Mat::zeros(xx.nrows(), self.n_outputs), |acc, p| acc + p)
                            / n as f64;
                        Ok(Predictive::Classification { probs })
                    }
                }
            }
            PredType::Gp => Err(LaplaceError::config(
                "gp prediction needs the functional approximation",
            )
            .into()),
        }
    }

    /// `n` draws from the predictive, each `n_test x C`; soft-maxed
    /// for classification
    pub fn predictive_samples(
        &mut self,
        xx: &Mat,
        pred_type: PredType,
        n: usize,
    ) -> anyhow::Result<Vec<Mat>> {
        self.check_fit()?;
        let samples = match pred_type {
            PredType::Glm => {
                let (f_mu, f_var) = self.glm_predictive_distribution(xx)?;
                let mut ret = vec![Mat::zeros(xx.nrows(), self.n_outputs); n];
                for (i, var) in f_var.iter().enumerate() {
                    let draws = sample_gaussian(&f_mu.row(i).transpose(), var, n, &mut self.rng);
                    for (s, out) in ret.iter_mut().enumerate() {
                        out.set_row(i, &draws.row(s));
                    }
                }
                ret
            }
            PredType::Nn => self.nn_samples(xx, n)?,
            PredType::Gp => {
                return Err(LaplaceError::config(
                    "gp prediction needs the functional approximation",
                )
                .into())
            }
        };
        Ok(match self.likelihood() {
            Likelihood::Regression => samples,
            Likelihood::Classification => samples.iter().map(softmax_rows).collect(),
        })
    }

    /// Everything needed to rebuild this approximation without data
    pub fn fitted_state(&self) -> anyhow::Result<FittedState<S>> {
        self.check_fit()?;
        Ok(FittedState {
            structure: S::name().into(),
            options: self.options.clone(),
            layout: self.prior.layout().clone(),
            map: self.map.iter().copied().collect(),
            posterior: self.posterior.clone(),
            loss: self.loss,
            n_data: self.n_data,
            n_outputs: self.n_outputs,
        })
    }

    /// Restore a fitted approximation; the saved MAP is written into
    /// `model`
    pub fn from_fitted_state(
        mut model: M,
        backend: B,
        state: FittedState<S>,
    ) -> anyhow::Result<Self> {
        if &*state.structure != S::name() {
            return Err(LaplaceError::config(format!(
                "saved state holds {} curvature, not {}",
                state.structure,
                S::name()
            ))
            .into());
        }
        if model.layout() != &state.layout {
            return Err(LaplaceError::config(
                "saved state does not match the model's parameter layout",
            )
            .into());
        }
        model.set_parameters(&DVec::from_vec(state.map))?;
        let mut ret = Self::new(model, backend, state.options)?;
        ret.posterior = state.posterior;
        ret.loss = state.loss;
        ret.n_data = state.n_data;
        ret.n_outputs = state.n_outputs;
        ret.state = FitState::Fitted;
        Ok(ret)
    }
}

impl<M: Model, B: CurvatureBackend<M>> ParametricLaplace<Dense, M, B> {
    pub fn posterior_precision(&self) -> anyhow::Result<Mat> {
        self.check_fit()?;
        Ok(self
            .posterior
            .precision(self.h_factor(), &self.prior.expand_precision()))
    }

    pub fn posterior_covariance(&self) -> anyhow::Result<Mat> {
        self.check_fit()?;
        self.posterior
            .covariance(self.h_factor(), &self.prior.expand_precision())
    }
}

impl<M: Model, B: CurvatureBackend<M>> ParametricLaplace<Kron, M, B> {
    pub fn posterior_precision(&self) -> anyhow::Result<Mat> {
        self.check_fit()?;
        self.posterior
            .dense_precision(self.h_factor(), &self.prior.expand_precision())
    }
}

impl<M: Model, B: CurvatureBackend<M>> ParametricLaplace<Diagonal, M, B> {
    pub fn posterior_precision(&self) -> anyhow::Result<DVec> {
        self.check_fit()?;
        Ok(self
            .posterior
            .precision(self.h_factor(), &self.prior.expand_precision()))
    }

    pub fn posterior_variance(&self) -> anyhow::Result<DVec> {
        self.check_fit()?;
        Ok(self
            .posterior
            .variance(self.h_factor(), &self.prior.expand_precision()))
    }
}

impl<S, M, B> LaplaceApproximation for ParametricLaplace<S, M, B>
where
    S: PosteriorStructure,
    M: Model,
    B: CurvatureBackend<M>,
{
    fn likelihood(&self) -> Likelihood {
        self.options.likelihood
    }

    fn sigma_noise(&self) -> f64 {
        self.options.sigma_noise
    }

    fn default_pred_type(&self) -> PredType {
        PredType::Glm
    }

    fn prior_precision(&self) -> PriorPrecision {
        self.prior.precision().clone()
    }

    fn set_prior_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()> {
        ParametricLaplace::set_prior_precision(self, precision)
    }

    fn lml(&mut self) -> anyhow::Result<f64> {
        self.log_marginal_likelihood(None, None)
    }

    fn lml_gradient(&mut self) -> anyhow::Result<Vec<f64>> {
        self.log_marginal_likelihood_gradient()
    }

    fn predict(
        &mut self,
        xx: &Mat,
        pred_type: PredType,
        link: LinkApprox,
        n_samples: usize,
    ) -> anyhow::Result<Predictive> {
        ParametricLaplace::predict(self, xx, pred_type, link, n_samples)
    }
}

/// Element-wise mean and unbiased variance of equally shaped matrices
fn sample_moments(samples: &[Mat]) -> (Mat, Mat) {
    let n = samples.len();
    let (nr, nc) = samples.first().map(|m| m.shape()).unwrap_or((0, 0));
    let mean = samples
        .iter()
        .fold(Mat::zeros(nr, nc), |acc, s| acc + s)
        / n.max(1) as f64;
    let sq = samples.iter().fold(Mat::zeros(nr, nc), |acc, s| {
        let d = s - &mean;
        acc + d.component_mul(&d)
    });
    let var = sq / n.saturating_sub(1).max(1) as f64;
    (mean, var)
}
