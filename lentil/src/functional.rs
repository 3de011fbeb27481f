//! Function-space dual of the Laplace approximation: a sparse GP over
//! the model outputs with the neural tangent kernel
//! `k(x, x') = J(x) diag(p0)⁻¹ J(x')ᵀ`, built on a subset of M training
//! points.
//!
//! Kernel rows are ordered point-major, row `b·C + c` holding output
//! `c` of inducing point `b`. With a diagonal kernel every output
//! channel gets its own `M x M` kernel.

use crate::backend::CurvatureBackend;
use crate::data::DataSource;
use crate::error::{numerical, LaplaceError};
use crate::likelihood::Likelihood;
use crate::link::{classification_predictive, sample_gaussian, LinkApprox};
use crate::model::Model;
use crate::optim::LaplaceApproximation;
use crate::options::{GpOptions, LaplaceOptions, PredType};
use crate::parametric::FitState;
use crate::predictive::Predictive;
use crate::prior::{PriorMean, PriorPrecision, PriorSpec};
use log::{debug, info, warn};
use matrix_util::dmatrix_linalg::{add_diag, add_scaled_identity};
use matrix_util::dmatrix_util::{softmax_rows, vstack};
use matrix_util::traits::{PrecisionOps, RowMajorOps};
use matrix_util::utils::sample_subset;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::f64::consts::PI;

type Mat = DMatrix<f64>;
type DVec = DVector<f64>;

/// One joint `MC x MC` matrix or one `M x M` matrix per channel
#[derive(Debug, Clone)]
enum KernelMatrix {
    Joint(Mat),
    PerChannel(Vec<Mat>),
}

/// Everything one fit pass produces
struct GpFit {
    inducing: Vec<usize>,
    batch_size: usize,
    prior_factor_sod: f64,
    k_mm: KernelMatrix,
    /// lower Cholesky factor(s) of `K_MM + L_MM⁻¹`
    sigma_chol: KernelMatrix,
    /// `y − (f + J(m − θ))` for regression, `M x C`
    mu: Option<Mat>,
    loss: f64,
    n_data: usize,
    n_outputs: usize,
}

pub struct FunctionalLaplace<M, B> {
    model: M,
    backend: B,
    options: LaplaceOptions,
    gp: GpOptions,
    prior: PriorSpec,
    map: DVec,
    state: FitState,
    data: Option<Box<dyn DataSource>>,
    fit: Option<GpFit>,
    stale: bool,
    rng: StdRng,
}

impl<M, B> FunctionalLaplace<M, B>
where
    M: Model,
    B: CurvatureBackend<M>,
{
    pub fn new(
        model: M,
        backend: B,
        options: LaplaceOptions,
        mut gp: GpOptions,
    ) -> anyhow::Result<Self> {
        options.validate()?;
        if backend.likelihood() != options.likelihood {
            return Err(LaplaceError::LikelihoodUnsupported(format!(
                "backend computes {} curvature, approximation expects {}",
                backend.likelihood(),
                options.likelihood
            ))
            .into());
        }
        if !backend.supports_functional() {
            return Err(LaplaceError::config(
                "the GP dual needs a generalized Gauss-Newton curvature backend",
            )
            .into());
        }
        if options.likelihood == Likelihood::Classification && !gp.diagonal_l {
            if gp.diagonal_kernel {
                return Err(LaplaceError::unsupported(
                    "classification with a diagonal kernel needs diagonal_L",
                )
                .into());
            }
            warn!("classification with a joint kernel forces diagonal_L");
            gp.diagonal_l = true;
        }
        if gp.n_inducing == Some(0) {
            return Err(LaplaceError::config("the inducing set cannot be empty").into());
        }

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
            options,
            gp,
            prior,
            map,
            state: FitState::Unfit,
            data: None,
            fit: None,
            stale: false,
            rng,
        })
    }

    /// Build the inducing kernel from `data`, which is kept for
    /// prediction and marginal-likelihood refits
    pub fn fit(&mut self, data: Box<dyn DataSource>) -> anyhow::Result<()> {
        if self.state != FitState::Unfit {
            return Err(LaplaceError::usage("approximation is already fitted").into());
        }
        self.state = FitState::Fitting;
        self.data = Some(data);
        match self.refit() {
            Ok(()) => {
                self.state = FitState::Fitted;
                let fit = self.fitted()?;
                if self.likelihood().is_regression()
                    && fit.n_outputs > 1
                    && self.gp.diagonal_kernel
                {
                    warn!(
                        "a diagonal GP kernel with multivariate regression \
                         is likely to overestimate the predictive variance"
                    );
                }
                info!(
                    "fitted GP Laplace: N = {}, M = {}, C = {}, loss = {:.4}",
                    fit.n_data,
                    fit.inducing.len(),
                    fit.n_outputs,
                    fit.loss
                );
                Ok(())
            }
            Err(e) => {
                self.data = None;
                self.fit = None;
                self.state = FitState::Unfit;
                Err(e)
            }
        }
    }

    /// The double pass over inducing batches
    fn refit(&mut self) -> anyhow::Result<()> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| LaplaceError::usage("no training data attached"))?;
        self.model.eval();

        let n_data = data.num_data();
        let batch_size = data.batch_size();
        if n_data == 0 || batch_size == 0 {
            return Err(LaplaceError::usage("GP fit needs data with a positive batch size").into());
        }
        let (x0, _) = data.batch(0, 1)?;
        let cc = self.model.forward(&x0)?.ncols();

        let m = self.gp.n_inducing.unwrap_or(n_data);
        if m > n_data {
            return Err(LaplaceError::config(format!(
                "{} inducing points requested from {} examples",
                m, n_data
            ))
            .into());
        }
        let inducing = sample_subset(n_data, m, self.gp.subset_seed);
        let batches = inducing.chunks(batch_size).collect::<Vec<_>>();
        let prior_factor_sod = m as f64 / n_data as f64;
        let prior_cov = self.prior_covariance(prior_factor_sod);
        let diff_mu = self.prior.expand_mean() - &self.map;
        let h = self.h_factor();
        let regression = self.likelihood().is_regression();

        let mut k_mm = if self.gp.diagonal_kernel {
            KernelMatrix::PerChannel(vec![Mat::zeros(m, m); cc])
        } else {
            KernelMatrix::Joint(Mat::zeros(m * cc, m * cc))
        };
        let mut loss = 0.0;
        let mut lambdas = Vec::with_capacity(m);
        let mut mu = Vec::with_capacity(batches.len());

        for (i, rows_i) in batches.iter().enumerate() {
            let (xi, yi) = data.select(rows_i)?;
            let gb = self.backend.gp_quantities(&self.model, &xi, &yi, h)?;
            check_jacobians(&gb.jacobians, rows_i.len(), cc, self.map.len())?;
            loss += gb.loss;
            if regression {
                let shift = Mat::from_fn(rows_i.len(), cc, |r, c| {
                    gb.jacobians[r].row(c).transpose().dot(&diff_mu)
                });
                mu.push(&yi - (&gb.outputs + shift));
            }
            lambdas.extend(gb.lambdas);

            for (j, rows_j) in batches.iter().enumerate().skip(i) {
                let block = if j == i {
                    kernel_block(&gb.jacobians, &gb.jacobians, &prior_cov, &k_mm)
                } else {
                    let (xj, _) = data.select(rows_j)?;
                    let (js_j, _) = self.backend.jacobians(&self.model, &xj)?;
                    check_jacobians(&js_j, rows_j.len(), cc, self.map.len())?;
                    kernel_block(&gb.jacobians, &js_j, &prior_cov, &k_mm)
                };
                store_block(&mut k_mm, &block, i * batch_size, j * batch_size, cc);
            }
            debug!("inducing batch {} of {}", i + 1, batches.len());
        }

        // L_MM is taken diagonal: exact for regression, an approximation
        // for classification
        let l_inv = |c: usize, n: usize| 1.0 / lambdas[n][(c, c)];
        let sigma_chol = match &k_mm {
            KernelMatrix::Joint(k) => {
                let d = DVec::from_fn(m * cc, |a, _| l_inv(a % cc, a / cc));
                KernelMatrix::Joint(
                    add_diag(k, &d)
                        .cholesky_lower()
                        .map_err(numerical("K_MM + L_MM⁻¹"))?,
                )
            }
            KernelMatrix::PerChannel(ks) => KernelMatrix::PerChannel(
                ks.iter()
                    .enumerate()
                    .map(|(c, k)| {
                        let d = DVec::from_fn(m, |n, _| l_inv(c, n));
                        add_diag(k, &d)
                            .cholesky_lower()
                            .map_err(numerical("K_MM + L_MM⁻¹"))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?,
            ),
        };

        self.fit = Some(GpFit {
            inducing,
            batch_size,
            prior_factor_sod,
            k_mm,
            sigma_chol,
            mu: if regression { Some(vstack(&mu)?) } else { None },
            loss,
            n_data,
            n_outputs: cc,
        });
        self.stale = false;
        Ok(())
    }

    fn fitted(&self) -> anyhow::Result<&GpFit> {
        match (&self.fit, self.state) {
            (Some(fit), FitState::Fitted) => Ok(fit),
            _ => Err(LaplaceError::usage("Laplace not fitted; run fit() first").into()),
        }
    }

    /// Refit after a prior or noise change
    fn ensure_current(&mut self) -> anyhow::Result<()> {
        self.fitted()?;
        if self.stale {
            self.refit()?;
        }
        Ok(())
    }

    /// `(M/N) / p0`
    fn prior_covariance(&self, prior_factor_sod: f64) -> DVec {
        self.prior
            .expand_precision()
            .map(|p| prior_factor_sod / p)
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn likelihood(&self) -> Likelihood {
        self.options.likelihood
    }

    pub fn gp_options(&self) -> &GpOptions {
        &self.gp
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn map(&self) -> &DVec {
        &self.map
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    pub fn sigma_noise(&self) -> f64 {
        self.options.sigma_noise
    }

    pub fn h_factor(&self) -> f64 {
        1.0 / (self.options.sigma_noise.powi(2) * self.options.temperature)
    }

    /// Sorted indexes of the inducing points
    pub fn inducing_indices(&self) -> anyhow::Result<&[usize]> {
        Ok(&self.fitted()?.inducing)
    }

    pub fn loss(&self) -> anyhow::Result<f64> {
        Ok(self.fitted()?.loss)
    }

    pub fn n_data(&self) -> anyhow::Result<usize> {
        Ok(self.fitted()?.n_data)
    }

    pub fn n_outputs(&self) -> anyhow::Result<usize> {
        Ok(self.fitted()?.n_outputs)
    }

    pub fn set_prior_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()> {
        self.prior.set_precision(precision.clone())?;
        self.options.prior_precision = precision;
        self.stale = true;
        Ok(())
    }

    pub fn set_prior_mean(&mut self, mean: PriorMean) -> anyhow::Result<()> {
        self.prior.set_mean(mean.clone())?;
        self.options.prior_mean = mean;
        self.stale = true;
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
        self.stale = true;
        Ok(())
    }

    /// Outputs at the MAP and `K_** − K_*M (K_MM + L_MM⁻¹)⁻¹ K_M*` for
    /// every test input
    pub fn gp_posterior(&mut self, xx: &Mat) -> anyhow::Result<(Mat, Vec<Mat>)> {
        self.ensure_current()?;
        let fit = self.fitted()?;
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| LaplaceError::usage("no training data attached"))?;
        let (cc, pp) = (fit.n_outputs, self.map.len());

        let (js_star, f_mu) = self.backend.jacobians(&self.model, xx)?;
        check_jacobians(&js_star, xx.nrows(), cc, pp)?;
        let prior_cov = self.prior_covariance(fit.prior_factor_sod);

        let mut js_m = Vec::with_capacity(fit.inducing.len());
        for rows in fit.inducing.chunks(fit.batch_size) {
            let (x, _) = data.select(rows)?;
            let (js, _) = self.backend.jacobians(&self.model, &x)?;
            check_jacobians(&js, rows.len(), cc, pp)?;
            js_m.extend(js);
        }

        let f_var = match &fit.sigma_chol {
            KernelMatrix::Joint(chol) => {
                let s_m = scale_columns(&vstack(&js_m)?, &prior_cov);
                js_star
                    .par_iter()
                    .map(|j| {
                        let k_ms = &s_m * j.transpose();
                        let v = solve_lower(chol, &k_ms)?;
                        let k_ss = scale_columns(j, &prior_cov) * j.transpose();
                        Ok::<_, anyhow::Error>(k_ss - v.transpose() * v)
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
            KernelMatrix::PerChannel(chols) => {
                let s_m = (0..cc)
                    .map(|c| {
                        Mat::from_fn(js_m.len(), pp, |r, q| js_m[r][(c, q)] * prior_cov[q])
                    })
                    .collect::<Vec<_>>();
                js_star
                    .par_iter()
                    .map(|j| {
                        let mut var = DVec::zeros(cc);
                        for c in 0..cc {
                            let jc = j.row(c).transpose();
                            let k_ms = &s_m[c] * &jc;
                            let k_ms = Mat::from_column_slice(k_ms.len(), 1, k_ms.as_slice());
                            let v = solve_lower(&chols[c], &k_ms)?;
                            let k_ss = jc.component_mul(&prior_cov).dot(&jc);
                            var[c] = k_ss - v.norm_squared();
                        }
                        Ok::<_, anyhow::Error>(Mat::from_diagonal(&var))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
        };
        Ok((f_mu, f_var))
    }

    pub fn predict(
        &mut self,
        xx: &Mat,
        pred_type: PredType,
        link: LinkApprox,
        n_samples: usize,
    ) -> anyhow::Result<Predictive> {
        if pred_type != PredType::Gp {
            return Err(LaplaceError::config(format!(
                "only gp prediction is supported by the functional approximation, got {}",
                pred_type
            ))
            .into());
        }
        let (f_mu, f_var) = self.gp_posterior(xx)?;
        match self.likelihood() {
            Likelihood::Regression => Ok(Predictive::Regression {
                mean: f_mu,
                covariance: f_var,
            }),
            Likelihood::Classification => {
                let probs =
                    classification_predictive(&f_mu, &f_var, link, n_samples, &mut self.rng)?;
                Ok(Predictive::Classification { probs })
            }
        }
    }

    /// `n` draws from the GP posterior, each `n_test x C`; soft-maxed
    /// for classification
    pub fn predictive_samples(&mut self, xx: &Mat, n: usize) -> anyhow::Result<Vec<Mat>> {
        let (f_mu, f_var) = self.gp_posterior(xx)?;
        let mut ret = vec![Mat::zeros(f_mu.nrows(), f_mu.ncols()); n];
        for (i, var) in f_var.iter().enumerate() {
            let draws = sample_gaussian(&f_mu.row(i).transpose(), var, n, &mut self.rng);
            for (s, out) in ret.iter_mut().enumerate() {
                out.set_row(i, &draws.row(s));
            }
        }
        Ok(match self.likelihood() {
            Likelihood::Regression => ret,
            Likelihood::Classification => ret.iter().map(softmax_rows).collect(),
        })
    }

    fn check_regression(&self) -> anyhow::Result<()> {
        if self.likelihood() == Likelihood::Classification {
            return Err(LaplaceError::unsupported(
                "the GP marginal likelihood is only available for regression",
            )
            .into());
        }
        Ok(())
    }

    /// `−½(log|K_MM + σ²I| + μᵀ(K_MM + σ²I)⁻¹μ + MC log 2π)` after a
    /// full refit with the current (or overriding) prior and noise
    pub fn log_marginal_likelihood(
        &mut self,
        prior_precision: Option<PriorPrecision>,
        sigma_noise: Option<f64>,
    ) -> anyhow::Result<f64> {
        self.fitted()?;
        self.check_regression()?;
        if let Some(p) = prior_precision {
            self.set_prior_precision(p)?;
        }
        if let Some(s) = sigma_noise {
            self.set_sigma_noise(s)?;
        }
        self.refit()?;
        Ok(self.marglik_terms(false)?.0)
    }

    /// Derivative of the log marginal likelihood w.r.t. a scalar log
    /// prior precision, `½ tr(A⁻¹K) − ½ αᵀKα` with `A = K + σ²I` and
    /// `α = A⁻¹μ`
    pub fn log_marginal_likelihood_gradient(&mut self) -> anyhow::Result<Vec<f64>> {
        self.fitted()?;
        self.check_regression()?;
        if !matches!(self.prior.precision(), PriorPrecision::Scalar(_)) {
            return Err(LaplaceError::unsupported(
                "GP marginal-likelihood gradients need a scalar prior precision",
            )
            .into());
        }
        self.refit()?;
        Ok(vec![self.marglik_terms(true)?.1])
    }

    fn marglik_terms(&self, with_grad: bool) -> anyhow::Result<(f64, f64)> {
        let fit = self.fitted()?;
        let mu = fit
            .mu
            .as_ref()
            .ok_or_else(|| LaplaceError::usage("no regression residuals recorded"))?;
        let s2 = self.options.sigma_noise.powi(2);

        let terms = |k: &Mat, mu: DVec| -> anyhow::Result<(f64, f64, f64)> {
            let a = add_scaled_identity(k, s2);
            let chol = Cholesky::<f64, Dyn>::new(a)
                .ok_or_else(|| LaplaceError::numerical("K_MM + σ²I is not positive definite"))?;
            let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|x| x.ln()).sum::<f64>();
            let alpha = chol.solve(&mu);
            let scatter = mu.dot(&alpha);
            let grad = if with_grad {
                0.5 * chol.solve(k).trace() - 0.5 * alpha.dot(&(k * &alpha))
            } else {
                0.0
            };
            Ok((log_det, scatter, grad))
        };

        let (log_det, scatter, grad) = match &fit.k_mm {
            KernelMatrix::Joint(k) => terms(k, DVec::from_vec(mu.to_row_major()))?,
            KernelMatrix::PerChannel(ks) => ks.iter().enumerate().try_fold(
                (0.0, 0.0, 0.0),
                |acc, (c, k)| -> anyhow::Result<(f64, f64, f64)> {
                    let (l, s, g) = terms(k, mu.column(c).into_owned())?;
                    Ok((acc.0 + l, acc.1 + s, acc.2 + g))
                },
            )?,
        };
        let mc = (fit.inducing.len() * fit.n_outputs) as f64;
        let lml = -0.5 * (log_det + scatter + mc * (2.0 * PI).ln());
        Ok((lml, grad))
    }
}

impl<M, B> LaplaceApproximation for FunctionalLaplace<M, B>
where
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
        PredType::Gp
    }

    fn prior_precision(&self) -> PriorPrecision {
        self.prior.precision().clone()
    }

    fn set_prior_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()> {
        FunctionalLaplace::set_prior_precision(self, precision)
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
        FunctionalLaplace::predict(self, xx, pred_type, link, n_samples)
    }
}

fn check_jacobians(jacs: &[Mat], n: usize, cc: usize, pp: usize) -> anyhow::Result<()> {
    if jacs.len() != n || jacs.iter().any(|j| j.shape() != (cc, pp)) {
        return Err(LaplaceError::usage(format!(
            "expected {} Jacobians of shape ({}, {})",
            n, cc, pp
        ))
        .into());
    }
    Ok(())
}

/// `X diag(d)`
fn scale_columns(xx: &Mat, dd: &DVec) -> Mat {
    let mut ret = xx.clone();
    for (mut col, d) in ret.column_iter_mut().zip(dd.iter()) {
        col *= *d;
    }
    ret
}

fn solve_lower(ll: &Mat, bb: &Mat) -> anyhow::Result<Mat> {
    ll.solve_lower_triangular(bb)
        .ok_or_else(|| LaplaceError::numerical("singular Cholesky factor").into())
}

/// Kernel between two batches, in the layout of `like`
fn kernel_block(js1: &[Mat], js2: &[Mat], prior_cov: &DVec, like: &KernelMatrix) -> KernelMatrix {
    match like {
        KernelMatrix::Joint(_) => {
            let s1 = stack_rows(js1);
            let s2 = stack_rows(js2);
            KernelMatrix::Joint(scale_columns(&s1, prior_cov) * s2.transpose())
        }
        KernelMatrix::PerChannel(ks) => KernelMatrix::PerChannel(
            (0..ks.len())
                .map(|c| {
                    let a = Mat::from_fn(js1.len(), prior_cov.len(), |r, q| {
                        js1[r][(c, q)] * prior_cov[q]
                    });
                    let b = Mat::from_fn(js2.len(), prior_cov.len(), |r, q| js2[r][(c, q)]);
                    a * b.transpose()
                })
                .collect(),
        ),
    }
}

/// Per-example `C x P` Jacobians stacked into `(n·C) x P`
fn stack_rows(jacs: &[Mat]) -> Mat {
    let (cc, pp) = jacs.first().map(|j| j.shape()).unwrap_or((0, 0));
    let mut ret = Mat::zeros(jacs.len() * cc, pp);
    for (b, j) in jacs.iter().enumerate() {
        ret.view_mut((b * cc, 0), (cc, pp)).copy_from(j);
    }
    ret
}

/// Write block `(i, j)` of the inducing kernel and its mirror image
fn store_block(k_mm: &mut KernelMatrix, block: &KernelMatrix, lb_i: usize, lb_j: usize, cc: usize) {
    match (k_mm, block) {
        (KernelMatrix::Joint(k), KernelMatrix::Joint(b)) => {
            let (r, c) = (lb_i * cc, lb_j * cc);
            k.view_mut((r, c), b.shape()).copy_from(b);
            if r != c {
                let bt = b.transpose();
                k.view_mut((c, r), bt.shape()).copy_from(&bt);
            }
        }
        (KernelMatrix::PerChannel(ks), KernelMatrix::PerChannel(bs)) => {
            for (k, b) in ks.iter_mut().zip(bs) {
                k.view_mut((lb_i, lb_j), b.shape()).copy_from(b);
                if lb_i != lb_j {
                    let bt = b.transpose();
                    k.view_mut((lb_j, lb_i), bt.shape()).copy_from(&bt);
                }
            }
        }
        _ => {}
    }
}
