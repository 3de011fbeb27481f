//! Tuning the prior precision: gradient ascent on the log marginal
//! likelihood, or a grid search against a held-out loss.

use crate::data::DataSource;
use crate::error::LaplaceError;
use crate::likelihood::{class_labels, Likelihood};
use crate::link::LinkApprox;
use crate::options::PredType;
use crate::predictive::Predictive;
use crate::prior::PriorPrecision;
use log::{debug, info, warn};
use matrix_util::utils::logspace;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::str::FromStr;

type Mat = DMatrix<f64>;

/// What the optimiser needs from an approximation
pub trait LaplaceApproximation {
    fn likelihood(&self) -> Likelihood;

    fn sigma_noise(&self) -> f64;

    fn default_pred_type(&self) -> PredType;

    fn prior_precision(&self) -> PriorPrecision;

    fn set_prior_precision(&mut self, precision: PriorPrecision) -> anyhow::Result<()>;

    /// Log marginal likelihood under the current hyperparameters
    fn lml(&mut self) -> anyhow::Result<f64>;

    /// Its gradient w.r.t. the log prior precision, in the prior's shape
    fn lml_gradient(&mut self) -> anyhow::Result<Vec<f64>>;

    fn predict(
        &mut self,
        xx: &Mat,
        pred_type: PredType,
        link: LinkApprox,
        n_samples: usize,
    ) -> anyhow::Result<Predictive>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorOptMethod {
    /// Adam on the log prior precision against −log marginal likelihood
    #[serde(rename = "marglik")]
    Marglik,
    /// grid search on a held-out set
    #[serde(rename = "CV")]
    Cv,
}

impl FromStr for PriorOptMethod {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "marglik" => Ok(Self::Marglik),
            "cv" => Ok(Self::Cv),
            _ => Err(LaplaceError::config(format!(
                "Invalid prior optimisation method {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorOptimOptions {
    /// Default: marglik
    pub method: PriorOptMethod,
    /// Adam steps. Default: 100
    pub n_steps: usize,
    /// Adam learning rate. Default: 0.1
    pub lr: f64,
    /// Starting value of every prior precision entry. Default: 1.0
    pub init_prior_prec: f64,
    /// Grid bounds in log10. Default: -4 and 4
    pub log_prior_prec_min: f64,
    pub log_prior_prec_max: f64,
    /// Default: 100
    pub grid_size: usize,
    /// Prediction type on the held-out set. Default: the approximation's own
    pub pred_type: Option<PredType>,
    /// Default: probit
    pub link_approx: LinkApprox,
    /// Default: 100
    pub n_samples: usize,
}

impl Default for PriorOptimOptions {
    fn default() -> Self {
        PriorOptimOptions {
            method: PriorOptMethod::Marglik,
            n_steps: 100,
            lr: 0.1,
            init_prior_prec: 1.0,
            log_prior_prec_min: -4.0,
            log_prior_prec_max: 4.0,
            grid_size: 100,
            pred_type: None,
            link_approx: LinkApprox::Probit,
            n_samples: 100,
        }
    }
}

/// Adam with bias correction
pub struct Adam {
    m: Vec<f64>,
    v: Vec<f64>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: usize,
}

impl Adam {
    pub fn new(n_params: usize, lr: f64) -> Self {
        Self {
            m: vec![0.0; n_params],
            v: vec![0.0; n_params],
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
        }
    }

    /// One descent step on `params` along `grads`
    pub fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        for i in 0..params.len() {
            let g = grads[i];
            if !g.is_finite() {
                continue;
            }
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// Optimise the prior precision in place with the default held-out
/// loss, the negative log predictive likelihood
pub fn optimize_prior_precision<A: LaplaceApproximation + ?Sized>(
    la: &mut A,
    opts: &PriorOptimOptions,
    val_data: Option<&dyn DataSource>,
) -> anyhow::Result<PriorPrecision> {
    let sigma2 = la.sigma_noise().powi(2);
    let loss = move |pred: &Predictive, yy: &Mat| nll(pred, yy, sigma2);
    optimize_prior_precision_with(la, opts, val_data, &loss)
}

/// Same as [`optimize_prior_precision`] with a caller-supplied
/// held-out loss
pub fn optimize_prior_precision_with<A: LaplaceApproximation + ?Sized>(
    la: &mut A,
    opts: &PriorOptimOptions,
    val_data: Option<&dyn DataSource>,
    loss: &dyn Fn(&Predictive, &Mat) -> anyhow::Result<f64>,
) -> anyhow::Result<PriorPrecision> {
    match opts.method {
        PriorOptMethod::Marglik => marglik(la, opts)?,
        PriorOptMethod::Cv => {
            let val_data = val_data.ok_or_else(|| {
                LaplaceError::config("CV needs a validation data source")
            })?;
            gridsearch(la, opts, val_data, loss)?
        }
    }
    let ret = la.prior_precision();
    info!("optimised prior precision: {:?}", ret.values());
    Ok(ret)
}

fn marglik<A: LaplaceApproximation + ?Sized>(
    la: &mut A,
    opts: &PriorOptimOptions,
) -> anyhow::Result<()> {
    if !(opts.init_prior_prec.is_finite() && opts.init_prior_prec > 0.0) {
        return Err(LaplaceError::config("init_prior_prec must be positive").into());
    }
    let shape = la.prior_precision();
    let k = shape.values().len();
    let mut log_prec = vec![opts.init_prior_prec.ln(); k];
    let mut adam = Adam::new(k, opts.lr);

    for step in 0..opts.n_steps {
        let prec = log_prec.iter().map(|x| x.exp()).collect::<Vec<_>>();
        la.set_prior_precision(shape.with_values(&prec)?)?;
        let grad = la.lml_gradient()?;
        let neg_grad = grad.iter().map(|g| -g).collect::<Vec<_>>();
        adam.step(&mut log_prec, &neg_grad);
        debug!("step {}: gradient {:?}", step, grad);
    }

    let prec = log_prec.iter().map(|x| x.exp()).collect::<Vec<_>>();
    la.set_prior_precision(shape.with_values(&prec)?)?;
    info!("log marginal likelihood after {} steps: {:.4}", opts.n_steps, la.lml()?);
    Ok(())
}

fn gridsearch<A: LaplaceApproximation + ?Sized>(
    la: &mut A,
    opts: &PriorOptimOptions,
    val_data: &dyn DataSource,
    loss: &dyn Fn(&Predictive, &Mat) -> anyhow::Result<f64>,
) -> anyhow::Result<()> {
    let pred_type = opts.pred_type.unwrap_or_else(|| la.default_pred_type());
    let candidates = logspace(
        opts.log_prior_prec_min,
        opts.log_prior_prec_max,
        opts.grid_size,
    );

    let mut best: Option<(f64, f64)> = None;
    for &prec in candidates.iter() {
        let score = match evaluate_candidate(la, prec, pred_type, opts, val_data, loss) {
            Ok(s) if s.is_finite() => s,
            Ok(_) => f64::INFINITY,
            Err(e) => {
                warn!("prior precision {:.3e} failed: {}", prec, e);
                f64::INFINITY
            }
        };
        debug!("prior precision {:.3e}: held-out loss {:.4}", prec, score);
        if best.map_or(true, |(_, b)| score < b) {
            best = Some((prec, score));
        }
    }

    let prec = match best {
        Some((prec, score)) if score.is_finite() => prec,
        Some(_) => {
            warn!(
                "no prior precision candidate scored a finite loss, keeping {:.3e}",
                candidates[0]
            );
            candidates[0]
        }
        None => return Err(LaplaceError::config("empty prior precision grid").into()),
    };
    la.set_prior_precision(PriorPrecision::Scalar(prec))?;
    Ok(())
}

fn evaluate_candidate<A: LaplaceApproximation + ?Sized>(
    la: &mut A,
    prec: f64,
    pred_type: PredType,
    opts: &PriorOptimOptions,
    val_data: &dyn DataSource,
    loss: &dyn Fn(&Predictive, &Mat) -> anyhow::Result<f64>,
) -> anyhow::Result<f64> {
    la.set_prior_precision(PriorPrecision::Scalar(prec))?;
    let mut total = 0.0;
    for (lb, ub) in val_data.batch_intervals() {
        let (xx, yy) = val_data.batch(lb, ub)?;
        let pred = la.predict(&xx, pred_type, opts.link_approx, opts.n_samples)?;
        total += loss(&pred, &yy)?;
    }
    Ok(total)
}

/// Summed negative log predictive likelihood of `yy`; regression adds
/// the observation noise `sigma2` to the predictive variance
pub fn nll(pred: &Predictive, yy: &Mat, sigma2: f64) -> anyhow::Result<f64> {
    match pred {
        Predictive::Regression { mean, .. } => {
            let var = pred
                .variance()
                .ok_or_else(|| anyhow::anyhow!("missing predictive variance"))?;
            if yy.shape() != mean.shape() {
                return Err(LaplaceError::usage("targets do not match the predictive mean").into());
            }
            Ok(mean
                .iter()
                .zip(var.iter())
                .zip(yy.iter())
                .map(|((m, v), y)| {
                    let v = v + sigma2;
                    0.5 * ((2.0 * PI * v).ln() + (y - m).powi(2) / v)
                })
                .sum())
        }
        Predictive::Classification { probs } => {
            let labels = class_labels(yy, probs.ncols())?;
            Ok(labels
                .iter()
                .enumerate()
                .map(|(i, &k)| -probs[(i, k)].max(f64::MIN_POSITIVE).ln())
                .sum())
        }
    }
}
