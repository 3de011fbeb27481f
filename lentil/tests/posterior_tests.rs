mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::*;
use lentil::backend::{CurvatureBackend, GpBatch, KronFactors};
use lentil::error::ErrorKind;
use lentil::likelihood::Likelihood;
use lentil::model::{DifferentiableModel, LayerTerms, Model, ParamLayout};
use lentil::options::{LaplaceOptions, PredType};
use lentil::link::LinkApprox;
use lentil::parametric::{DiagLaplace, FullLaplace, KronLaplace};
use lentil::prior::PriorPrecision;
use std::cell::Cell;

fn fitted_full(prec: f64) -> anyhow::Result<FullLaplace<lentil::mlp::Mlp, lentil::JacobianBackend>> {
    let (xx, yy) = toy_regression(40, 0.1, 1);
    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::Scalar(prec),
        sigma_noise: 0.3,
        ..LaplaceOptions::regression()
    };
    let mut la = FullLaplace::new(mlp(&[2, 5, 1], 3), regression_backend(), opts)?;
    la.fit(&data(&xx, &yy, 16))?;
    Ok(la)
}

fn min_eigenvalue(aa: &Mat) -> f64 {
    aa.clone().symmetric_eigen().eigenvalues.min()
}

#[test]
fn posterior_precision_dominates_the_prior() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(40, 0.1, 2);
    let train = data(&xx, &yy, 10);
    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::PerLayer(vec![0.5, 1.0, 2.0, 4.0]),
        ..LaplaceOptions::regression()
    };

    let mut full = FullLaplace::new(mlp(&[2, 4, 1], 1), regression_backend(), opts.clone())?;
    full.fit(&train)?;
    let p0 = full.prior().expand_precision();
    let gap = full.posterior_precision()? - Mat::from_diagonal(&p0);
    assert!(min_eigenvalue(&gap) > -1e-9);

    let mut kron = KronLaplace::new(mlp(&[2, 4, 1], 1), regression_backend(), opts.clone())?;
    kron.fit(&train)?;
    let gap = kron.posterior_precision()? - Mat::from_diagonal(&p0);
    assert!(min_eigenvalue(&gap) > -1e-9);

    let mut diag = DiagLaplace::new(mlp(&[2, 4, 1], 1), regression_backend(), opts)?;
    diag.fit(&train)?;
    let prec = diag.posterior_precision()?;
    assert!(prec.iter().zip(p0.iter()).all(|(a, b)| a >= b));
    Ok(())
}

fn log_det(aa: &Mat) -> anyhow::Result<f64> {
    let chol = aa
        .clone()
        .cholesky()
        .ok_or_else(|| anyhow::anyhow!("not positive definite"))?;
    Ok(2.0 * chol.l().diagonal().iter().map(|x| x.ln()).sum::<f64>())
}

fn per_layer_opts() -> LaplaceOptions {
    LaplaceOptions {
        prior_precision: PriorPrecision::PerLayer(vec![0.5, 1.0, 2.0, 4.0]),
        sigma_noise: 0.3,
        ..LaplaceOptions::regression()
    }
}

#[test]
fn log_det_ratio_matches_explicit_determinants() -> anyhow::Result<()> {
    let la = fitted_full(2.0)?;
    let prec = la.posterior_precision()?;
    let p0 = la.prior().expand_precision();
    let explicit = prec.determinant().ln() - p0.iter().map(|p| p.ln()).sum::<f64>();
    assert_relative_eq!(la.log_det_ratio()?, explicit, max_relative = 1e-8);

    let lml = la.log_likelihood()? - 0.5 * (la.log_det_ratio()? + la.scatter()?);
    let mut la = la;
    assert_abs_diff_eq!(la.log_marginal_likelihood(None, None)?, lml, epsilon = 1e-12);
    Ok(())
}

#[test]
fn log_det_ratio_holds_for_every_structure_with_a_per_layer_prior() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(40, 0.1, 16);
    let train = data(&xx, &yy, 12);

    let mut full = FullLaplace::new(mlp(&[2, 5, 1], 8), regression_backend(), per_layer_opts())?;
    full.fit(&train)?;
    let p0 = full.prior().expand_precision();
    let log_det_p0 = p0.iter().map(|p| p.ln()).sum::<f64>();
    assert_relative_eq!(full.log_det_prior_precision(), log_det_p0, max_relative = 1e-12);
    let explicit = log_det(&full.posterior_precision()?)? - log_det_p0;
    assert_relative_eq!(full.log_det_ratio()?, explicit, max_relative = 1e-8);

    let mut kron = KronLaplace::new(mlp(&[2, 5, 1], 8), regression_backend(), per_layer_opts())?;
    kron.fit(&train)?;
    let explicit = log_det(&kron.posterior_precision()?)? - log_det_p0;
    assert_relative_eq!(kron.log_det_ratio()?, explicit, max_relative = 1e-8);

    let mut diag = DiagLaplace::new(mlp(&[2, 5, 1], 8), regression_backend(), per_layer_opts())?;
    diag.fit(&train)?;
    let explicit = diag.posterior_precision()?.iter().map(|p| p.ln()).sum::<f64>() - log_det_p0;
    assert_relative_eq!(diag.log_det_ratio()?, explicit, max_relative = 1e-8);
    assert_relative_eq!(
        diag.log_det_posterior_precision()?,
        diag.log_det_ratio()? + log_det_p0,
        max_relative = 1e-12
    );
    Ok(())
}

#[test]
fn samples_follow_the_posterior() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(30, 0.1, 4);
    let w0 = Mat::from_row_slice(1, 3, &[0.5, -0.2, 0.1]);
    let xx = Mat::from_fn(30, 3, |i, j| if j < 2 { xx[(i, j)] } else { 1.0 });
    let opts = LaplaceOptions {
        sigma_noise: 0.5,
        ..LaplaceOptions::regression()
    };
    let n = 20000;

    let mut full = FullLaplace::new(Linear::new(w0.clone()), regression_backend(), opts.clone())?;
    full.fit(&data(&xx, &yy, 8))?;
    let cov = full.posterior_covariance()?;
    let draws = full.sample(n)?;
    let mean = draws.column_mean();
    assert_abs_diff_eq!(mean, full.map().clone(), epsilon = 0.05 * cov.max().sqrt());
    let centred = Mat::from_fn(3, n, |i, s| draws[(i, s)] - mean[i]);
    let emp = &centred * centred.transpose() / (n - 1) as f64;
    assert_abs_diff_eq!(emp, cov, epsilon = 0.05 * cov.max());

    let mut kron = KronLaplace::new(Linear::new(w0.clone()), regression_backend(), opts.clone())?;
    kron.fit(&data(&xx, &yy, 8))?;
    let cov_k = kron
        .posterior_precision()?
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("singular"))?;
    let draws = kron.sample(n)?;
    let mean = draws.column_mean();
    let centred = Mat::from_fn(3, n, |i, s| draws[(i, s)] - mean[i]);
    let emp = &centred * centred.transpose() / (n - 1) as f64;
    assert_abs_diff_eq!(emp, cov_k, epsilon = 0.05 * cov_k.max());

    let mut diag = DiagLaplace::new(Linear::new(w0), regression_backend(), opts)?;
    diag.fit(&data(&xx, &yy, 8))?;
    let var = diag.posterior_variance()?;
    let draws = diag.sample(n)?;
    for i in 0..3 {
        let row = draws.row(i);
        let m = row.mean();
        let v = row.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert_relative_eq!(v, var[i], max_relative = 0.05);
    }
    Ok(())
}

#[test]
fn kron_equals_dense_for_a_single_output_linear_model() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(25, 0.1, 5);
    let w0 = Mat::from_row_slice(1, 2, &[0.3, 0.7]);
    let train = data(&xx, &yy, 7);

    let mut full = FullLaplace::new(Linear::new(w0.clone()), regression_backend(), LaplaceOptions::regression())?;
    full.fit(&train)?;
    let mut kron = KronLaplace::new(Linear::new(w0), regression_backend(), LaplaceOptions::regression())?;
    kron.fit(&train)?;

    assert_abs_diff_eq!(full.posterior_precision()?, kron.posterior_precision()?, epsilon = 1e-8);
    assert_abs_diff_eq!(full.log_det_ratio()?, kron.log_det_ratio()?, epsilon = 1e-8);
    Ok(())
}

#[test]
fn repeated_queries_are_idempotent() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let (xt, _) = toy_regression(5, 0.1, 9);
    let a = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    let b = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    assert_eq!(a.mean(), b.mean());
    assert_eq!(a.variance(), b.variance());
    assert_eq!(
        la.log_marginal_likelihood(None, None)?,
        la.log_marginal_likelihood(None, None)?
    );

    la.set_prior_precision(PriorPrecision::Scalar(10.0))?;
    la.set_prior_precision(PriorPrecision::Scalar(1.0))?;
    let c = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    assert_abs_diff_eq!(a.variance().unwrap(), c.variance().unwrap(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn prior_precision_reads_back_as_set() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let per_layer = PriorPrecision::PerLayer(vec![0.5, 2.0, 3.0, 4.0]);
    la.set_prior_precision(per_layer.clone())?;
    assert_eq!(la.prior().precision(), &per_layer);
    assert_eq!(la.prior().expand_precision()[0], 0.5);
    Ok(())
}

#[test]
fn stronger_prior_shrinks_the_variance() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let (xt, _) = toy_regression(5, 0.1, 9);
    let loose = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    la.set_prior_precision(PriorPrecision::Scalar(100.0))?;
    let tight = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    let (loose, tight) = (loose.variance().unwrap(), tight.variance().unwrap());
    assert!(tight.iter().zip(loose.iter()).all(|(t, l)| t < l));
    Ok(())
}

#[test]
fn nn_prediction_restores_the_map() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let before = la.model().parameters();
    let (xt, _) = toy_regression(4, 0.1, 11);
    let pred = la.predict(&xt, PredType::Nn, LinkApprox::Mc, 50)?;
    assert_eq!(la.model().parameters(), before);
    assert_eq!(pred.mean().shape(), (4, 1));
    Ok(())
}

fn assert_vanishing(vars: &[Mat]) {
    for v in vars {
        assert!(v.iter().all(|x| x.abs() < 1e-6), "variance did not vanish: {}", v);
    }
}

#[test]
fn overwhelming_prior_collapses_every_structure() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(30, 0.1, 12);
    let (xt, _) = toy_regression(6, 0.1, 13);
    let train = data(&xx, &yy, 10);
    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::Scalar(1e10),
        ..LaplaceOptions::regression()
    };

    let mut full = FullLaplace::new(mlp(&[2, 4, 1], 4), regression_backend(), opts.clone())?;
    full.fit(&train)?;
    let (jacs, _) = full.backend().jacobians(full.model(), &xt)?;
    assert_vanishing(&full.functional_variance(&jacs)?);
    assert!(full.posterior_covariance()?.iter().all(|v| v.abs() < 1e-9));

    let mut kron = KronLaplace::new(mlp(&[2, 4, 1], 4), regression_backend(), opts.clone())?;
    kron.fit(&train)?;
    let (jacs, _) = kron.backend().jacobians(kron.model(), &xt)?;
    assert_vanishing(&kron.functional_variance(&jacs)?);

    let mut diag = DiagLaplace::new(mlp(&[2, 4, 1], 4), regression_backend(), opts)?;
    diag.fit(&train)?;
    let (jacs, _) = diag.backend().jacobians(diag.model(), &xt)?;
    assert_vanishing(&diag.functional_variance(&jacs)?);
    let var = diag.posterior_variance()?;
    assert!(var.iter().all(|&v| v > 0.0 && v < 1e-9));
    Ok(())
}

/// Linear model that cannot be evaluated away from its trained weights
struct OffMapFails {
    inner: Linear,
    map: DVec,
    writes: usize,
}

impl OffMapFails {
    fn new(ww: Mat) -> Self {
        let inner = Linear::new(ww);
        Self {
            map: inner.parameters(),
            inner,
            writes: 0,
        }
    }
}

impl Model for OffMapFails {
    fn layout(&self) -> &ParamLayout {
        self.inner.layout()
    }

    fn parameters(&self) -> DVec {
        self.inner.parameters()
    }

    fn set_parameters(&mut self, theta: &DVec) -> anyhow::Result<()> {
        self.writes += 1;
        self.inner.set_parameters(theta)
    }

    fn forward(&self, xx: &Mat) -> anyhow::Result<Mat> {
        anyhow::ensure!(self.inner.parameters() == self.map, "forward pass diverged");
        self.inner.forward(xx)
    }
}

impl DifferentiableModel for OffMapFails {
    fn jacobians(&self, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)> {
        self.inner.jacobians(xx)
    }

    fn layer_terms(&self, xx: &Mat) -> anyhow::Result<Vec<LayerTerms>> {
        self.inner.layer_terms(xx)
    }
}

#[test]
fn failed_nn_evaluation_still_restores_the_map() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(20, 0.1, 14);
    let (xt, _) = toy_regression(3, 0.1, 15);
    let model = OffMapFails::new(Mat::from_row_slice(1, 2, &[0.4, -0.3]));
    let mut la = FullLaplace::new(model, regression_backend(), LaplaceOptions::regression())?;
    la.fit(&data(&xx, &yy, 5))?;
    assert_eq!(la.model().writes, 0);

    assert!(la.predict(&xt, PredType::Nn, LinkApprox::Mc, 10).is_err());
    // one sampled write, then the restore
    assert_eq!(la.model().writes, 2);
    assert_eq!(la.model().parameters(), *la.map());

    assert!(la.predictive_samples(&xt, PredType::Nn, 5).is_err());
    assert_eq!(la.model().parameters(), *la.map());

    let pred = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    assert_eq!(pred.mean().shape(), (3, 1));
    Ok(())
}

#[test]
fn functional_variance_matches_the_glm_predictive() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let (xt, _) = toy_regression(5, 0.1, 17);
    let (jacs, _) = la.backend().jacobians(la.model(), &xt)?;
    let f_var = la.functional_variance(&jacs)?;
    assert_eq!(f_var.len(), 5);
    match la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)? {
        lentil::Predictive::Regression { covariance, .. } => {
            for (a, b) in f_var.iter().zip(covariance.iter()) {
                assert_abs_diff_eq!(a.clone(), b.clone(), epsilon = 1e-12);
            }
        }
        other => panic!("expected a regression predictive, got {:?}", other),
    }

    assert_kind(la.functional_variance(&[Mat::zeros(1, 3)]), ErrorKind::Usage);
    Ok(())
}

#[test]
fn glm_predictive_samples_match_the_glm_moments() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let (xt, _) = toy_regression(4, 0.1, 18);
    let n = 20000;
    let draws = la.predictive_samples(&xt, PredType::Glm, n)?;
    assert_eq!(draws.len(), n);
    assert!(draws.iter().all(|d| d.shape() == (4, 1)));

    let pred = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    let var = pred.variance().unwrap();
    for i in 0..4 {
        let m = draws.iter().map(|d| d[(i, 0)]).sum::<f64>() / n as f64;
        let v = draws.iter().map(|d| (d[(i, 0)] - m).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert_abs_diff_eq!(m, pred.mean()[(i, 0)], epsilon = 0.05 * var[(i, 0)].sqrt());
        assert_relative_eq!(v, var[(i, 0)], max_relative = 0.05);
    }

    assert_kind(la.predictive_samples(&xt, PredType::Gp, 3), ErrorKind::Configuration);
    Ok(())
}

#[test]
fn nn_predictive_samples_come_one_per_draw() -> anyhow::Result<()> {
    let mut la = fitted_full(1.0)?;
    let before = la.model().parameters();
    let (xt, _) = toy_regression(3, 0.1, 19);
    let draws = la.predictive_samples(&xt, PredType::Nn, 7)?;
    assert_eq!(draws.len(), 7);
    assert!(draws.iter().all(|d| d.shape() == (3, 1)));
    assert_eq!(la.model().parameters(), before);
    Ok(())
}

#[test]
fn classification_predictive_samples_are_probabilities() -> anyhow::Result<()> {
    let (xx, yy) = toy_classification(30, 20);
    let (xt, _) = toy_classification(5, 21);
    let mut la = FullLaplace::new(mlp(&[2, 4, 3], 9), classification_backend(), LaplaceOptions::classification())?;
    la.fit(&data(&xx, &yy, 10))?;
    for pred_type in [PredType::Glm, PredType::Nn] {
        let draws = la.predictive_samples(&xt, pred_type, 25)?;
        assert_eq!(draws.len(), 25);
        for d in draws.iter() {
            assert_eq!(d.shape(), (5, 3));
            assert!(d.iter().all(|&p| (0.0..=1.0).contains(&p)));
            for row in d.row_iter() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
        }
    }
    Ok(())
}

/// Curvature-free backend that counts how often it is asked for data
struct ZeroBackend {
    calls: Cell<usize>,
}

impl CurvatureBackend<Linear> for ZeroBackend {
    fn likelihood(&self) -> Likelihood {
        Likelihood::Regression
    }

    fn full(&self, model: &Linear, xx: &Mat, yy: &Mat, _n: usize) -> anyhow::Result<(f64, Mat)> {
        self.calls.set(self.calls.get() + 1);
        let pp = model.layout().n_params();
        Ok((Likelihood::Regression.loss(&model.forward(xx)?, yy)?, Mat::zeros(pp, pp)))
    }

    fn kron(&self, _: &Linear, _: &Mat, _: &Mat, _: usize) -> anyhow::Result<(f64, KronFactors)> {
        anyhow::bail!("not used")
    }

    fn diag(&self, model: &Linear, xx: &Mat, yy: &Mat, _n: usize) -> anyhow::Result<(f64, DVec)> {
        self.calls.set(self.calls.get() + 1);
        let pp = model.layout().n_params();
        Ok((Likelihood::Regression.loss(&model.forward(xx)?, yy)?, DVec::zeros(pp)))
    }

    fn jacobians(&self, model: &Linear, xx: &Mat) -> anyhow::Result<(Vec<Mat>, Mat)> {
        model.jacobians(xx)
    }

    fn gp_quantities(&self, _: &Linear, _: &Mat, _: &Mat, _: f64) -> anyhow::Result<GpBatch> {
        anyhow::bail!("not used")
    }
}

#[test]
fn zero_curvature_leaves_exactly_the_prior() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(23, 0.1, 6);
    let w0 = Mat::from_row_slice(1, 2, &[0.1, 0.2]);
    let backend = ZeroBackend { calls: Cell::new(0) };
    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::PerParameter(vec![0.5, 3.0]),
        ..LaplaceOptions::regression()
    };
    let mut la = FullLaplace::new(Linear::new(w0), backend, opts)?;
    la.fit(&data(&xx, &yy, 5))?;

    assert_eq!(la.backend().calls.get(), 5);
    let p0 = DVec::from_vec(vec![0.5, 3.0]);
    assert_eq!(la.posterior_precision()?, Mat::from_diagonal(&p0));
    assert_abs_diff_eq!(la.log_det_ratio()?, 0.0, epsilon = 1e-12);
    Ok(())
}
