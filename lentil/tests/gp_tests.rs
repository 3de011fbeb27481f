mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::*;
use lentil::functional::FunctionalLaplace;
use lentil::link::LinkApprox;
use lentil::model::Model;
use lentil::options::{GpOptions, LaplaceOptions, PredType};
use lentil::parametric::FullLaplace;
use lentil::prior::PriorPrecision;

fn regression_opts() -> LaplaceOptions {
    LaplaceOptions {
        sigma_noise: 0.3,
        prior_precision: PriorPrecision::Scalar(1.5),
        ..LaplaceOptions::regression()
    }
}

fn compare_with_dense(xx: &Mat, yy: &Mat, sizes: &[usize], xt: &Mat) -> anyhow::Result<()> {
    let mut dense = FullLaplace::new(mlp(sizes, 5), regression_backend(), regression_opts())?;
    dense.fit(&data(xx, yy, 16))?;
    let weight = dense.predict(xt, PredType::Glm, LinkApprox::Probit, 1)?;

    let mut gp = FunctionalLaplace::new(
        mlp(sizes, 5),
        regression_backend(),
        regression_opts(),
        GpOptions::default(),
    )?;
    gp.fit(Box::new(data(xx, yy, 16)))?;
    let function = gp.predict(xt, PredType::Gp, LinkApprox::Probit, 1)?;

    assert_eq!(weight.mean(), function.mean());
    let (lhs, rhs) = match (&weight, &function) {
        (
            lentil::Predictive::Regression { covariance: a, .. },
            lentil::Predictive::Regression { covariance: b, .. },
        ) => (a.clone(), b.clone()),
        _ => anyhow::bail!("expected regression predictives"),
    };
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        assert_abs_diff_eq!(a.clone(), b.clone(), epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn gp_dual_matches_dense_glm_for_one_output() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(40, 0.1, 31);
    let (xt, _) = toy_regression(7, 0.1, 32);
    compare_with_dense(&xx, &yy, &[2, 6, 1], &xt)
}

#[test]
fn gp_dual_matches_dense_glm_for_two_outputs() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression2(30, 33);
    let (xt, _) = toy_regression2(5, 34);
    compare_with_dense(&xx, &yy, &[2, 5, 2], &xt)
}

#[test]
fn classification_argmax_agrees_with_the_weight_space() -> anyhow::Result<()> {
    let (xx, yy) = toy_classification(40, 41);
    let (xt, _) = toy_classification(20, 42);
    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::Scalar(1e4),
        ..LaplaceOptions::classification()
    };
    let model = mlp(&[2, 6, 3], 7);
    let logits = model.forward(&xt)?;

    let mut dense = FullLaplace::new(model.clone(), classification_backend(), opts.clone())?;
    dense.fit(&data(&xx, &yy, 10))?;
    let weight = dense.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?.argmax();

    let mut gp = FunctionalLaplace::new(model, classification_backend(), opts, GpOptions::default())?;
    gp.fit(Box::new(data(&xx, &yy, 10)))?;
    let function = gp.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?.argmax();

    for (i, row) in logits.row_iter().enumerate() {
        let mut sorted = row.iter().copied().collect::<Vec<_>>();
        sorted.sort_by(|a, b| b.total_cmp(a));
        if sorted[0] - sorted[1] > 1e-2 {
            assert_eq!(weight[i], function[i]);
        }
    }
    Ok(())
}

#[test]
fn inducing_subset_is_seeded_and_sorted() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(50, 0.1, 51);
    let gp_opts = GpOptions {
        n_inducing: Some(12),
        subset_seed: 3,
        ..GpOptions::default()
    };
    let mut a = FunctionalLaplace::new(mlp(&[2, 4, 1], 1), regression_backend(), regression_opts(), gp_opts.clone())?;
    a.fit(Box::new(data(&xx, &yy, 5)))?;
    let mut b = FunctionalLaplace::new(mlp(&[2, 4, 1], 1), regression_backend(), regression_opts(), gp_opts)?;
    b.fit(Box::new(data(&xx, &yy, 7)))?;

    let ia = a.inducing_indices()?.to_vec();
    assert_eq!(ia.len(), 12);
    assert!(ia.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ia, b.inducing_indices()?.to_vec());

    // batching of the inducing set does not change the kernel
    let (xt, _) = toy_regression(4, 0.1, 52);
    let pa = a.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?;
    let pb = b.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?;
    assert_abs_diff_eq!(pa.variance().unwrap(), pb.variance().unwrap(), epsilon = 1e-9);
    assert_abs_diff_eq!(
        a.log_marginal_likelihood(None, None)?,
        b.log_marginal_likelihood(None, None)?,
        epsilon = 1e-8
    );
    Ok(())
}

#[test]
fn diagonal_kernel_gives_per_output_variances() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression2(30, 61);
    let (xt, _) = toy_regression2(4, 62);
    let gp_opts = GpOptions {
        diagonal_kernel: true,
        ..GpOptions::default()
    };
    let mut gp = FunctionalLaplace::new(mlp(&[2, 5, 2], 2), regression_backend(), regression_opts(), gp_opts)?;
    gp.fit(Box::new(data(&xx, &yy, 8)))?;
    let pred = gp.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?;
    let lentil::Predictive::Regression { covariance, .. } = pred else {
        anyhow::bail!("expected a regression predictive");
    };
    for cov in covariance {
        assert_eq!(cov[(0, 1)], 0.0);
        assert!(cov[(0, 0)] > 0.0 && cov[(1, 1)] > 0.0);
    }
    assert!(gp.log_marginal_likelihood(None, None)?.is_finite());
    Ok(())
}

#[test]
fn prior_change_is_reflected_in_predictions() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(30, 0.1, 71);
    let (xt, _) = toy_regression(3, 0.1, 72);
    let mut gp = FunctionalLaplace::new(mlp(&[2, 4, 1], 3), regression_backend(), regression_opts(), GpOptions::default())?;
    gp.fit(Box::new(data(&xx, &yy, 10)))?;
    gp.set_prior_precision(PriorPrecision::Scalar(50.0))?;
    let after = gp.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?;

    let opts = LaplaceOptions {
        prior_precision: PriorPrecision::Scalar(50.0),
        ..regression_opts()
    };
    let mut fresh = FunctionalLaplace::new(mlp(&[2, 4, 1], 3), regression_backend(), opts, GpOptions::default())?;
    fresh.fit(Box::new(data(&xx, &yy, 10)))?;
    let expected = fresh.predict(&xt, PredType::Gp, LinkApprox::Probit, 1)?;
    assert_abs_diff_eq!(after.variance().unwrap(), expected.variance().unwrap(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn gp_predictive_samples_match_the_gp_posterior() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(30, 0.1, 41);
    let (xt, _) = toy_regression(3, 0.1, 42);
    let mut gp = FunctionalLaplace::new(
        mlp(&[2, 5, 1], 6),
        regression_backend(),
        regression_opts(),
        GpOptions::default(),
    )?;
    gp.fit(Box::new(data(&xx, &yy, 10)))?;
    let (f_mu, f_var) = gp.gp_posterior(&xt)?;

    let n = 20000;
    let draws = gp.predictive_samples(&xt, n)?;
    assert_eq!(draws.len(), n);
    assert!(draws.iter().all(|d| d.shape() == (3, 1)));
    for i in 0..3 {
        let var = f_var[i][(0, 0)];
        let m = draws.iter().map(|d| d[(i, 0)]).sum::<f64>() / n as f64;
        let v = draws.iter().map(|d| (d[(i, 0)] - m).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert_abs_diff_eq!(m, f_mu[(i, 0)], epsilon = 0.05 * var.sqrt());
        assert_relative_eq!(v, var, max_relative = 0.05);
    }
    Ok(())
}

#[test]
fn gp_classification_samples_are_probabilities() -> anyhow::Result<()> {
    let (xx, yy) = toy_classification(24, 43);
    let (xt, _) = toy_classification(4, 44);
    let mut gp = FunctionalLaplace::new(
        mlp(&[2, 4, 3], 7),
        classification_backend(),
        LaplaceOptions::classification(),
        GpOptions::default(),
    )?;
    gp.fit(Box::new(data(&xx, &yy, 8)))?;
    let draws = gp.predictive_samples(&xt, 10)?;
    assert_eq!(draws.len(), 10);
    for d in draws.iter() {
        assert_eq!(d.shape(), (4, 3));
        for row in d.row_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }
    Ok(())
}
