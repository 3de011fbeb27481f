mod common;

use common::*;
use lentil::link::LinkApprox;
use lentil::options::{LaplaceOptions, PredType};
use lentil::parametric::ParametricLaplace;
use lentil::persist::FittedState;
use lentil::posterior::{Dense, Diagonal, Kron, PosteriorStructure};
use lentil::prior::PriorPrecision;

fn round_trip<S: PosteriorStructure>(file_name: &str, damping: bool) -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(30, 0.1, 1);
    let (xt, _) = toy_regression(5, 0.1, 2);
    let opts = LaplaceOptions {
        sigma_noise: 0.3,
        prior_precision: PriorPrecision::PerLayer(vec![0.5, 1.0, 1.5, 2.0]),
        damping,
        ..LaplaceOptions::regression()
    };
    let mut la = ParametricLaplace::<S, _, _>::new(mlp(&[2, 4, 1], 1), regression_backend(), opts)?;
    la.fit(&data(&xx, &yy, 8))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join(file_name);
    let path = path.to_str().ok_or_else(|| anyhow::anyhow!("non-utf8 path"))?;
    la.fitted_state()?.to_json_file(path)?;

    let state = FittedState::<S>::from_json_file(path)?;
    assert_eq!(&*state.structure, S::name());
    // parameters come from the saved state, not from the model passed in
    let mut restored =
        ParametricLaplace::<S, _, _>::from_fitted_state(mlp(&[2, 4, 1], 99), regression_backend(), state)?;

    assert_eq!(restored.map(), la.map());
    assert_eq!(
        restored.log_marginal_likelihood(None, None)?,
        la.log_marginal_likelihood(None, None)?
    );
    let a = la.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    let b = restored.predict(&xt, PredType::Glm, LinkApprox::Probit, 1)?;
    assert_eq!(a.mean(), b.mean());
    assert_eq!(a.variance(), b.variance());
    Ok(())
}

#[test]
fn dense_state_round_trips() -> anyhow::Result<()> {
    round_trip::<Dense>("full.json", false)
}

#[test]
fn kron_state_round_trips() -> anyhow::Result<()> {
    round_trip::<Kron>("kron.json.gz", true)
}

#[test]
fn diagonal_state_round_trips() -> anyhow::Result<()> {
    round_trip::<Diagonal>("diag.json", false)
}

#[test]
fn state_of_another_structure_is_rejected() -> anyhow::Result<()> {
    let (xx, yy) = toy_regression(10, 0.1, 3);
    let mut la = ParametricLaplace::<Diagonal, _, _>::new(
        mlp(&[2, 3, 1], 1),
        regression_backend(),
        LaplaceOptions::regression(),
    )?;
    la.fit(&data(&xx, &yy, 5))?;
    let mut state = la.fitted_state()?;
    state.structure = "full".into();
    assert_kind(
        ParametricLaplace::<Diagonal, _, _>::from_fitted_state(mlp(&[2, 3, 1], 1), regression_backend(), state),
        lentil::error::ErrorKind::Configuration,
    );
    Ok(())
}
