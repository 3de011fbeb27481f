use crate::saved::*;
use clap::Args;
use lentil::backend::{FisherType, JacobianBackend};
use lentil::link::LinkApprox;
use lentil::mlp::Mlp;
use lentil::options::PredType;
use lentil::parametric::ParametricLaplace;
use lentil::persist::FittedState;
use lentil::posterior::PosteriorStructure;
use lentil::predictive::Predictive;
use log::info;
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;

type Mat = DMatrix<f64>;

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Saved approximation from `lentil fit`
    #[arg(long, short = 'm', required = true)]
    model: Box<str>,

    /// Test inputs, `n x d`
    #[arg(long, short = 'x', required = true)]
    x_file: Box<str>,

    /// glm or nn
    #[arg(long, default_value = "glm")]
    pred_type: PredType,

    /// mc, probit or bridge (classification only)
    #[arg(long, default_value = "probit")]
    link_approx: LinkApprox,

    /// Monte-Carlo samples for mc and nn
    #[arg(long, default_value_t = 100)]
    n_samples: usize,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,
}

pub fn run_predict(args: &PredictArgs) -> anyhow::Result<()> {
    let saved = SavedModel::from_json_file(&args.model)?;
    let xx = Mat::from_tsv(&args.x_file, None)?;
    let mlp = Mlp::random(&saved.sizes, 0)?;

    let pred = match saved.laplace {
        SavedPosterior::Full(state) => predict_with(mlp, saved.fisher, state, &xx, args)?,
        SavedPosterior::Kron(state) => predict_with(mlp, saved.fisher, state, &xx, args)?,
        SavedPosterior::Diag(state) => predict_with(mlp, saved.fisher, state, &xx, args)?,
    };

    write_predictive(&pred, &args.out)?;
    info!("Predicted {} test points", xx.nrows());
    Ok(())
}

fn predict_with<S: PosteriorStructure>(
    mlp: Mlp,
    fisher: FisherType,
    state: FittedState<S>,
    xx: &Mat,
    args: &PredictArgs,
) -> anyhow::Result<Predictive> {
    let backend = JacobianBackend::new(state.options.likelihood).with_fisher(fisher);
    let mut la = ParametricLaplace::<S, _, _>::from_fitted_state(mlp, backend, state)?;
    la.predict(xx, args.pred_type, args.link_approx, args.n_samples)
}
