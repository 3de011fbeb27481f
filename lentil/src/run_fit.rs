use crate::saved::*;
use clap::Args;
use lentil::backend::{FisherType, JacobianBackend};
use lentil::data::{DataSource, InMemoryData};
use lentil::likelihood::Likelihood;
use lentil::mlp::Mlp;
use lentil::optim::{optimize_prior_precision, PriorOptMethod, PriorOptimOptions};
use lentil::options::{LaplaceOptions, StructureKind};
use lentil::parametric::ParametricLaplace;
use lentil::persist::FittedState;
use lentil::posterior::{Dense, Diagonal, Kron, PosteriorStructure};
use lentil::prior::PriorPrecision;
use log::info;
use matrix_util::traits::{IoOps, RowMajorOps};
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f64>;

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Training inputs, `n x d`
    #[arg(long, short = 'x', required = true)]
    x_file: Box<str>,

    /// Training targets: `n x C` for regression, one class index per
    /// line for classification
    #[arg(long, short = 'y', required = true)]
    y_file: Box<str>,

    /// MLP layer sizes from input to output (comma-separated)
    #[arg(long, short = 'l', value_delimiter(','), required = true)]
    sizes: Vec<usize>,

    /// Trained MLP parameters, flattened layer by layer (weights row
    /// by row, then biases)
    #[arg(long, short = 'p', required = true)]
    params_file: Box<str>,

    /// regression or classification
    #[arg(long, default_value = "regression")]
    likelihood: Likelihood,

    /// full, kron or diag
    #[arg(long, short = 's', default_value = "full")]
    structure: StructureKind,

    /// ggn or ef (empirical Fisher)
    #[arg(long, default_value = "ggn")]
    fisher: FisherType,

    /// observation noise (regression only)
    #[arg(long, default_value_t = 1.0)]
    sigma_noise: f64,

    /// scalar prior precision
    #[arg(long, default_value_t = 1.0)]
    prior_precision: f64,

    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// damp Kronecker factors with the prior before combining them
    #[arg(long, default_value_t = false)]
    damping: bool,

    #[arg(long, short = 'b', default_value_t = 100)]
    batch_size: usize,

    /// tune the prior precision: marglik or CV
    #[arg(long)]
    optimize_prior: Option<PriorOptMethod>,

    /// held-out inputs for CV
    #[arg(long)]
    val_x_file: Option<Box<str>>,

    /// held-out targets for CV
    #[arg(long)]
    val_y_file: Option<Box<str>>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output file (`.json` or `.json.gz`)
    #[arg(long, short, required = true)]
    out: Box<str>,
}

pub fn run_fit(args: &FitArgs) -> anyhow::Result<()> {
    let xx = Mat::from_tsv(&args.x_file, None)?;
    let yy = Mat::from_tsv(&args.y_file, None)?;
    info!("Read {} x {} inputs", xx.nrows(), xx.ncols());

    let mlp = read_mlp(&args.sizes, &args.params_file)?;
    let data = InMemoryData::new(xx, yy, args.batch_size)?;
    let val_data = match (&args.val_x_file, &args.val_y_file) {
        (Some(x), Some(y)) => Some(InMemoryData::new(
            Mat::from_tsv(x, None)?,
            Mat::from_tsv(y, None)?,
            args.batch_size,
        )?),
        _ => None,
    };

    let backend = JacobianBackend::new(args.likelihood).with_fisher(args.fisher);
    let options = LaplaceOptions {
        likelihood: args.likelihood,
        sigma_noise: args.sigma_noise,
        prior_precision: PriorPrecision::Scalar(args.prior_precision),
        temperature: args.temperature,
        damping: args.damping,
        seed: args.seed,
        ..LaplaceOptions::default()
    };

    let fit = FitInput {
        data: &data,
        val_data: val_data.as_ref().map(|v| v as &dyn DataSource),
        optimize_prior: args.optimize_prior,
    };

    let laplace = match args.structure {
        StructureKind::Full => {
            SavedPosterior::Full(fit_structure::<Dense>(mlp, backend, options, &fit)?)
        }
        StructureKind::Kron => {
            SavedPosterior::Kron(fit_structure::<Kron>(mlp, backend, options, &fit)?)
        }
        StructureKind::Diag => {
            SavedPosterior::Diag(fit_structure::<Diagonal>(mlp, backend, options, &fit)?)
        }
    };

    SavedModel {
        sizes: args.sizes.clone(),
        fisher: args.fisher,
        laplace,
    }
    .to_json_file(&args.out)?;
    info!("Wrote {}", args.out);
    Ok(())
}

/// Parameters are read as one long row-major vector, whatever the
/// line layout of the file
pub fn read_mlp(sizes: &[usize], params_file: &str) -> anyhow::Result<Mlp> {
    let theta = Mat::from_tsv(params_file, None)?;
    Mlp::from_parameters(sizes, &DVector::from_vec(theta.to_row_major()))
}

struct FitInput<'a> {
    data: &'a dyn DataSource,
    val_data: Option<&'a dyn DataSource>,
    optimize_prior: Option<PriorOptMethod>,
}

fn fit_structure<S: PosteriorStructure>(
    mlp: Mlp,
    backend: JacobianBackend,
    options: LaplaceOptions,
    fit: &FitInput,
) -> anyhow::Result<FittedState<S>> {
    let mut la = ParametricLaplace::<S, _, _>::new(mlp, backend, options)?;
    la.fit(fit.data)?;

    if let Some(method) = fit.optimize_prior {
        let opts = PriorOptimOptions {
            method,
            ..PriorOptimOptions::default()
        };
        optimize_prior_precision(&mut la, &opts, fit.val_data)?;
    }

    info!(
        "log marginal likelihood: {:.4}",
        la.log_marginal_likelihood(None, None)?
    );
    la.fitted_state()
}
