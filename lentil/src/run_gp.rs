use crate::run_fit::read_mlp;
use crate::saved::write_predictive;
use clap::Args;
use lentil::backend::JacobianBackend;
use lentil::data::InMemoryData;
use lentil::functional::FunctionalLaplace;
use lentil::likelihood::Likelihood;
use lentil::link::LinkApprox;
use lentil::optim::{optimize_prior_precision, PriorOptimOptions};
use lentil::options::{GpOptions, LaplaceOptions, PredType};
use lentil::prior::PriorPrecision;
use log::info;
use matrix_util::traits::IoOps;
use nalgebra::DMatrix;

type Mat = DMatrix<f64>;

#[derive(Args, Debug)]
pub struct GpArgs {
    /// Training inputs, `n x d`
    #[arg(long, short = 'x', required = true)]
    x_file: Box<str>,

    /// Training targets
    #[arg(long, short = 'y', required = true)]
    y_file: Box<str>,

    /// Test inputs
    #[arg(long, short = 't', required = true)]
    test_file: Box<str>,

    /// MLP layer sizes from input to output (comma-separated)
    #[arg(long, short = 'l', value_delimiter(','), required = true)]
    sizes: Vec<usize>,

    /// Trained MLP parameters
    #[arg(long, short = 'p', required = true)]
    params_file: Box<str>,

    #[arg(long, default_value = "regression")]
    likelihood: Likelihood,

    #[arg(long, default_value_t = 1.0)]
    sigma_noise: f64,

    #[arg(long, default_value_t = 1.0)]
    prior_precision: f64,

    /// number of inducing points (default: every training point)
    #[arg(long, short = 'm')]
    n_inducing: Option<usize>,

    /// independent GP per output
    #[arg(long, default_value_t = false)]
    diagonal_kernel: bool,

    #[arg(long, short = 'b', default_value_t = 100)]
    batch_size: usize,

    /// tune a scalar prior precision on the GP marginal likelihood
    /// (regression only)
    #[arg(long, default_value_t = false)]
    optimize_prior: bool,

    #[arg(long, default_value = "probit")]
    link_approx: LinkApprox,

    #[arg(long, default_value_t = 100)]
    n_samples: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,
}

pub fn run_gp(args: &GpArgs) -> anyhow::Result<()> {
    let xx = Mat::from_tsv(&args.x_file, None)?;
    let yy = Mat::from_tsv(&args.y_file, None)?;
    let x_test = Mat::from_tsv(&args.test_file, None)?;

    let mlp = read_mlp(&args.sizes, &args.params_file)?;
    let data = InMemoryData::new(xx, yy, args.batch_size)?;
    let options = LaplaceOptions {
        likelihood: args.likelihood,
        sigma_noise: args.sigma_noise,
        prior_precision: PriorPrecision::Scalar(args.prior_precision),
        seed: args.seed,
        ..LaplaceOptions::default()
    };
    let gp = GpOptions {
        n_inducing: args.n_inducing,
        diagonal_kernel: args.diagonal_kernel,
        subset_seed: args.seed,
        ..GpOptions::default()
    };

    let mut la = FunctionalLaplace::new(mlp, JacobianBackend::new(args.likelihood), options, gp)?;
    la.fit(Box::new(data))?;

    if args.optimize_prior {
        optimize_prior_precision(&mut la, &PriorOptimOptions::default(), None)?;
        info!(
            "log marginal likelihood: {:.4}",
            la.log_marginal_likelihood(None, None)?
        );
    }

    let pred = la.predict(&x_test, PredType::Gp, args.link_approx, args.n_samples)?;
    write_predictive(&pred, &args.out)?;
    info!("Predicted {} test points", x_test.nrows());
    Ok(())
}
