mod run_fit;
mod run_gp;
mod run_predict;
mod saved;

use run_fit::*;
use run_gp::*;
use run_predict::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Laplace approximations for trained multilayer perceptrons\n\
		  Inputs, targets and parameters are delimited text files \n\
		  (`.tsv` or `.tsv.gz`), one example per line."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a weight-space Laplace approximation",
        long_about = "Fit a Laplace approximation around trained MLP parameters:\n\
		      (1) Accumulate full, Kronecker-factored or diagonal curvature\n\
		      (2) Optionally tune the prior precision\n\
		      (3) Save the fitted state as JSON.\n"
    )]
    Fit(FitArgs),

    #[command(
        about = "Predict with a saved weight-space approximation",
        long_about = "Restore a fitted approximation and write predictive\n\
		      means and variances (regression) or class probabilities.\n"
    )]
    Predict(PredictArgs),

    #[command(
        about = "Fit the sparse GP dual and predict in one pass",
        long_about = "Build the neural tangent kernel on a subset of the\n\
		      training data and write the GP predictive on test inputs.\n"
    )]
    Gp(GpArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            run_fit(args)?;
        }
        Commands::Predict(args) => {
            run_predict(args)?;
        }
        Commands::Gp(args) => {
            run_gp(args)?;
        }
    }

    info!("Done");
    Ok(())
}
