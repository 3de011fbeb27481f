//! Laplace approximations of trained models.
//!
//! A [`parametric::ParametricLaplace`] places a Gaussian over the
//! parameters of a trained model, with the curvature kept dense,
//! Kronecker-factored or diagonal ([`posterior`]). Its function-space
//! dual [`functional::FunctionalLaplace`] is a sparse Gaussian process
//! over the model outputs. Derivatives come from a
//! [`backend::CurvatureBackend`]; [`optim`] tunes the prior precision.

pub mod backend;
pub mod data;
pub mod error;
pub mod functional;
pub mod likelihood;
pub mod link;
pub mod mlp;
pub mod model;
pub mod optim;
pub mod options;
pub mod parametric;
pub mod persist;
pub mod posterior;
pub mod predictive;
pub mod prior;

pub use backend::{CurvatureBackend, FisherType, JacobianBackend};
pub use data::{DataSource, InMemoryData};
pub use error::{error_kind, ErrorKind, LaplaceError};
pub use functional::FunctionalLaplace;
pub use likelihood::Likelihood;
pub use link::LinkApprox;
pub use mlp::Mlp;
pub use model::{DifferentiableModel, Model, ParamGroup, ParamLayout, ParamShape};
pub use optim::{optimize_prior_precision, LaplaceApproximation, PriorOptMethod, PriorOptimOptions};
pub use options::{GpOptions, LaplaceOptions, PredType, StructureKind};
pub use parametric::{DiagLaplace, FitState, FullLaplace, KronLaplace, ParametricLaplace};
pub use persist::FittedState;
pub use predictive::Predictive;
pub use prior::{PriorMean, PriorPrecision, PriorSpec};
