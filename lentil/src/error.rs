use thiserror::Error;

/// Failures of the Laplace core. They travel as `anyhow::Error`;
/// recover the variant with `err.downcast_ref::<LaplaceError>()`.
#[derive(Debug, Error)]
pub enum LaplaceError {
    /// invalid names, shapes or combinations fixed at construction
    #[error("configuration error: {0}")]
    Configuration(String),

    /// a valid object used out of order or with mismatched inputs
    #[error("usage error: {0}")]
    Usage(String),

    /// a matrix that had to be positive definite was not
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// a well-formed request the core does not implement
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// the curvature backend cannot handle this likelihood
    #[error("likelihood not supported by the curvature backend: {0}")]
    LikelihoodUnsupported(String),

    /// a stochastic approximation requested for a curvature structure
    /// that has none
    #[error("stochastic approximation unavailable for {0} curvature")]
    StochasticUnavailable(String),
}

/// The four categories callers dispatch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Usage,
    Numerical,
    Unsupported,
}

impl LaplaceError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::LikelihoodUnsupported(_) => ErrorKind::Configuration,
            Self::StochasticUnavailable(_) => ErrorKind::Configuration,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Numerical(_) => ErrorKind::Numerical,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }
}

/// Category of an `anyhow::Error`, if it came from this crate
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<LaplaceError>().map(LaplaceError::kind)
}

/// Re-label a linear-algebra failure as a numerical one
pub(crate) fn numerical(context: &str) -> impl FnOnce(anyhow::Error) -> anyhow::Error + '_ {
    move |e| LaplaceError::numerical(format!("{}: {}", context, e)).into()
}
