//! Crate-wide error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::tuner::TunerError;

/// Errors surfaced during startup and pipeline supervision.
///
/// Initialization errors abort the process with a diagnostic; runtime
/// errors inside the stages surface through pipeline shutdown instead.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unable to find valid configuration file")]
    ConfigNotFound,

    #[error("invalid configuration in '{path}': {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("invalid parameters for frequency")]
    InvalidFrequency,

    #[error("squelch level required when scanning a frequency range")]
    SquelchRequired,

    #[error(transparent)]
    Tuner(#[from] TunerError),

    #[error("{stage} stage failed to initialize: {reason}")]
    StageInit { stage: &'static str, reason: String },
}
