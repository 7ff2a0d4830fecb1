//! Typed errors for the fan control core.

use std::io;
use std::path::PathBuf;

use crate::fans::Capability;

/// Result alias for fan control operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors produced by fan handles, characterization and the control loop.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("value in {} is not an integer: {text:?}", .path.display())]
    Parse { path: PathBuf, text: String },

    #[error("control mode stuck at {actual} after writing {requested}")]
    ModeStuck { requested: i32, actual: i32 },

    #[error("cannot attach empty rpm curve data")]
    EmptyCurveData,

    #[error("curve evaluation failed: {0}")]
    CurveEvaluation(anyhow::Error),

    #[error("fan reports no rotation even at maximum pwm {max_pwm}")]
    NeverStopViolated { max_pwm: i32 },

    #[error("fan does not support {0:?}")]
    Unsupported(Capability),

    #[error("operation cancelled")]
    Cancelled,
}

impl ControlError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
