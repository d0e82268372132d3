use thiserror::Error;

/// Fatal calibration failures. Recoverable conditions (an image pair with no
/// matches, a residual pass above the error ceiling) are logged, not raised.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Invalid configuration values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed or inconsistent rig document.
    #[error("invalid rig: {0}")]
    Rig(String),

    /// A camera produced fewer corners than the detector's hard minimum.
    #[error("camera {camera}: found {found} features, need at least {needed}")]
    InsufficientFeatures {
        camera: String,
        found: usize,
        needed: usize,
    },

    /// Cameras with too few traces or anomalously low trace counts.
    /// The message names every offending camera.
    #[error("insufficient traces: {0}")]
    InsufficientTraces(String),

    /// The optimizer did not converge.
    #[error("solver failed to converge: {0}")]
    NonConvergence(String),

    /// An internal consistency check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
