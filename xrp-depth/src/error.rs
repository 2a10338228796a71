use thiserror::Error;

/// Errors surfaced by the depth reconstruction pipeline
#[derive(Error, Debug)]
pub enum DepthError {
    #[error("Math error: {0}")]
    Math(#[from] xrp_core::MathError),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Undistortion did not converge")]
    NonConvergent,

    #[error("Reconstruction thread error: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, DepthError>;
