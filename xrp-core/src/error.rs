use thiserror::Error;

/// Common errors across the passthrough core types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Math error: {0}")]
    Math(#[from] MathError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum MathError {
    #[error("Matrix is singular")]
    SingularMatrix,

    #[error("Degenerate point configuration")]
    DegeneratePoints,

    #[error("Decomposition failed: {0}")]
    DecompositionFailed(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_error_display() {
        let err = MathError::SingularMatrix;
        assert_eq!(err.to_string(), "Matrix is singular");

        let err = MathError::DegeneratePoints;
        assert_eq!(err.to_string(), "Degenerate point configuration");

        let err = MathError::DecompositionFailed("no SVD".to_string());
        assert_eq!(err.to_string(), "Decomposition failed: no SVD");
    }

    #[test]
    fn test_core_error_from_math_error() {
        let math_err = MathError::SingularMatrix;
        let core_err: CoreError = math_err.into();
        assert!(matches!(core_err, CoreError::Math(_)));
    }

    #[test]
    fn test_core_error_invalid_config() {
        let err = CoreError::InvalidConfig("downscale factor must be nonzero".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: downscale factor must be nonzero"
        );
    }
}
