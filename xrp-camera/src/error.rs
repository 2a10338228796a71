use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors surfaced by the camera providers
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Math error: {0}")]
    Math(#[from] xrp_core::MathError),

    #[error("Core error: {0}")]
    Core(#[from] xrp_core::CoreError),

    #[error("Video capture error: {0}")]
    Video(String),

    #[error("No passthrough camera found")]
    NoCamera,

    #[error("Invalid frame size: {width}x{height} ({buffer_size} bytes)")]
    InvalidFrameSize {
        width: u32,
        height: u32,
        buffer_size: u32,
    },

    #[error("Camera not initialized")]
    NotInitialized,

    #[error("Acquisition thread error: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_error_display() {
        let err = CameraError::NoCamera;
        assert_eq!(err.to_string(), "No passthrough camera found");

        let err = CameraError::InvalidFrameSize {
            width: 0,
            height: 480,
            buffer_size: 0,
        };
        assert_eq!(err.to_string(), "Invalid frame size: 0x480 (0 bytes)");

        let err = CameraError::Video("device busy".to_string());
        assert_eq!(err.to_string(), "Video capture error: device busy");
    }

    #[test]
    fn test_camera_error_from_runtime_error() {
        let err: CameraError = RuntimeError::NoFrameAvailable.into();
        assert!(matches!(err, CameraError::Runtime(_)));
    }
}
