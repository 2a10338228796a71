pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod math;
pub mod metrics;

pub use camera::{CalibrationRecord, Eye, Intrinsics, StereoFrameLayout};
pub use config::{CameraConfig, Config, ConfigStore, ProjectionMode};
pub use error::{CoreError, MathError, Result};
pub use frame::{
    CameraFrame, DepthFrame, FramePayload, TripleBuffer, UvDistortionParameters,
};
