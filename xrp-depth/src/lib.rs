//! Stereo depth reconstruction for the passthrough renderer.
//!
//! Camera frames are rectified with the calibration reported by the active
//! camera provider, matched into fixed-point disparity maps and published
//! through a triple buffer, together with the undistortion parameters the
//! renderer needs to sample the raw camera texture.

pub mod error;
pub mod filter;
pub mod matching;
pub mod reconstruction;
pub mod rectify;

pub use error::{DepthError, Result};
pub use matching::{
    BlockMatcher, DISPARITY_FRACTIONAL_BITS, DisparityMap, SemiGlobalMatcher, StereoMatcher,
};
pub use reconstruction::DepthReconstruction;
pub use rectify::{CameraModel, Distortion, RectifyMap, StereoRectification};
