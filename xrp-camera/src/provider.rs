//! The camera provider capability shared by both backends.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use nalgebra::Matrix4;

use xrp_core::{CameraFrame, Eye, Intrinsics, StereoFrameLayout};

use crate::error::Result;
use crate::runtime::FrameSize;

/// Sleep between served frames while idle or paused.
pub const POSTFRAME_SLEEP_INTERVAL: Duration = Duration::from_millis(10);
/// Sleep between polls while a frame is known imminent.
pub const FRAME_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Near plane of every passthrough projection, meters.
pub const NEAR_PROJECTION_DISTANCE: f32 = 0.1;

/// How many times a recurring acquisition failure is logged before the
/// polling loop goes quiet about it.
pub const MAX_LOGGED_FAILURES: u32 = 5;

#[derive(Debug, Clone, Default)]
pub struct CameraDisplayStats {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub api: String,
}

/// Calibration-derived state refreshed by `update_static_camera_parameters`.
/// Readers take the lock briefly and never observe a half-updated set.
#[derive(Debug, Clone)]
pub struct CameraCalibrationState {
    pub layout: StereoFrameLayout,
    /// Full delivered texture, possibly spanning both eyes.
    pub distorted: FrameSize,
    pub undistorted: FrameSize,
    /// Logical per-eye frame dimensions.
    pub frame_width: u32,
    pub frame_height: u32,
    pub undistorted_frame_width: u32,
    pub undistorted_frame_height: u32,
    pub camera_to_head: [Matrix4<f32>; 2],
    pub head_to_camera: [Matrix4<f32>; 2],
    /// Service-reported inverses kept for stripping device calibration
    /// when a custom calibration is active.
    pub head_to_camera_reported: [Matrix4<f32>; 2],
    pub left_to_right: Matrix4<f32>,
    pub right_to_left: Matrix4<f32>,
}

impl Default for CameraCalibrationState {
    fn default() -> Self {
        Self {
            layout: StereoFrameLayout::Mono,
            distorted: FrameSize::default(),
            undistorted: FrameSize::default(),
            frame_width: 0,
            frame_height: 0,
            undistorted_frame_width: 0,
            undistorted_frame_height: 0,
            camera_to_head: [Matrix4::identity(); 2],
            head_to_camera: [Matrix4::identity(); 2],
            head_to_camera_reported: [Matrix4::identity(); 2],
            left_to_right: Matrix4::identity(),
            right_to_left: Matrix4::identity(),
        }
    }
}

impl CameraCalibrationState {
    /// Derive per-eye frame dimensions from the texture sizes and layout.
    pub fn update_frame_dimensions(&mut self) {
        let (w, h) = self
            .layout
            .eye_frame_size(self.distorted.width, self.distorted.height);
        self.frame_width = w;
        self.frame_height = h;

        let (w, h) = self
            .layout
            .eye_frame_size(self.undistorted.width, self.undistorted.height);
        self.undistorted_frame_width = w;
        self.undistorted_frame_height = h;
    }
}

/// One passthrough camera source: the head-mounted tracked camera or an
/// external video device. Owns its acquisition thread and frame exchange.
pub trait CameraProvider: Send + Sync {
    /// Acquire the camera, read static calibration, start the acquisition
    /// thread. Idempotent; returns Ok immediately when already initialized.
    fn init_camera(&self) -> Result<()>;

    /// Stop and join the acquisition thread, then release the camera.
    /// Idempotent.
    fn deinit_camera(&self);

    /// Paused acquisition stops issuing capture calls but keeps the thread.
    fn set_paused(&self, paused: bool);

    fn is_initialized(&self) -> bool;

    /// Most recent published frame. Non-blocking; while the acquisition
    /// thread is mid-publish this returns the previously served frame.
    fn get_camera_frame(&self) -> Option<Arc<RwLock<CameraFrame>>>;

    /// Recompute calibration-derived state. Safe while the acquisition
    /// thread runs.
    fn update_static_camera_parameters(&self) -> Result<()>;

    fn frame_layout(&self) -> StereoFrameLayout;

    fn distorted_frame_size(&self) -> FrameSize;

    fn undistorted_frame_size(&self) -> FrameSize;

    /// Logical per-eye frame dimensions used by the projection math.
    fn eye_frame_size(&self) -> (u32, u32);

    fn intrinsics(&self, eye: Eye) -> Intrinsics;

    /// Fisheye coefficient layout: k1..k4 of the left camera in slots 0..4,
    /// right camera in slots 8..12.
    fn distortion_coefficients(&self) -> [f64; 16];

    fn left_to_right_transform(&self) -> Matrix4<f32>;

    /// Camera projection over the given depth range, for the planar
    /// projection path.
    fn camera_projection(&self, eye: Eye, near_z: f32, far_z: f32) -> Result<Matrix4<f32>>;

    fn uses_fisheye_model(&self) -> bool;

    /// Whether the projection origin tracks the camera pose instead of the
    /// HMD view pose.
    fn projection_origin_from_camera(&self) -> bool {
        false
    }

    fn average_acquisition_time_ms(&self) -> f32;

    fn display_stats(&self) -> CameraDisplayStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_dimensions_horizontal_stereo() {
        let mut state = CameraCalibrationState {
            layout: StereoFrameLayout::StereoHorizontal,
            distorted: FrameSize {
                width: 1280,
                height: 480,
                buffer_size: 1280 * 480 * 4,
            },
            undistorted: FrameSize {
                width: 1280,
                height: 480,
                buffer_size: 1280 * 480 * 4,
            },
            ..Default::default()
        };
        state.update_frame_dimensions();

        // The texture keeps its full size; only the logical frame halves.
        assert_eq!(state.distorted.width, 1280);
        assert_eq!(state.frame_width, 640);
        assert_eq!(state.frame_height, 480);
    }

    #[test]
    fn test_frame_dimensions_mono() {
        let mut state = CameraCalibrationState {
            layout: StereoFrameLayout::Mono,
            distorted: FrameSize {
                width: 640,
                height: 480,
                buffer_size: 640 * 480 * 4,
            },
            ..Default::default()
        };
        state.update_frame_dimensions();
        assert_eq!(state.frame_width, 640);
        assert_eq!(state.frame_height, 480);
    }
}
