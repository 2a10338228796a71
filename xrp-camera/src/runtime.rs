//! Trait seam over the VR tracking/video service the host links against.

use nalgebra::Matrix4;
use thiserror::Error;

use xrp_core::{Intrinsics, StereoFrameLayout};

/// Handle to an acquired camera video stream.
pub type StreamHandle = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("tracking service unavailable")]
    ServiceUnavailable,

    #[error("no camera on device {0}")]
    NoCamera(u32),

    /// The stream is live but has not delivered a frame yet. Benign.
    #[error("no frame available yet")]
    NoFrameAvailable,

    #[error("property read failed: {0}")]
    Property(String),

    #[error("camera stream error: {0}")]
    Stream(String),
}

impl RuntimeError {
    /// Whether the polling loop should keep retrying without logging.
    pub fn is_benign(&self) -> bool {
        matches!(self, RuntimeError::NoFrameAvailable)
    }
}

/// Frame variants the service can serve from the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedFrameType {
    Distorted,
    /// Undistorted with the maximum usable field of view.
    MaximumUndistorted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    pub buffer_size: u32,
}

/// Metadata of the most recent frame on a stream.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Exposure timestamp in runtime clock ticks.
    pub exposure_time_ticks: u64,
    /// Pose of the camera-bearing device at exposure time.
    pub device_to_tracking: Matrix4<f32>,
}

/// The subset of the VR runtime this layer consumes. The host wires a real
/// service implementation in; tests substitute a scripted one.
pub trait TrackingRuntime: Send + Sync {
    fn hmd_device_id(&self) -> Option<u32>;

    fn has_camera(&self, device: u32) -> Result<bool, RuntimeError>;

    fn frame_layout(&self, device: u32) -> Result<StereoFrameLayout, RuntimeError>;

    fn frame_size(
        &self,
        device: u32,
        frame_type: TrackedFrameType,
    ) -> Result<FrameSize, RuntimeError>;

    /// Intrinsics reported for the undistorted frame dimensions.
    fn camera_intrinsics(&self, device: u32, camera_index: u32)
    -> Result<Intrinsics, RuntimeError>;

    /// Projection matrix for one camera over the given depth range.
    fn camera_projection(
        &self,
        device: u32,
        camera_index: u32,
        near_z: f32,
        far_z: f32,
    ) -> Result<Matrix4<f32>, RuntimeError>;

    fn distortion_coefficients(&self, device: u32) -> Result<[f64; 16], RuntimeError>;

    /// Camera-to-head poses in raw device index order.
    fn camera_to_head_poses(&self, device: u32) -> Result<[Matrix4<f32>; 2], RuntimeError>;

    fn acquire_stream(&self, device: u32) -> Result<StreamHandle, RuntimeError>;

    fn release_stream(&self, handle: StreamHandle) -> Result<(), RuntimeError>;

    fn frame_header(
        &self,
        handle: StreamHandle,
        frame_type: TrackedFrameType,
    ) -> Result<FrameHeader, RuntimeError>;

    /// Copy the current frame's pixels into `out` as BGRA.
    fn copy_frame_buffer(
        &self,
        handle: StreamHandle,
        frame_type: TrackedFrameType,
        out: &mut [u8],
    ) -> Result<(), RuntimeError>;

    /// Shared GPU texture handle for the current frame.
    fn acquire_frame_texture(
        &self,
        handle: StreamHandle,
        frame_type: TrackedFrameType,
    ) -> Result<u64, RuntimeError>;

    /// Pose of a tracked device at `seconds_from_now` (negative values look
    /// into the past). `serial` selects a device; None means the HMD.
    fn device_pose(
        &self,
        seconds_from_now: f32,
        serial: Option<&str>,
    ) -> Result<Matrix4<f32>, RuntimeError>;

    fn seated_to_standing_pose(&self) -> Matrix4<f32>;

    fn ticks_per_second(&self) -> u64;

    fn now_ticks(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_frame_available_is_benign() {
        assert!(RuntimeError::NoFrameAvailable.is_benign());
        assert!(!RuntimeError::ServiceUnavailable.is_benign());
        assert!(!RuntimeError::Stream("reset".to_string()).is_benign());
    }

    #[test]
    fn test_runtime_error_display() {
        assert_eq!(
            RuntimeError::NoCamera(3).to_string(),
            "no camera on device 3"
        );
        assert_eq!(
            RuntimeError::Property("zero bytes".to_string()).to_string(),
            "property read failed: zero bytes"
        );
    }
}
