pub mod quirks;

use nalgebra::{Matrix4, Vector2};
use serde::{Deserialize, Serialize};

use crate::math::transform;

/// Arrangement of camera views inside the delivered texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StereoFrameLayout {
    #[default]
    Mono,
    /// Left eye in the left half, right eye in the right half.
    StereoHorizontal,
    /// Left eye in the bottom half, right eye in the top half.
    StereoVertical,
}

impl StereoFrameLayout {
    pub fn is_stereo(self) -> bool {
        self != StereoFrameLayout::Mono
    }

    /// Logical per-eye frame size for a full texture of the given size.
    pub fn eye_frame_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            StereoFrameLayout::Mono => (width, height),
            StereoFrameLayout::StereoHorizontal => (width / 2, height),
            StereoFrameLayout::StereoVertical => (width, height / 2),
        }
    }

    /// Pixel offset of an eye's view inside the full texture.
    pub fn eye_frame_offset(self, eye: Eye, width: u32, height: u32) -> (u32, u32) {
        match (self, eye) {
            (StereoFrameLayout::StereoHorizontal, Eye::Right) => (width / 2, 0),
            (StereoFrameLayout::StereoVertical, Eye::Left) => (0, height / 2),
            _ => (0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Pinhole intrinsics in pixels of the frame they were measured for.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Intrinsics {
    pub focal: Vector2<f32>,
    pub center: Vector2<f32>,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self {
            focal: Vector2::new(fx, fy),
            center: Vector2::new(cx, cy),
        }
    }
}

/// User-measured calibration for one physical camera. Focal length and
/// principal point are given in pixels of the sensor resolution and rescaled
/// to whatever frame size the camera actually delivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationRecord {
    /// Camera position in head space, meters.
    pub translation: [f32; 3],
    /// Euler angles in degrees.
    pub rotation_deg: [f32; 3],
    pub focal: [f32; 2],
    pub center: [f32; 2],
    /// Fisheye distortion coefficients k1..k4.
    pub distortion: [f64; 4],
    pub sensor_pixels: [f32; 2],
}

impl Default for CalibrationRecord {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation_deg: [0.0; 3],
            focal: [320.0, 320.0],
            center: [320.0, 240.0],
            distortion: [0.0; 4],
            sensor_pixels: [640.0, 480.0],
        }
    }
}

impl CalibrationRecord {
    /// Head-to-camera transform as the calibration tool measures it.
    /// Rotation angles are stored in the opposite sense.
    pub fn pose_raw(&self) -> Matrix4<f32> {
        let t = transform::translation(
            self.translation[0],
            self.translation[1],
            self.translation[2],
        );
        let r = transform::rotation_from_euler_deg(
            -self.rotation_deg[0],
            -self.rotation_deg[1],
            -self.rotation_deg[2],
        );
        r * t
    }

    /// Camera-to-head pose from the configured extrinsics.
    pub fn pose(&self) -> Matrix4<f32> {
        transform::invert_rigid(&self.pose_raw())
    }

    /// Intrinsics rescaled onto a delivered frame of the given size.
    pub fn intrinsics_for_frame(&self, frame_width: u32, frame_height: u32) -> Intrinsics {
        let sx = frame_width as f32 / self.sensor_pixels[0];
        let sy = frame_height as f32 / self.sensor_pixels[1];
        Intrinsics::new(
            self.focal[0] * sx,
            self.focal[1] * sy,
            self.center[0] * sx,
            self.center[1] * sy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eye_frame_size_per_layout() {
        assert_eq!(StereoFrameLayout::Mono.eye_frame_size(640, 480), (640, 480));
        assert_eq!(
            StereoFrameLayout::StereoHorizontal.eye_frame_size(1280, 480),
            (640, 480)
        );
        assert_eq!(
            StereoFrameLayout::StereoVertical.eye_frame_size(640, 960),
            (640, 480)
        );
    }

    #[test]
    fn test_eye_frame_offsets() {
        let layout = StereoFrameLayout::StereoHorizontal;
        assert_eq!(layout.eye_frame_offset(Eye::Left, 1280, 480), (0, 0));
        assert_eq!(layout.eye_frame_offset(Eye::Right, 1280, 480), (640, 0));

        // Vertical layouts store the left view in the bottom half.
        let layout = StereoFrameLayout::StereoVertical;
        assert_eq!(layout.eye_frame_offset(Eye::Left, 640, 960), (0, 480));
        assert_eq!(layout.eye_frame_offset(Eye::Right, 640, 960), (0, 0));
    }

    #[test]
    fn test_calibration_intrinsics_rescale() {
        let record = CalibrationRecord {
            focal: [320.0, 320.0],
            center: [320.0, 240.0],
            sensor_pixels: [640.0, 480.0],
            ..Default::default()
        };

        // Same size as the sensor: unchanged.
        let intr = record.intrinsics_for_frame(640, 480);
        assert!((intr.focal.x - 320.0).abs() < 1e-6);
        assert!((intr.center.y - 240.0).abs() < 1e-6);

        // Half-size frame halves everything.
        let intr = record.intrinsics_for_frame(320, 240);
        assert!((intr.focal.x - 160.0).abs() < 1e-6);
        assert!((intr.center.x - 160.0).abs() < 1e-6);
        assert!((intr.center.y - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_calibration_pose_inverts_raw_measurement() {
        let record = CalibrationRecord {
            translation: [0.03, -0.01, 0.05],
            rotation_deg: [5.0, -10.0, 2.0],
            ..Default::default()
        };
        let roundtrip = record.pose() * record.pose_raw();
        for row in 0..4 {
            for col in 0..4 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert!((roundtrip[(row, col)] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_calibration_pose_translation_without_rotation() {
        let record = CalibrationRecord {
            translation: [0.03, -0.01, 0.05],
            ..Default::default()
        };
        let pose = record.pose();
        assert!((pose[(0, 3)] - -0.03).abs() < 1e-6);
        assert!((pose[(1, 3)] - 0.01).abs() < 1e-6);
        assert!((pose[(2, 3)] - -0.05).abs() < 1e-6);
    }
}
