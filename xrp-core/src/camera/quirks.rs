//! Device-specific corrections applied to service-reported calibration.

use nalgebra::Matrix4;

use super::{Intrinsics, StereoFrameLayout};

/// Pose array indices for the (left, right) eyes. Devices with a vertical
/// frame layout report the two poses in reversed order.
pub fn eye_pose_indices(layout: StereoFrameLayout) -> (usize, usize) {
    match layout {
        StereoFrameLayout::StereoVertical => (1, 0),
        _ => (0, 1),
    }
}

/// Some vertical-layout headsets report the left eye pose with a negated
/// scale on the Y and Z basis vectors. Forces those elements positive.
pub fn correct_negative_pose_scale(pose: &mut Matrix4<f32>) {
    pose[(1, 1)] = pose[(1, 1)].abs();
    pose[(2, 2)] = pose[(2, 2)].abs();
}

/// Rescale intrinsics the service reported for the undistorted frame size
/// onto the distorted frame they are actually used with.
pub fn rescale_intrinsics(
    intrinsics: &Intrinsics,
    distorted: (u32, u32),
    undistorted: (u32, u32),
) -> Intrinsics {
    let sx = distorted.0 as f32 / undistorted.0 as f32;
    let sy = distorted.1 as f32 / undistorted.1 as f32;
    Intrinsics::new(
        intrinsics.focal.x * sx,
        intrinsics.focal.y * sy,
        intrinsics.center.x * sx,
        intrinsics.center.y * sy,
    )
}

/// Remove the service-reported camera offset from a camera pose so that a
/// user-measured calibration can be applied in its place.
/// `head_to_camera_reported` is the inverse of the reported camera-to-head.
pub fn strip_device_calibration(
    camera_to_tracking: &Matrix4<f32>,
    head_to_camera_reported: &Matrix4<f32>,
) -> Matrix4<f32> {
    camera_to_tracking * head_to_camera_reported
}

/// Scale the translation column of a camera pose by the depth offset
/// calibration factor.
pub fn apply_depth_offset(pose: &mut Matrix4<f32>, factor: f32) {
    for row in 0..3 {
        pose[(row, 3)] *= factor;
    }
}
