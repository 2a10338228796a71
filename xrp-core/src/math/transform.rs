use nalgebra::{Matrix4, Rotation3, UnitQuaternion, Vector3};

use crate::error::{MathError, Result};

/// Asymmetric view frustum given as half-angles from the view axis, in
/// radians. Angles to the left of and below the axis are negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldOfView {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl FieldOfView {
    pub fn symmetric(half_horizontal: f32, half_vertical: f32) -> Self {
        Self {
            angle_left: -half_horizontal,
            angle_right: half_horizontal,
            angle_up: half_vertical,
            angle_down: -half_vertical,
        }
    }

    /// A vertically flipped frustum renders the image mirrored.
    pub fn is_mirrored(&self) -> bool {
        (self.angle_up - self.angle_down) < 0.0
    }
}

/// Rigid pose matrix from a position and orientation.
pub fn pose_from_rigid(position: &Vector3<f32>, orientation: &UnitQuaternion<f32>) -> Matrix4<f32> {
    let mut m = orientation.to_rotation_matrix().to_homogeneous();
    m[(0, 3)] = position.x;
    m[(1, 3)] = position.y;
    m[(2, 3)] = position.z;
    m
}

pub fn translation(x: f32, y: f32, z: f32) -> Matrix4<f32> {
    Matrix4::new_translation(&Vector3::new(x, y, z))
}

pub fn scaling(x: f32, y: f32, z: f32) -> Matrix4<f32> {
    Matrix4::new_nonuniform_scaling(&Vector3::new(x, y, z))
}

/// Rotation matrix from Euler angles in degrees, applied in X, Y, Z order.
pub fn rotation_from_euler_deg(x: f32, y: f32, z: f32) -> Matrix4<f32> {
    Rotation3::from_euler_angles(x.to_radians(), y.to_radians(), z.to_radians()).to_homogeneous()
}

pub fn invert(m: &Matrix4<f32>) -> Result<Matrix4<f32>> {
    m.try_inverse().ok_or(MathError::SingularMatrix.into())
}

/// Inverse of a rigid pose (rotation + translation only).
pub fn invert_rigid(m: &Matrix4<f32>) -> Matrix4<f32> {
    let r = m.fixed_view::<3, 3>(0, 0).transpose();
    let t = -(r * translation_of(m));
    let mut out = r.to_homogeneous();
    out[(0, 3)] = t.x;
    out[(1, 3)] = t.y;
    out[(2, 3)] = t.z;
    out
}

/// Transform a point with w = 1, without perspective division.
pub fn transform_point(m: &Matrix4<f32>, p: &Vector3<f32>) -> Vector3<f32> {
    let v = m * p.push(1.0);
    v.xyz()
}

/// Transform a point and divide by w.
pub fn project_point(m: &Matrix4<f32>, p: &Vector3<f32>) -> Option<Vector3<f32>> {
    let v = m * p.push(1.0);
    if v.w.abs() <= f32::EPSILON {
        return None;
    }
    Some(v.xyz() / v.w)
}

pub fn translation_of(m: &Matrix4<f32>) -> Vector3<f32> {
    Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)])
}

/// Projection matrix for an asymmetric frustum with 0..1 clip depth and
/// -1..1 lateral clip range, looking down -Z.
pub fn projection_fov(fov: &FieldOfView, near_z: f32, far_z: f32) -> Matrix4<f32> {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_up = fov.angle_up.tan();
    let tan_down = fov.angle_down.tan();

    let width = tan_right - tan_left;
    let height = tan_up - tan_down;

    Matrix4::new(
        2.0 / width,
        0.0,
        (tan_right + tan_left) / width,
        0.0,
        0.0,
        2.0 / height,
        (tan_up + tan_down) / height,
        0.0,
        0.0,
        0.0,
        -far_z / (far_z - near_z),
        -(far_z * near_z) / (far_z - near_z),
        0.0,
        0.0,
        -1.0,
        0.0,
    )
}

/// Rewrite the depth rows of a projection for an infinite far plane.
pub fn set_infinite_far_plane(projection: &mut Matrix4<f32>, near_z: f32) {
    projection[(2, 2)] = 0.0;
    projection[(2, 3)] = near_z;
}

/// Rewrite the depth rows of a projection so the output depth covers only the
/// [min_depth, max_depth] sub-range of the clip volume.
pub fn set_depth_sub_range(
    projection: &mut Matrix4<f32>,
    near_z: f32,
    far_z: f32,
    min_depth: f32,
    max_depth: f32,
) {
    projection[(2, 2)] = -(far_z * max_depth - near_z * min_depth) / (far_z - near_z);
    projection[(2, 3)] = -(far_z * near_z * (max_depth - min_depth)) / (far_z - near_z);
}
