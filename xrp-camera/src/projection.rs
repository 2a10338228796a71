//! Per-application-frame projection math.
//!
//! Pure functions turning the application's submitted view poses into the
//! matrix chain stored on a camera frame. The only state the callers keep is
//! the cached planar projection rebuilt when the far plane moves.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector2, Vector3};

use xrp_core::math::homography;
use xrp_core::math::transform::{self, FieldOfView};
use xrp_core::{Intrinsics, StereoFrameLayout};

/// Depth range submitted alongside an application view. `min_depth` and
/// `max_depth` select the clip-volume sub-range the application renders into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub near_z: f32,
    pub far_z: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

/// One application view: the eye pose the compositor will reproject against,
/// the frustum it rendered with and, optionally, its depth-buffer range.
#[derive(Debug, Clone)]
pub struct EyeView {
    pub position: Vector3<f32>,
    pub orientation: UnitQuaternion<f32>,
    pub fov: FieldOfView,
    pub depth_range: Option<DepthRange>,
}

impl Default for EyeView {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            fov: FieldOfView::symmetric(0.8, 0.8),
            depth_range: None,
        }
    }
}

/// The projection layer descriptor the interception layer hands over each
/// application frame. Views are indexed left, right.
#[derive(Debug, Clone, Default)]
pub struct AppProjectionLayer {
    pub views: [EyeView; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceSpaceType {
    /// Seated origin; composed with the seated-to-standing transform.
    Local,
    #[default]
    Stage,
}

/// The application's reference space: its type plus the pose the application
/// configured within it.
#[derive(Debug, Clone)]
pub struct ReferenceSpace {
    pub space_type: ReferenceSpaceType,
    pub position: Vector3<f32>,
    pub orientation: UnitQuaternion<f32>,
}

impl Default for ReferenceSpace {
    fn default() -> Self {
        Self {
            space_type: ReferenceSpaceType::Stage,
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }
}

/// HMD eye projection matrix plus the depth convention it was built for.
#[derive(Debug, Clone, Copy)]
pub struct HmdProjection {
    pub matrix: Matrix4<f32>,
    pub has_reversed_depth: bool,
}

/// Matrix from the roomscale origin to the HMD eye view.
///
/// The application-provided eye pose is authoritative so that compositor
/// reprojection lines up; the runtime's own pose query is never used here.
pub fn hmd_world_to_view(
    view: &EyeView,
    ref_space: &ReferenceSpace,
    seated_to_standing: &Matrix4<f32>,
) -> Matrix4<f32> {
    let tracking_to_view =
        transform::invert_rigid(&transform::pose_from_rigid(&view.position, &view.orientation));

    let ref_space_pose = transform::invert_rigid(&transform::pose_from_rigid(
        &ref_space.position,
        &ref_space.orientation,
    ));

    match ref_space.space_type {
        ReferenceSpaceType::Local => {
            let tracking_to_stage = transform::invert_rigid(seated_to_standing);
            tracking_to_view * (ref_space_pose * tracking_to_stage)
        }
        ReferenceSpaceType::Stage => tracking_to_view * ref_space_pose,
    }
}

/// HMD eye projection over the application's depth range.
///
/// A submitted range with far < near is the reversed-depth convention: the
/// planes are swapped for the matrix build and the flag records it for the
/// renderer. An infinite or non-finite far plane and the depth sub-range
/// rewrite both override the rows the standard build gets wrong.
pub fn hmd_eye_projection(
    fov: &FieldOfView,
    depth_range: Option<&DepthRange>,
    default_near: f32,
    default_far: f32,
) -> HmdProjection {
    let mut near_z = default_near;
    let mut far_z = default_far;
    let mut has_reversed_depth = false;

    if let Some(range) = depth_range {
        if range.far_z < range.near_z {
            near_z = range.far_z;
            far_z = range.near_z;
            has_reversed_depth = true;
        } else {
            near_z = range.near_z;
            far_z = range.far_z;
        }
    }

    let mut matrix = transform::projection_fov(fov, near_z, far_z);

    if let Some(range) = depth_range {
        if far_z == f32::MAX || !far_z.is_finite() {
            transform::set_infinite_far_plane(&mut matrix, near_z);
        } else {
            // Raw application values, including a reversed near/far order.
            transform::set_depth_sub_range(
                &mut matrix,
                range.near_z,
                range.far_z,
                range.min_depth,
                range.max_depth,
            );
        }
    }

    HmdProjection {
        matrix,
        has_reversed_depth,
    }
}

/// Camera-space to clip-space projection from rectified intrinsics, with the
/// given frame dimensions and a 0..1 depth range looking down -Z.
pub fn camera_clip_projection(
    intrinsics: &Intrinsics,
    frame_width: u32,
    frame_height: u32,
    near_z: f32,
    far_z: f32,
) -> Matrix4<f32> {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let fx = intrinsics.focal.x;
    let fy = intrinsics.focal.y;
    let cx = intrinsics.center.x;
    let cy = intrinsics.center.y;

    Matrix4::new(
        2.0 * fx / w,
        0.0,
        1.0 - 2.0 * cx / w,
        0.0,
        0.0,
        -2.0 * fy / h,
        1.0 - 2.0 * cy / h,
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

/// Clip-space transform selecting one eye's sub-rectangle of a stereo frame,
/// applied on top of an inverted full-frame projection.
pub fn stereo_subrect_transform(layout: StereoFrameLayout) -> Matrix4<f32> {
    match layout {
        StereoFrameLayout::StereoHorizontal => {
            transform::translation(-0.5, 0.0, 0.0) * transform::scaling(0.5, 1.0, 1.0)
        }
        StereoFrameLayout::StereoVertical => {
            transform::translation(0.0, 0.5, 0.0) * transform::scaling(1.0, 0.5, 1.0)
        }
        StereoFrameLayout::Mono => Matrix4::identity(),
    }
}

/// The left camera's rectification rotation only lines up with the stereo
/// calibration when its y-axis column has the x and z rows negated.
pub fn flip_left_rectified_rotation(rotation: &Matrix4<f32>) -> Matrix4<f32> {
    let mut out = *rotation;
    out[(0, 1)] = -out[(0, 1)];
    out[(2, 1)] = -out[(2, 1)];
    out
}

/// Homography mapping camera clip-space corners onto their positions in HMD
/// clip space, for remapping a flat camera quad.
///
/// `combined` takes camera clip space through the world to HMD clip space.
/// The corners are sampled on the far clip plane. Falls back to identity when
/// a corner lands behind the view or the corners collapse.
pub fn frame_quad_homography(combined: &Matrix4<f32>) -> Matrix3<f32> {
    let src = [
        Vector2::new(-1.0, -1.0),
        Vector2::new(1.0, -1.0),
        Vector2::new(1.0, 1.0),
        Vector2::new(-1.0, 1.0),
    ];

    let mut dst = [Vector2::zeros(); 4];
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        let v = combined * nalgebra::Vector4::new(s.x, s.y, 1.0, 1.0);
        if v.w <= f32::EPSILON {
            return Matrix3::identity();
        }
        *d = Vector2::new(v.x / v.w, v.y / v.w);
    }

    homography::quad_to_quad(&src, &dst).unwrap_or_else(|_| Matrix3::identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrp_core::math::transform::project_point;

    fn assert_mat_eq(a: &Matrix4<f32>, b: &Matrix4<f32>, tol: f32) {
        for row in 0..4 {
            for col in 0..4 {
                assert!(
                    (a[(row, col)] - b[(row, col)]).abs() <= tol,
                    "mismatch at ({row},{col}): {} vs {}",
                    a[(row, col)],
                    b[(row, col)]
                );
            }
        }
    }

    #[test]
    fn test_world_to_view_inverts_eye_pose() {
        let view = EyeView {
            position: Vector3::new(0.1, 1.6, -0.3),
            orientation: UnitQuaternion::from_euler_angles(0.1, 0.4, 0.0),
            ..Default::default()
        };
        let world_to_view =
            hmd_world_to_view(&view, &ReferenceSpace::default(), &Matrix4::identity());

        // The eye position maps to the view-space origin.
        let p = transform::transform_point(&world_to_view, &view.position);
        assert!(p.norm() < 1e-5);
    }

    #[test]
    fn test_local_space_composes_seated_origin() {
        let view = EyeView::default();
        let seated_to_standing = transform::translation(0.0, 1.2, 0.0);
        let ref_space = ReferenceSpace {
            space_type: ReferenceSpaceType::Local,
            ..Default::default()
        };

        let world_to_view = hmd_world_to_view(&view, &ref_space, &seated_to_standing);

        // The standing-height point maps back to the seated origin.
        let p = transform::transform_point(&world_to_view, &Vector3::new(0.0, 1.2, 0.0));
        assert!(p.norm() < 1e-5);
    }

    #[test]
    fn test_reversed_depth_swaps_planes() {
        let fov = FieldOfView::symmetric(0.7, 0.6);
        let range = DepthRange {
            near_z: 100.0,
            far_z: 0.1,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let reversed = hmd_eye_projection(&fov, Some(&range), 0.1, 10.0);
        assert!(reversed.has_reversed_depth);

        let forward_range = DepthRange {
            near_z: 0.1,
            far_z: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let forward = hmd_eye_projection(&fov, Some(&forward_range), 0.1, 10.0);
        assert!(!forward.has_reversed_depth);

        // Same planes after the swap, so the frustum rows agree; the depth
        // rewrite uses the raw submitted order and differs.
        assert!((reversed.matrix[(0, 0)] - forward.matrix[(0, 0)]).abs() < 1e-6);
        assert!((reversed.matrix[(2, 2)] + forward.matrix[(2, 2)] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_infinite_far_plane_projection() {
        let fov = FieldOfView::symmetric(0.7, 0.6);
        let range = DepthRange {
            near_z: 0.05,
            far_z: f32::INFINITY,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let proj = hmd_eye_projection(&fov, Some(&range), 0.1, 10.0);
        assert_eq!(proj.matrix[(2, 2)], 0.0);
        assert_eq!(proj.matrix[(2, 3)], 0.05);
    }

    #[test]
    fn test_missing_depth_range_uses_defaults() {
        let fov = FieldOfView::symmetric(0.7, 0.6);
        let proj = hmd_eye_projection(&fov, None, 0.1, 15.0);
        assert!(!proj.has_reversed_depth);
        assert_mat_eq(&proj.matrix, &transform::projection_fov(&fov, 0.1, 15.0), 1e-6);
    }

    #[test]
    fn test_camera_clip_projection_principal_point() {
        // Centered principal point: the optical axis lands at clip center.
        let intr = Intrinsics::new(320.0, 320.0, 320.0, 240.0);
        let proj = camera_clip_projection(&intr, 640, 480, 0.1, 10.0);

        let p = project_point(&proj, &Vector3::new(0.0, 0.0, -5.0)).unwrap();
        assert!(p.x.abs() < 1e-6);
        assert!(p.y.abs() < 1e-6);

        // A point one focal length off-axis hits the right image edge at x=1.
        let p = project_point(&proj, &Vector3::new(5.0, 0.0, -5.0)).unwrap();
        assert!((p.x - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_subrect_transform_halves_clip_range() {
        // Horizontal stereo: full clip x range maps onto the left half.
        let m = stereo_subrect_transform(StereoFrameLayout::StereoHorizontal);
        let left = transform::transform_point(&m, &Vector3::new(-1.0, 0.0, 0.0));
        let right = transform::transform_point(&m, &Vector3::new(1.0, 0.0, 0.0));
        assert!((left.x - -1.0).abs() < 1e-6);
        assert!((right.x - 0.0).abs() < 1e-6);

        // Vertical stereo remaps y onto the upper half.
        let m = stereo_subrect_transform(StereoFrameLayout::StereoVertical);
        let bottom = transform::transform_point(&m, &Vector3::new(0.0, -1.0, 0.0));
        let top = transform::transform_point(&m, &Vector3::new(0.0, 1.0, 0.0));
        assert!((bottom.y - 0.0).abs() < 1e-6);
        assert!((top.y - 1.0).abs() < 1e-6);

        assert_mat_eq(
            &stereo_subrect_transform(StereoFrameLayout::Mono),
            &Matrix4::identity(),
            0.0,
        );
    }

    #[test]
    fn test_left_rotation_flip_is_self_inverse() {
        let r = transform::rotation_from_euler_deg(3.0, -7.0, 1.5);
        let flipped = flip_left_rectified_rotation(&r);
        assert!((flipped[(0, 1)] + r[(0, 1)]).abs() < 1e-6);
        assert!((flipped[(2, 1)] + r[(2, 1)]).abs() < 1e-6);
        assert_mat_eq(&flip_left_rectified_rotation(&flipped), &r, 0.0);
    }

    #[test]
    fn test_frame_quad_homography_identity_for_identity_transform() {
        let h = frame_quad_homography(&Matrix4::identity());
        for p in [
            Vector2::new(-1.0, -1.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.3, -0.4),
        ] {
            let q = homography::apply_homography(&h, &p).unwrap();
            assert!((q - p).norm() < 1e-4);
        }
    }

    #[test]
    fn test_frame_quad_homography_degenerate_falls_back() {
        // A transform collapsing everything to a point has no homography.
        let collapsed = Matrix4::from_element(0.0);
        let mut m = collapsed;
        m[(3, 3)] = 1.0;
        let h = frame_quad_homography(&m);
        assert_identity3(&h);
    }

    fn assert_identity3(h: &Matrix3<f32>) {
        for row in 0..3 {
            for col in 0..3 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert_eq!(h[(row, col)], expected);
            }
        }
    }
}
