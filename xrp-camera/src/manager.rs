//! Orchestrates a camera provider: static calibration matrices once per
//! change, per-application-frame projection matrices every render call.

use std::sync::{Arc, Mutex, RwLock};

use nalgebra::Matrix4;

use xrp_core::frame::lock_mutex;
use xrp_core::math::transform;
use xrp_core::{
    CameraFrame, ConfigStore, DepthFrame, Eye, Intrinsics, ProjectionMode, StereoFrameLayout,
    UvDistortionParameters,
};

use crate::error::Result;
use crate::projection::{self, AppProjectionLayer, ReferenceSpace};
use crate::provider::{CameraDisplayStats, CameraProvider, NEAR_PROJECTION_DISTANCE};
use crate::runtime::TrackingRuntime;

/// Projection state carried between render calls.
struct ProjectionState {
    /// Far plane the cached planar projections were built for. The far plane
    /// is pushed back 1.5x to account for the flat projection surface.
    projection_distance_far: f32,
    /// Per-eye inverted camera projection with the stereo sub-rectangle
    /// transform folded in.
    camera_projection_inv_far: [Matrix4<f32>; 2],
    last_sequence: u64,
    last_world_to_camera_clip: [Matrix4<f32>; 2],
    last_camera_clip_to_world: [Matrix4<f32>; 2],
    last_world_to_hmd_clip: [Matrix4<f32>; 2],
    last_disp_world_to_camera_clip: [Matrix4<f32>; 2],
    last_disparity_view_to_world: [Matrix4<f32>; 2],
}

impl Default for ProjectionState {
    fn default() -> Self {
        Self {
            projection_distance_far: 0.0,
            camera_projection_inv_far: [Matrix4::identity(); 2],
            last_sequence: 0,
            last_world_to_camera_clip: [Matrix4::identity(); 2],
            last_camera_clip_to_world: [Matrix4::identity(); 2],
            last_world_to_hmd_clip: [Matrix4::identity(); 2],
            last_disp_world_to_camera_clip: [Matrix4::identity(); 2],
            last_disparity_view_to_world: [Matrix4::identity(); 2],
        }
    }
}

pub struct CameraManager {
    provider: Arc<dyn CameraProvider>,
    runtime: Arc<dyn TrackingRuntime>,
    config: Arc<ConfigStore>,
    state: Mutex<ProjectionState>,
}

impl CameraManager {
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        runtime: Arc<dyn TrackingRuntime>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            provider,
            runtime,
            config,
            state: Mutex::new(ProjectionState::default()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn CameraProvider> {
        &self.provider
    }

    pub fn init_camera(&self) -> Result<()> {
        self.provider.init_camera()
    }

    pub fn deinit_camera(&self) {
        self.provider.deinit_camera();
    }

    pub fn set_paused(&self, paused: bool) {
        self.provider.set_paused(paused);
    }

    pub fn is_initialized(&self) -> bool {
        self.provider.is_initialized()
    }

    pub fn get_camera_frame(&self) -> Option<Arc<RwLock<CameraFrame>>> {
        self.provider.get_camera_frame()
    }

    pub fn update_static_camera_parameters(&self) -> Result<()> {
        self.provider.update_static_camera_parameters()
    }

    pub fn frame_layout(&self) -> StereoFrameLayout {
        self.provider.frame_layout()
    }

    pub fn intrinsics(&self, eye: Eye) -> Intrinsics {
        self.provider.intrinsics(eye)
    }

    pub fn distortion_coefficients(&self) -> [f64; 16] {
        self.provider.distortion_coefficients()
    }

    pub fn left_to_right_transform(&self) -> Matrix4<f32> {
        self.provider.left_to_right_transform()
    }

    pub fn average_acquisition_time_ms(&self) -> f32 {
        self.provider.average_acquisition_time_ms()
    }

    pub fn display_stats(&self) -> CameraDisplayStats {
        self.provider.display_stats()
    }

    /// Rebuild the cached planar projections when the configured projection
    /// distance changed.
    fn update_projection_matrix(&self, state: &mut ProjectionState) -> Result<()> {
        let config = self.config.snapshot();
        let far = config.main.projection_distance_far * 1.5;
        if far == state.projection_distance_far {
            return Ok(());
        }
        state.projection_distance_far = far;

        let layout = self.provider.frame_layout();
        let subrect = projection::stereo_subrect_transform(layout);

        let left = self
            .provider
            .camera_projection(Eye::Left, NEAR_PROJECTION_DISTANCE, far)?;
        state.camera_projection_inv_far[0] = transform::invert(&left)? * subrect;

        if layout.is_stereo() {
            let right = self
                .provider
                .camera_projection(Eye::Right, NEAR_PROJECTION_DISTANCE, far)?;
            state.camera_projection_inv_far[1] = transform::invert(&right)? * subrect;
        } else {
            state.camera_projection_inv_far[1] = state.camera_projection_inv_far[0];
        }
        Ok(())
    }

    /// Compute the full per-eye matrix chain for one application frame and
    /// update the previous-frame matrices used for temporal reprojection.
    pub fn calculate_frame_projection(
        &self,
        frame: &mut CameraFrame,
        depth_frame: &mut DepthFrame,
        layer: &AppProjectionLayer,
        ref_space: &ReferenceSpace,
        distortion: &UvDistortionParameters,
    ) -> Result<()> {
        let mut state = lock_mutex(&self.state);
        self.update_projection_matrix(&mut state)?;

        // Recomputed below as an OR across the eyes.
        frame.has_reversed_depth = false;

        for eye in Eye::BOTH {
            self.calculate_frame_projection_for_eye(
                eye, frame, layer, ref_space, distortion, &state,
            )?;
        }

        // An upside-down FOV means the application renders mirrored, which
        // flips triangle winding downstream.
        frame.rendering_mirrored = layer.views[0].fov.is_mirrored();

        if depth_frame.first_render {
            depth_frame.prev_world_to_camera_clip = state.last_disp_world_to_camera_clip;
            depth_frame.prev_disparity_view_to_world = state.last_disparity_view_to_world;

            state.last_disp_world_to_camera_clip = frame.world_to_camera_clip;
            state.last_disparity_view_to_world = depth_frame.disparity_view_to_world;
        }

        if frame.sequence != state.last_sequence {
            frame.prev_camera_clip_to_world = state.last_camera_clip_to_world;
            frame.prev_world_to_camera_clip = state.last_world_to_camera_clip;

            state.last_camera_clip_to_world = frame.camera_clip_to_world;
            state.last_world_to_camera_clip = frame.world_to_camera_clip;
            state.last_sequence = frame.sequence;

            frame.first_render = true;
        } else {
            // Previous HMD frame was rendered from this same camera frame.
            frame.prev_camera_clip_to_world = frame.camera_clip_to_world;
            frame.prev_world_to_camera_clip = frame.world_to_camera_clip;

            frame.first_render = false;
        }

        frame.prev_world_to_hmd_clip = state.last_world_to_hmd_clip;
        state.last_world_to_hmd_clip = frame.world_to_hmd_clip;

        Ok(())
    }

    fn calculate_frame_projection_for_eye(
        &self,
        eye: Eye,
        frame: &mut CameraFrame,
        layer: &AppProjectionLayer,
        ref_space: &ReferenceSpace,
        distortion: &UvDistortionParameters,
        state: &ProjectionState,
    ) -> Result<()> {
        let config = self.config.snapshot();
        let is_stereo = frame.layout.is_stereo();
        let i = eye.index();
        let view = &layer.views[i];

        let hmd_world_to_view = projection::hmd_world_to_view(
            view,
            ref_space,
            &self.runtime.seated_to_standing_pose(),
        );
        let hmd_view_to_world = transform::invert_rigid(&hmd_world_to_view);

        frame.projection_origin_world[i] = if self.provider.projection_origin_from_camera() {
            transform::translation_of(&frame.camera_to_world[i])
        } else {
            transform::translation_of(&hmd_view_to_world)
        };

        let hmd_projection = projection::hmd_eye_projection(
            &view.fov,
            view.depth_range.as_ref(),
            NEAR_PROJECTION_DISTANCE,
            state.projection_distance_far,
        );
        frame.has_reversed_depth |= hmd_projection.has_reversed_depth;
        frame.world_to_hmd_clip[i] = hmd_projection.matrix * hmd_world_to_view;

        match config.main.projection_mode {
            ProjectionMode::RoomView2d => {
                let source = if eye == Eye::Left || is_stereo { i } else { 0 };
                frame.camera_clip_to_world[i] = frame.camera_to_world[source]
                    * state.camera_projection_inv_far[source];
                frame.world_to_camera_clip[i] =
                    transform::invert(&frame.camera_clip_to_world[i])?;

                frame.frame_uv_homography[i] = projection::frame_quad_homography(
                    &(frame.world_to_hmd_clip[i] * frame.camera_clip_to_world[i]),
                );
            }
            ProjectionMode::StereoReconstruction => {
                let camera_id = if eye == Eye::Right && is_stereo { 1 } else { 0 };
                let (width, height) = self.provider.eye_frame_size();

                let rectified = &distortion.camera_projection[camera_id];
                let intrinsics = Intrinsics::new(
                    rectified[(0, 0)],
                    rectified[(1, 1)],
                    rectified[(0, 2)],
                    rectified[(1, 2)],
                );
                let frame_projection = projection::camera_clip_projection(
                    &intrinsics,
                    width,
                    height,
                    NEAR_PROJECTION_DISTANCE,
                    state.projection_distance_far,
                );
                let frame_projection_inv = transform::invert(&frame_projection)?;

                match eye {
                    Eye::Left => {
                        let rect = projection::flip_left_rectified_rotation(
                            &distortion.rectified_rotation[0],
                        );
                        let rect_inv = rect.transpose();

                        let camera_from_world =
                            transform::invert_rigid(&frame.camera_to_world[0]);
                        frame.world_to_camera_clip[0] =
                            frame_projection * (rect_inv * camera_from_world);
                        frame.camera_clip_to_world[0] =
                            frame.camera_to_world[0] * (rect * frame_projection_inv);
                    }
                    Eye::Right => {
                        let rect = distortion.rectified_rotation[1];
                        let rect_inv = rect.transpose();

                        let camera_from_world =
                            transform::invert_rigid(&frame.camera_to_world[1]);
                        frame.world_to_camera_clip[1] =
                            frame_projection * (rect_inv * camera_from_world);

                        if is_stereo {
                            frame.camera_clip_to_world[1] =
                                frame.camera_to_world[1] * (rect * frame_projection_inv);
                        } else {
                            frame.camera_clip_to_world[1] = frame.camera_to_world[0]
                                * (distortion.rectified_rotation[0] * frame_projection_inv);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCamera;
    use crate::projection::{DepthRange, EyeView};
    use crate::testing::MockRuntime;
    use nalgebra::Vector3;
    use xrp_core::Config;
    use xrp_core::math::transform::FieldOfView;

    fn manager_with(config: Config, runtime: MockRuntime) -> CameraManager {
        let runtime = Arc::new(runtime);
        let store = Arc::new(ConfigStore::new(config));
        let provider = Arc::new(DeviceCamera::new(runtime.clone(), store.clone()));
        provider.update_static_camera_parameters().unwrap();
        CameraManager::new(provider, runtime, store)
    }

    fn test_frame(layout: StereoFrameLayout, sequence: u64) -> CameraFrame {
        CameraFrame {
            sequence,
            layout,
            camera_to_world: [
                transform::translation(-0.03, 1.6, 0.0),
                transform::translation(0.03, 1.6, 0.0),
            ],
            valid: true,
            ..Default::default()
        }
    }

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
    fn test_clip_matrices_are_inverses_in_2d_mode() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame::default();

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &AppProjectionLayer::default(),
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();

        for i in 0..2 {
            let roundtrip = frame.world_to_camera_clip[i] * frame.camera_clip_to_world[i];
            assert_mat_eq(&roundtrip, &Matrix4::identity(), 1e-3);
        }
    }

    #[test]
    fn test_clip_matrices_are_inverses_in_3d_mode() {
        let mut config = Config::default();
        config.main.projection_mode = ProjectionMode::StereoReconstruction;
        let manager = manager_with(config, MockRuntime::horizontal_stereo());

        let mut frame = test_frame(StereoFrameLayout::StereoHorizontal, 1);
        let mut depth = DepthFrame::default();
        let mut distortion = UvDistortionParameters::default();
        for i in 0..2 {
            // Rectified projection: focal 320, center at the frame middle.
            // Rectification rotations stay identity as the depth pipeline
            // publishes them.
            distortion.camera_projection[i] = Matrix4::identity();
            distortion.camera_projection[i][(0, 0)] = 320.0;
            distortion.camera_projection[i][(1, 1)] = 320.0;
            distortion.camera_projection[i][(0, 2)] = 320.0;
            distortion.camera_projection[i][(1, 2)] = 240.0;
        }

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &AppProjectionLayer::default(),
                &ReferenceSpace::default(),
                &distortion,
            )
            .unwrap();

        for i in 0..2 {
            let roundtrip = frame.world_to_camera_clip[i] * frame.camera_clip_to_world[i];
            assert_mat_eq(&roundtrip, &Matrix4::identity(), 1e-3);
        }
    }

    #[test]
    fn test_mono_right_eye_matches_left() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        frame.camera_to_world = [transform::translation(0.0, 1.6, 0.0); 2];
        let mut depth = DepthFrame::default();

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &AppProjectionLayer::default(),
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();

        assert_mat_eq(
            &frame.camera_clip_to_world[0],
            &frame.camera_clip_to_world[1],
            1e-6,
        );
        assert_mat_eq(
            &frame.world_to_camera_clip[0],
            &frame.world_to_camera_clip[1],
            1e-6,
        );
    }

    #[test]
    fn test_reversed_depth_sets_flag() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame::default();

        let mut layer = AppProjectionLayer::default();
        for view in &mut layer.views {
            view.depth_range = Some(DepthRange {
                near_z: 100.0,
                far_z: 0.1,
                min_depth: 0.0,
                max_depth: 1.0,
            });
        }

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &layer,
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();
        assert!(frame.has_reversed_depth);
    }

    #[test]
    fn test_reversed_depth_flag_not_masked_by_other_eye() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame::default();

        // Only the left view submits a reversed range; the right view's
        // regular range must not clear the flag.
        let mut layer = AppProjectionLayer::default();
        layer.views[0].depth_range = Some(DepthRange {
            near_z: 100.0,
            far_z: 0.1,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        layer.views[1].depth_range = Some(DepthRange {
            near_z: 0.1,
            far_z: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        });

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &layer,
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();
        assert!(frame.has_reversed_depth);

        // A later frame with regular ranges clears it again.
        frame.sequence = 2;
        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &AppProjectionLayer::default(),
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();
        assert!(!frame.has_reversed_depth);
    }

    #[test]
    fn test_mirrored_rendering_detected() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame::default();

        let mut layer = AppProjectionLayer::default();
        layer.views[0].fov = FieldOfView {
            angle_left: -0.8,
            angle_right: 0.8,
            angle_up: -0.7,
            angle_down: 0.7,
        };

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &layer,
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();
        assert!(frame.rendering_mirrored);
    }

    #[test]
    fn test_first_render_tracks_sequence_changes() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut depth = DepthFrame::default();
        let layer = AppProjectionLayer::default();
        let space = ReferenceSpace::default();
        let distortion = UvDistortionParameters::default();

        let mut frame = test_frame(StereoFrameLayout::Mono, 5);
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();
        assert!(frame.first_render);

        // Same camera frame rendered for a second application frame.
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();
        assert!(!frame.first_render);
        assert_mat_eq(
            &frame.prev_world_to_camera_clip[0],
            &frame.world_to_camera_clip[0],
            0.0,
        );

        frame.sequence = 6;
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();
        assert!(frame.first_render);
    }

    #[test]
    fn test_prev_hmd_clip_lags_one_call() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut depth = DepthFrame::default();
        let space = ReferenceSpace::default();
        let distortion = UvDistortionParameters::default();

        let mut layer = AppProjectionLayer::default();
        layer.views[0].position = Vector3::new(0.0, 1.6, 0.0);
        layer.views[1].position = Vector3::new(0.0, 1.6, 0.0);

        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();
        let first_clip = frame.world_to_hmd_clip[0];

        layer.views[0].position = Vector3::new(0.2, 1.6, 0.1);
        frame.sequence = 2;
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();

        assert_mat_eq(&frame.prev_world_to_hmd_clip[0], &first_clip, 0.0);
        assert!((frame.world_to_hmd_clip[0] - first_clip).norm() > 1e-4);
    }

    #[test]
    fn test_depth_frame_prev_matrices_update_on_first_render() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let layer = AppProjectionLayer::default();
        let space = ReferenceSpace::default();
        let distortion = UvDistortionParameters::default();

        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame {
            first_render: true,
            disparity_view_to_world: [transform::translation(0.0, 0.0, -1.0); 2],
            ..Default::default()
        };

        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();

        // First cycle: the previous matrices come from the identity-seeded
        // state, and the current ones are latched for the next cycle.
        assert_mat_eq(
            &depth.prev_disparity_view_to_world[0],
            &Matrix4::identity(),
            0.0,
        );

        frame.sequence = 2;
        manager
            .calculate_frame_projection(&mut frame, &mut depth, &layer, &space, &distortion)
            .unwrap();
        assert_mat_eq(
            &depth.prev_disparity_view_to_world[0],
            &transform::translation(0.0, 0.0, -1.0),
            0.0,
        );
    }

    #[test]
    fn test_projection_origin_at_hmd_view_position() {
        let manager = manager_with(Config::default(), MockRuntime::mono_640x480());
        let mut frame = test_frame(StereoFrameLayout::Mono, 1);
        let mut depth = DepthFrame::default();

        let mut layer = AppProjectionLayer::default();
        layer.views[0].position = Vector3::new(0.3, 1.5, -0.2);

        manager
            .calculate_frame_projection(
                &mut frame,
                &mut depth,
                &layer,
                &ReferenceSpace::default(),
                &UvDistortionParameters::default(),
            )
            .unwrap();

        let origin = frame.projection_origin_world[0];
        assert!((origin - Vector3::new(0.3, 1.5, -0.2)).norm() < 1e-5);
    }
}
