//! Head-mounted tracked camera backend.
//!
//! Frames, poses and calibration all come from the tracking service. The
//! service delivers frames asynchronously with no blocking wait, so the
//! acquisition thread polls the frame header and publishes on a sequence
//! change.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use nalgebra::Matrix4;
use tracing::{debug, error, info, warn};

use xrp_core::camera::quirks;
use xrp_core::frame::{lock_mutex, read_lock, write_lock};
use xrp_core::math::transform;
use xrp_core::metrics::{PERF_WINDOW, RollingAverage};
use xrp_core::{
    CameraFrame, ConfigStore, Eye, FramePayload, Intrinsics, ProjectionMode, StereoFrameLayout,
    TripleBuffer,
};

use crate::error::{CameraError, Result};
use crate::provider::{
    CameraCalibrationState, CameraDisplayStats, CameraProvider, FRAME_POLL_INTERVAL,
    MAX_LOGGED_FAILURES, POSTFRAME_SLEEP_INTERVAL,
};
use crate::runtime::{StreamHandle, TrackedFrameType, TrackingRuntime};

/// Per-eye camera-to-head poses in eye order, with the device quirks applied.
///
/// Vertical layouts report the poses with the indices reversed, and one such
/// headset additionally reports the left pose with a negated scale on two
/// basis vectors.
pub(crate) fn tracked_eye_poses(
    runtime: &dyn TrackingRuntime,
    device: u32,
    layout: StereoFrameLayout,
) -> Result<[Matrix4<f32>; 2]> {
    let raw = runtime.camera_to_head_poses(device)?;

    let mut poses = if layout.is_stereo() {
        let (left, right) = quirks::eye_pose_indices(layout);
        [raw[left], raw[right]]
    } else {
        [raw[0], raw[0]]
    };

    if layout == StereoFrameLayout::StereoVertical {
        quirks::correct_negative_pose_scale(&mut poses[Eye::Left.index()]);
    }

    Ok(poses)
}

/// State shared between the owning provider and its acquisition thread.
struct DeviceShared {
    runtime: Arc<dyn TrackingRuntime>,
    config: Arc<ConfigStore>,
    frames: TripleBuffer<CameraFrame>,
    calibration: RwLock<CameraCalibrationState>,
    initialized: AtomicBool,
    run_thread: AtomicBool,
    paused: AtomicBool,
    device_id: AtomicU32,
    stream: Mutex<Option<StreamHandle>>,
    acquisition_time: Mutex<RollingAverage>,
}

pub struct DeviceCamera {
    shared: Arc<DeviceShared>,
    serve_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceCamera {
    pub fn new(runtime: Arc<dyn TrackingRuntime>, config: Arc<ConfigStore>) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                runtime,
                config,
                frames: TripleBuffer::default(),
                calibration: RwLock::new(CameraCalibrationState::default()),
                initialized: AtomicBool::new(false),
                run_thread: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                device_id: AtomicU32::new(0),
                stream: Mutex::new(None),
                acquisition_time: Mutex::new(RollingAverage::new(PERF_WINDOW)),
            }),
            serve_thread: Mutex::new(None),
        }
    }

    /// Service camera index for an eye, accounting for the vertical layout
    /// index reversal.
    fn camera_index(&self, eye: Eye) -> u32 {
        let layout = read_lock(&self.shared.calibration).layout;
        if !layout.is_stereo() {
            return 0;
        }
        let (left, right) = quirks::eye_pose_indices(layout);
        match eye {
            Eye::Left => left as u32,
            Eye::Right => right as u32,
        }
    }
}

impl Drop for DeviceCamera {
    fn drop(&mut self) {
        self.deinit_camera();
    }
}

impl CameraProvider for DeviceCamera {
    fn init_camera(&self) -> Result<()> {
        if self.shared.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let device = self
            .shared
            .runtime
            .hmd_device_id()
            .ok_or(CameraError::NoCamera)?;

        if !self.shared.runtime.has_camera(device)? {
            return Err(CameraError::NoCamera);
        }
        self.shared.device_id.store(device, Ordering::Release);

        self.update_static_camera_parameters()?;

        let handle = self.shared.runtime.acquire_stream(device)?;
        *lock_mutex(&self.shared.stream) = Some(handle);

        self.shared.initialized.store(true, Ordering::Release);
        self.shared.run_thread.store(true, Ordering::Release);

        let mut thread = lock_mutex(&self.serve_thread);
        if thread.is_none() {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name("camera-serve".to_string())
                .spawn(move || serve_frames(&shared))
                .map_err(|e| CameraError::Thread(e.to_string()))?;
            *thread = Some(handle);
        }

        info!(device, "tracked camera initialized");
        Ok(())
    }

    fn deinit_camera(&self) {
        if !self.shared.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.run_thread.store(false, Ordering::Release);

        // The thread must be gone before the stream handle it polls is
        // released.
        if let Some(handle) = lock_mutex(&self.serve_thread).take() {
            if handle.join().is_err() {
                error!("camera acquisition thread panicked");
            }
        }

        if let Some(stream) = lock_mutex(&self.shared.stream).take() {
            if let Err(err) = self.shared.runtime.release_stream(stream) {
                warn!(%err, "failed to release camera stream");
            }
        }
    }

    fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    fn get_camera_frame(&self) -> Option<Arc<RwLock<CameraFrame>>> {
        if !self.is_initialized() {
            return None;
        }
        self.shared.frames.acquire()
    }

    fn update_static_camera_parameters(&self) -> Result<()> {
        let runtime = self.shared.runtime.as_ref();
        let device = self.shared.device_id.load(Ordering::Acquire);
        let config = self.shared.config.snapshot();

        let distorted = runtime.frame_size(device, TrackedFrameType::Distorted)?;
        if distorted.width == 0 || distorted.height == 0 || distorted.buffer_size == 0 {
            return Err(CameraError::InvalidFrameSize {
                width: distorted.width,
                height: distorted.height,
                buffer_size: distorted.buffer_size,
            });
        }
        let undistorted = runtime.frame_size(device, TrackedFrameType::MaximumUndistorted)?;
        let layout = runtime.frame_layout(device)?;

        let reported = tracked_eye_poses(runtime, device, layout)?;
        let head_to_camera_reported = [
            transform::invert_rigid(&reported[0]),
            transform::invert_rigid(&reported[1]),
        ];

        // A custom calibration replaces the service extrinsics entirely.
        let camera_to_head = if config.camera.use_custom_calibration {
            [
                config.camera.camera_left.pose(),
                config.camera.camera_right.pose(),
            ]
        } else {
            reported
        };
        let head_to_camera = [
            transform::invert_rigid(&camera_to_head[0]),
            transform::invert_rigid(&camera_to_head[1]),
        ];

        let mut state = CameraCalibrationState {
            layout,
            distorted,
            undistorted,
            camera_to_head,
            head_to_camera,
            head_to_camera_reported,
            left_to_right: head_to_camera[Eye::Right.index()]
                * camera_to_head[Eye::Left.index()],
            right_to_left: head_to_camera[Eye::Left.index()]
                * camera_to_head[Eye::Right.index()],
            ..Default::default()
        };
        state.update_frame_dimensions();

        debug!(
            width = state.distorted.width,
            height = state.distorted.height,
            ?layout,
            "camera parameters updated"
        );

        *write_lock(&self.shared.calibration) = state;
        Ok(())
    }

    fn frame_layout(&self) -> StereoFrameLayout {
        read_lock(&self.shared.calibration).layout
    }

    fn distorted_frame_size(&self) -> crate::runtime::FrameSize {
        read_lock(&self.shared.calibration).distorted
    }

    fn undistorted_frame_size(&self) -> crate::runtime::FrameSize {
        read_lock(&self.shared.calibration).undistorted
    }

    fn eye_frame_size(&self) -> (u32, u32) {
        let calibration = read_lock(&self.shared.calibration);
        (calibration.frame_width, calibration.frame_height)
    }

    fn intrinsics(&self, eye: Eye) -> Intrinsics {
        let config = self.shared.config.snapshot();
        let calibration = read_lock(&self.shared.calibration);

        if config.camera.use_custom_calibration {
            let record = match eye {
                Eye::Left => &config.camera.camera_left,
                Eye::Right => &config.camera.camera_right,
            };
            return record.intrinsics_for_frame(calibration.frame_width, calibration.frame_height);
        }

        let device = self.shared.device_id.load(Ordering::Acquire);
        let index = self.camera_index(eye);
        match self.shared.runtime.camera_intrinsics(device, index) {
            // Reported for the undistorted size, used on the distorted frame.
            Ok(reported) => quirks::rescale_intrinsics(
                &reported,
                (calibration.frame_width, calibration.frame_height),
                (
                    calibration.undistorted_frame_width,
                    calibration.undistorted_frame_height,
                ),
            ),
            Err(err) => {
                warn!(%err, "intrinsics query failed");
                Intrinsics::default()
            }
        }
    }

    fn distortion_coefficients(&self) -> [f64; 16] {
        let config = self.shared.config.snapshot();
        if config.camera.use_custom_calibration {
            let mut coeffs = [0.0; 16];
            coeffs[..4].copy_from_slice(&config.camera.camera_left.distortion);
            coeffs[8..12].copy_from_slice(&config.camera.camera_right.distortion);
            return coeffs;
        }

        let device = self.shared.device_id.load(Ordering::Acquire);
        match self.shared.runtime.distortion_coefficients(device) {
            Ok(coeffs) => coeffs,
            Err(err) => {
                warn!(%err, "distortion coefficient query failed");
                [0.0; 16]
            }
        }
    }

    fn left_to_right_transform(&self) -> Matrix4<f32> {
        read_lock(&self.shared.calibration).left_to_right
    }

    fn camera_projection(&self, eye: Eye, near_z: f32, far_z: f32) -> Result<Matrix4<f32>> {
        let device = self.shared.device_id.load(Ordering::Acquire);
        let index = self.camera_index(eye);
        Ok(self
            .shared
            .runtime
            .camera_projection(device, index, near_z, far_z)?)
    }

    fn uses_fisheye_model(&self) -> bool {
        let config = self.shared.config.snapshot();
        if config.camera.use_custom_calibration {
            config.camera.fisheye_lens
        } else {
            true
        }
    }

    fn average_acquisition_time_ms(&self) -> f32 {
        lock_mutex(&self.shared.acquisition_time).average_ms()
    }

    fn display_stats(&self) -> CameraDisplayStats {
        let calibration = read_lock(&self.shared.calibration);
        CameraDisplayStats {
            width: calibration.distorted.width,
            height: calibration.distorted.height,
            frame_rate: 0.0,
            api: "Tracked camera service".to_string(),
        }
    }
}

fn serve_frames(shared: &DeviceShared) {
    let mut has_frame = false;
    let mut last_sequence = 0u64;
    let mut logged_failures = 0u32;

    while shared.run_thread.load(Ordering::Acquire) {
        std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);

        if !shared.run_thread.load(Ordering::Acquire) {
            return;
        }
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }

        let Some(stream) = *lock_mutex(&shared.stream) else {
            continue;
        };

        let mut retrieval_start = None;

        shared.frames.publish_with(|frame| {
            let config = shared.config.snapshot();
            let frame_type = match config.main.projection_mode {
                ProjectionMode::RoomView2d => TrackedFrameType::MaximumUndistorted,
                ProjectionMode::StereoReconstruction => TrackedFrameType::Distorted,
            };

            let header = loop {
                match shared.runtime.frame_header(stream, frame_type) {
                    Ok(header) => {
                        if !has_frame || header.sequence != last_sequence {
                            break header;
                        }
                    }
                    Err(err) if !err.is_benign() => {
                        logged_failures += 1;
                        if logged_failures <= MAX_LOGGED_FAILURES {
                            warn!(%err, "frame header poll failed");
                        }
                        // Abandon the cycle and retry at the coarse cadence
                        // instead of spinning on a broken stream.
                        return false;
                    }
                    Err(_) => {}
                }

                if !shared.run_thread.load(Ordering::Acquire) {
                    return false;
                }
                std::thread::sleep(FRAME_POLL_INTERVAL);
                if !shared.run_thread.load(Ordering::Acquire) {
                    return false;
                }
            };

            retrieval_start = Some(Instant::now());
            let calibration = read_lock(&shared.calibration).clone();

            // CPU-side stereo processing needs the pixels; the planar mode
            // can stay zero-copy on the shared texture.
            if config.main.projection_mode == ProjectionMode::StereoReconstruction {
                let mut buffer = match std::mem::take(&mut frame.payload) {
                    FramePayload::Buffer(buffer) => buffer,
                    _ => Vec::new(),
                };
                buffer.resize(calibration.distorted.buffer_size as usize, 0);

                if let Err(err) = shared.runtime.copy_frame_buffer(stream, frame_type, &mut buffer)
                {
                    warn!(%err, "frame buffer copy failed");
                    frame.payload = FramePayload::Buffer(buffer);
                    return false;
                }
                frame.payload = FramePayload::Buffer(buffer);
            } else {
                match shared.runtime.acquire_frame_texture(stream, frame_type) {
                    Ok(texture) => frame.payload = FramePayload::Texture(texture),
                    Err(err) => {
                        warn!(%err, "frame texture acquisition failed");
                        return false;
                    }
                }
            }

            has_frame = true;
            last_sequence = header.sequence;

            frame.sequence = header.sequence;
            frame.exposure_time_ticks = header.exposure_time_ticks;
            frame.width = header.width;
            frame.height = header.height;
            frame.bytes_per_pixel = header.bytes_per_pixel;
            frame.layout = calibration.layout;

            compute_camera_poses(
                frame,
                &calibration,
                &header.device_to_tracking,
                config.camera.use_custom_calibration,
                config.main.depth_offset_calibration,
            );

            frame.valid = true;
            true
        });

        if let Some(start) = retrieval_start {
            lock_mutex(&shared.acquisition_time).push(start.elapsed());
        }
    }
}

/// Camera-to-world poses from the device pose the frame was stamped with.
///
/// The device pose already has the service's own camera offset folded in, for
/// the camera the device associates its pose with: the right camera on
/// vertical layouts, the left otherwise. That offset is stripped to recover
/// the head pose, the corrected per-eye offset is re-applied, and the other
/// eye is placed through the cross-camera transform.
fn compute_camera_poses(
    frame: &mut CameraFrame,
    calibration: &CameraCalibrationState,
    device_to_tracking: &Matrix4<f32>,
    custom_calibration: bool,
    depth_offset: f32,
) {
    let (pose_eye, other_eye) = if calibration.layout == StereoFrameLayout::StereoVertical {
        (Eye::Right, Eye::Left)
    } else {
        (Eye::Left, Eye::Right)
    };

    let reported_inverse = if custom_calibration {
        &calibration.head_to_camera_reported[pose_eye.index()]
    } else {
        &calibration.head_to_camera[pose_eye.index()]
    };
    let head_to_tracking = quirks::strip_device_calibration(device_to_tracking, reported_inverse);

    let mut camera_offset = calibration.camera_to_head[pose_eye.index()];
    quirks::apply_depth_offset(&mut camera_offset, depth_offset);
    frame.camera_to_world[pose_eye.index()] = head_to_tracking * camera_offset;

    let mut cross = if pose_eye == Eye::Right {
        calibration.left_to_right
    } else {
        calibration.right_to_left
    };
    quirks::apply_depth_offset(&mut cross, depth_offset);
    frame.camera_to_world[other_eye.index()] =
        frame.camera_to_world[pose_eye.index()] * cross;
}
