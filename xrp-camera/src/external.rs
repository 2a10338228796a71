//! External webcam backend.
//!
//! Frames come from a grab/retrieve video source and calibration entirely
//! from configuration. The capture device paces the acquisition loop, so a
//! successful grab is followed immediately by the next one. Poses come from
//! an optional tracked device the camera is mounted on, sampled into the
//! past by the configured frame delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use nalgebra::Matrix4;
use tracing::{error, info, warn};

use xrp_core::camera::quirks;
use xrp_core::frame::{lock_mutex, read_lock, write_lock};
use xrp_core::math::transform::{self, FieldOfView};
use xrp_core::metrics::{PERF_WINDOW, RollingAverage};
use xrp_core::{
    CameraConfig, CameraFrame, ConfigStore, Eye, FramePayload, Intrinsics, StereoFrameLayout,
    TripleBuffer,
};

use crate::error::{CameraError, Result};
use crate::provider::{
    CameraCalibrationState, CameraDisplayStats, CameraProvider, FRAME_POLL_INTERVAL,
    MAX_LOGGED_FAILURES, NEAR_PROJECTION_DISTANCE, POSTFRAME_SLEEP_INTERVAL,
};
use crate::runtime::{FrameSize, TrackingRuntime};
use crate::video::{VideoMode, VideoSource};

struct ExternalShared {
    runtime: Arc<dyn TrackingRuntime>,
    config: Arc<ConfigStore>,
    video: Mutex<Box<dyn VideoSource>>,
    frames: TripleBuffer<CameraFrame>,
    calibration: RwLock<CameraCalibrationState>,
    initialized: AtomicBool,
    run_thread: AtomicBool,
    paused: AtomicBool,
    /// Synthetic sequence counter; the capture API exposes none.
    sequence: AtomicU64,
    acquisition_time: Mutex<RollingAverage>,
}

pub struct ExternalCamera {
    shared: Arc<ExternalShared>,
    serve_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalCamera {
    pub fn new(
        runtime: Arc<dyn TrackingRuntime>,
        config: Arc<ConfigStore>,
        video: Box<dyn VideoSource>,
    ) -> Self {
        Self {
            shared: Arc::new(ExternalShared {
                runtime,
                config,
                video: Mutex::new(video),
                frames: TripleBuffer::default(),
                calibration: RwLock::new(CameraCalibrationState::default()),
                initialized: AtomicBool::new(false),
                run_thread: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                acquisition_time: Mutex::new(RollingAverage::new(PERF_WINDOW)),
            }),
            serve_thread: Mutex::new(None),
        }
    }
}

impl Drop for ExternalCamera {
    fn drop(&mut self) {
        self.deinit_camera();
    }
}

fn apply_exposure(video: &mut dyn VideoSource, config: &CameraConfig) {
    if config.auto_exposure {
        video.set_auto_exposure(true);
    } else {
        video.set_auto_exposure(false);
        video.set_exposure(config.exposure_value);
    }
}

/// Intrinsics for one eye, rescaled from the calibrated sensor size onto the
/// delivered texture and then halved along the packing axis of the layout.
fn eye_intrinsics(
    config: &CameraConfig,
    eye: Eye,
    texture_width: u32,
    texture_height: u32,
) -> Intrinsics {
    let record = match eye {
        Eye::Left => &config.camera_left,
        Eye::Right if config.frame_layout.is_stereo() => &config.camera_right,
        Eye::Right => &config.camera_left,
    };
    let mut intrinsics = record.intrinsics_for_frame(texture_width, texture_height);

    match config.frame_layout {
        StereoFrameLayout::StereoVertical => {
            intrinsics.focal.y /= 2.0;
            intrinsics.center.y /= 2.0;
        }
        StereoFrameLayout::StereoHorizontal => {
            intrinsics.focal.x /= 2.0;
            intrinsics.center.x /= 2.0;
        }
        StereoFrameLayout::Mono => {}
    }
    intrinsics
}

impl CameraProvider for ExternalCamera {
    fn init_camera(&self) -> Result<()> {
        if self.shared.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let config = self.shared.config.snapshot();

        {
            let mut video = lock_mutex(&self.shared.video);
            let mode = config.camera.request_custom_frame_size.then(|| VideoMode {
                width: config.camera.custom_frame_width,
                height: config.camera.custom_frame_height,
                frame_rate: config.camera.custom_frame_rate,
            });
            video.open(config.camera.device_index, mode)?;
            apply_exposure(video.as_mut(), &config.camera);

            info!(
                backend = %video.backend_name(),
                rate = video.frame_rate(),
                "video capture opened"
            );
        }

        if let Err(err) = self.update_static_camera_parameters() {
            lock_mutex(&self.shared.video).close();
            return Err(err);
        }

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

        Ok(())
    }

    fn deinit_camera(&self) {
        if !self.shared.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.run_thread.store(false, Ordering::Release);

        // The thread must be gone before the capture device it grabs from is
        // released.
        if let Some(handle) = lock_mutex(&self.serve_thread).take() {
            if handle.join().is_err() {
                error!("camera acquisition thread panicked");
            }
        }

        lock_mutex(&self.shared.video).close();
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
        let config = self.shared.config.snapshot();
        let layout = config.camera.frame_layout;

        let (width, height) = lock_mutex(&self.shared.video).frame_size();
        let buffer_size = width * height * 4;
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidFrameSize {
                width,
                height,
                buffer_size,
            });
        }

        let size = FrameSize {
            width,
            height,
            buffer_size,
        };

        let camera_to_head = [
            config.camera.camera_left.pose(),
            config.camera.camera_right.pose(),
        ];
        let head_to_camera = [
            transform::invert_rigid(&camera_to_head[0]),
            transform::invert_rigid(&camera_to_head[1]),
        ];

        // The cross-camera transform comes from the raw calibration
        // measurements, not the inverted poses.
        let left_to_right = if layout.is_stereo() {
            config.camera.camera_right.pose_raw()
                * transform::invert_rigid(&config.camera.camera_left.pose_raw())
        } else {
            Matrix4::identity()
        };

        let mut state = CameraCalibrationState {
            layout,
            distorted: size,
            undistorted: size,
            camera_to_head,
            head_to_camera,
            head_to_camera_reported: [Matrix4::identity(); 2],
            left_to_right,
            right_to_left: transform::invert_rigid(&left_to_right),
            ..Default::default()
        };
        state.update_frame_dimensions();

        *write_lock(&self.shared.calibration) = state;
        Ok(())
    }

    fn frame_layout(&self) -> StereoFrameLayout {
        read_lock(&self.shared.calibration).layout
    }

    fn distorted_frame_size(&self) -> FrameSize {
        read_lock(&self.shared.calibration).distorted
    }

    fn undistorted_frame_size(&self) -> FrameSize {
        read_lock(&self.shared.calibration).undistorted
    }

    fn eye_frame_size(&self) -> (u32, u32) {
        let calibration = read_lock(&self.shared.calibration);
        (calibration.frame_width, calibration.frame_height)
    }

    fn intrinsics(&self, eye: Eye) -> Intrinsics {
        let config = self.shared.config.snapshot();
        let calibration = read_lock(&self.shared.calibration);
        eye_intrinsics(
            &config.camera,
            eye,
            calibration.distorted.width,
            calibration.distorted.height,
        )
    }

    fn distortion_coefficients(&self) -> [f64; 16] {
        let config = self.shared.config.snapshot();
        let mut coeffs = [0.0; 16];
        coeffs[..4].copy_from_slice(&config.camera.camera_left.distortion);
        coeffs[8..12].copy_from_slice(&config.camera.camera_right.distortion);
        coeffs
    }

    fn left_to_right_transform(&self) -> Matrix4<f32> {
        read_lock(&self.shared.calibration).left_to_right
    }

    fn camera_projection(&self, eye: Eye, near_z: f32, far_z: f32) -> Result<Matrix4<f32>> {
        let calibration = read_lock(&self.shared.calibration);
        let (width, height) = (calibration.distorted.width, calibration.distorted.height);
        drop(calibration);

        // Unit-angle frustum with the frustum rows replaced from the
        // calibrated intrinsics.
        let fov = FieldOfView {
            angle_left: -1.0,
            angle_right: 1.0,
            angle_up: 1.0,
            angle_down: -1.0,
        };
        let mut projection = transform::projection_fov(&fov, near_z, far_z);

        let intrinsics = self.intrinsics(eye);
        projection[(0, 0)] = 2.0 * intrinsics.focal.x / width as f32;
        projection[(1, 1)] = 2.0 * intrinsics.focal.y / height as f32;
        projection[(0, 2)] = 1.0 - 2.0 * intrinsics.center.x / width as f32;
        projection[(1, 2)] = 1.0 - 2.0 * intrinsics.center.y / height as f32;

        Ok(projection)
    }

    fn uses_fisheye_model(&self) -> bool {
        self.shared.config.snapshot().camera.fisheye_lens
    }

    fn projection_origin_from_camera(&self) -> bool {
        true
    }

    fn average_acquisition_time_ms(&self) -> f32 {
        lock_mutex(&self.shared.acquisition_time).average_ms()
    }

    fn display_stats(&self) -> CameraDisplayStats {
        let video = lock_mutex(&self.shared.video);
        if video.is_open() {
            let (width, height) = video.frame_size();
            CameraDisplayStats {
                width,
                height,
                frame_rate: video.frame_rate(),
                api: format!("Video - {}", video.backend_name()),
            }
        } else {
            CameraDisplayStats {
                api: "Video - Inactive".to_string(),
                ..Default::default()
            }
        }
    }
}

fn serve_frames(shared: &ExternalShared) {
    let mut last_generation = shared.config.generation();
    let mut logged_failures = 0u32;

    while shared.run_thread.load(Ordering::Acquire) {
        if shared.paused.load(Ordering::Acquire) {
            std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
            continue;
        }

        let start = Instant::now();
        let mut grab_failed = false;
        let mut published = false;

        shared.frames.publish_with(|frame| {
            let config = shared.config.snapshot();

            let mut video = lock_mutex(&shared.video);
            if !video.is_open() {
                grab_failed = true;
                return false;
            }

            // Exposure settings may have changed mid-session.
            let generation = shared.config.generation();
            if generation != last_generation {
                last_generation = generation;
                apply_exposure(video.as_mut(), &config.camera);
            }

            if !video.grab() {
                logged_failures += 1;
                if logged_failures <= MAX_LOGGED_FAILURES {
                    warn!("video capture grab failed");
                }
                grab_failed = true;
                return false;
            }

            // Latency is approximated from when the grab returns.
            let delay_ticks = (config.camera.frame_delay_offset
                * shared.runtime.ticks_per_second() as f32) as u64;
            frame.exposure_time_ticks =
                shared.runtime.now_ticks().saturating_sub(delay_ticks);

            let device_to_tracking = if config.camera.use_tracked_device_pose {
                let serial = (!config.camera.tracked_device_serial.is_empty())
                    .then_some(config.camera.tracked_device_serial.as_str());
                match shared
                    .runtime
                    .device_pose(-config.camera.frame_delay_offset, serial)
                {
                    Ok(pose) => pose,
                    Err(err) => {
                        warn!(%err, "tracked device pose query failed");
                        Matrix4::identity()
                    }
                }
            } else {
                Matrix4::identity()
            };

            let mut buffer = match std::mem::take(&mut frame.payload) {
                FramePayload::Buffer(buffer) => buffer,
                _ => Vec::new(),
            };
            let retrieved = video.retrieve_bgra(&mut buffer);
            frame.payload = FramePayload::Buffer(buffer);
            if !retrieved {
                logged_failures += 1;
                if logged_failures <= MAX_LOGGED_FAILURES {
                    warn!("video capture retrieve failed");
                }
                grab_failed = true;
                return false;
            }

            let calibration = read_lock(&shared.calibration).clone();

            frame.sequence = shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            frame.width = calibration.distorted.width;
            frame.height = calibration.distorted.height;
            frame.bytes_per_pixel = 4;
            frame.layout = calibration.layout;

            if calibration.layout.is_stereo() {
                for eye in Eye::BOTH {
                    let mut pose = calibration.camera_to_head[eye.index()];
                    quirks::apply_depth_offset(&mut pose, config.main.depth_offset_calibration);
                    frame.camera_to_world[eye.index()] = device_to_tracking * pose;
                }
            } else {
                let camera_to_world = device_to_tracking * calibration.camera_to_head[0];
                frame.camera_to_world = [camera_to_world; 2];
            }

            frame.valid = true;
            published = true;
            true
        });

        if published {
            lock_mutex(&shared.acquisition_time).push(start.elapsed());
        } else if grab_failed {
            std::thread::sleep(FRAME_POLL_INTERVAL);
        }
    }
}
