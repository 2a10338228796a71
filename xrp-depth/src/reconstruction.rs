//! The depth reconstruction thread: rectifies incoming stereo frames,
//! computes disparity, filters it and publishes depth frames for the
//! renderer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use nalgebra::{Matrix3, Matrix3x4, Matrix4};
use ndarray::Array2;
use tracing::{debug, info, warn};

use xrp_camera::provider::{
    CameraProvider, FRAME_POLL_INTERVAL, MAX_LOGGED_FAILURES, POSTFRAME_SLEEP_INTERVAL,
};
use xrp_core::config::{Config, DisparityFilter, StereoAlgorithm};
use xrp_core::frame::{TripleBuffer, lock_mutex, read_lock, write_lock};
use xrp_core::metrics::RollingAverage;
use xrp_core::{
    CameraFrame, ConfigStore, DepthFrame, Eye, ProjectionMode, StereoFrameLayout,
    UvDistortionParameters,
};

use crate::error::{DepthError, Result};
use crate::filter;
use crate::matching::{BlockMatcher, DisparityMap, SemiGlobalMatcher, StereoMatcher};
use crate::rectify::{self, CameraModel, Distortion, RectifyMap};

/// Owns the reconstruction thread. Depth frames come out of a triple buffer
/// and undistortion parameters are refreshed whenever the calibration or the
/// relevant settings change.
pub struct DepthReconstruction {
    shared: Arc<ReconShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ReconShared {
    config: Arc<ConfigStore>,
    camera: Arc<dyn CameraProvider>,
    frames: TripleBuffer<DepthFrame>,
    distortion: RwLock<UvDistortionParameters>,
    run_thread: AtomicBool,
    reconstruction_time: Mutex<RollingAverage>,
}

impl DepthReconstruction {
    pub fn new(camera: Arc<dyn CameraProvider>, config: Arc<ConfigStore>) -> Result<Self> {
        let shared = Arc::new(ReconShared {
            config,
            camera,
            frames: TripleBuffer::default(),
            distortion: RwLock::new(UvDistortionParameters::default()),
            run_thread: AtomicBool::new(true),
            reconstruction_time: Mutex::new(RollingAverage::default()),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("depth-recon".to_string())
                .spawn(move || reconstruction_loop(shared))
                .map_err(|e| DepthError::Thread(e.to_string()))?
        };
        info!("Depth reconstruction thread started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Most recent reconstructed depth frame, None before the first one.
    pub fn get_depth_frame(&self) -> Option<Arc<RwLock<DepthFrame>>> {
        self.shared.frames.acquire()
    }

    /// Current undistortion parameters. The UV map is empty until the
    /// pipeline has been built from camera calibration.
    pub fn distortion_parameters(&self) -> UvDistortionParameters {
        read_lock(&self.shared.distortion).clone()
    }

    pub fn average_reconstruction_time_ms(&self) -> f32 {
        lock_mutex(&self.shared.reconstruction_time).average_ms()
    }
}

impl Drop for DepthReconstruction {
    fn drop(&mut self) {
        self.shared.run_thread.store(false, Ordering::Release);
        if let Some(thread) = lock_mutex(&self.thread).take() {
            if thread.join().is_err() {
                warn!("Depth reconstruction thread panicked during shutdown");
            }
        }
    }
}

/// Everything derived from calibration and the reconstruction settings.
/// Rebuilt when the disparity range, downscale factor or field-of-view scale
/// changes, or when the camera texture dimensions stop matching.
struct Pipeline {
    layout: StereoFrameLayout,
    texture_width: u32,
    texture_height: u32,
    frame_width: u32,
    frame_height: u32,
    image_width: usize,
    image_height: usize,
    min_disparity: i32,
    max_disparity: i32,
    downscale_factor: u32,
    fov_scale: f32,
    left_map: RectifyMap,
    right_map: RectifyMap,
    rotation_inv: [Matrix4<f32>; 2],
    disparity_to_depth: Matrix4<f32>,
    prev_left: Vec<i16>,
    prev_right: Vec<i16>,
    last_sequence: u64,
}

impl Pipeline {
    fn build(
        camera: &dyn CameraProvider,
        config: &Config,
        distortion_out: &RwLock<UvDistortionParameters>,
    ) -> Result<Self> {
        let layout = camera.frame_layout();
        if !layout.is_stereo() {
            return Err(DepthError::Calibration(
                "depth reconstruction requires a stereo frame layout".to_string(),
            ));
        }

        let texture = camera.distorted_frame_size();
        let (frame_width, frame_height) = camera.eye_frame_size();
        if frame_width == 0 || frame_height == 0 {
            return Err(DepthError::Calibration(
                "camera reports an empty frame".to_string(),
            ));
        }

        let coefficients = camera.distortion_coefficients();
        let fisheye = camera.uses_fisheye_model();
        let model = |eye: Eye| {
            let slot = eye.index() * 8;
            let distortion = if fisheye {
                Distortion::Fisheye([
                    coefficients[slot],
                    coefficients[slot + 1],
                    coefficients[slot + 2],
                    coefficients[slot + 3],
                ])
            } else {
                Distortion::None
            };
            CameraModel::new(&camera.intrinsics(eye), distortion)
        };
        let left = model(Eye::Left);
        let right = model(Eye::Right);

        let fov_scale = config.main.field_of_view_scale;
        let rect = rectify::stereo_rectify(
            &left,
            &right,
            &camera.left_to_right_transform(),
            fov_scale,
        )?;

        let left_map =
            rectify::undistort_rectify_map(&left, &rect.r1, &rect.p1, frame_width, frame_height);
        let right_map =
            rectify::undistort_rectify_map(&right, &rect.r2, &rect.p2, frame_width, frame_height);

        // The renderer-facing undistortion map uses per-camera projections
        // without the stereo alignment rotation, so the sampled image stays
        // centered per eye.
        let left_projection = rectify::new_camera_projection(&left, frame_width, frame_height, fov_scale);
        let right_projection =
            rectify::new_camera_projection(&right, frame_width, frame_height, fov_scale);
        let identity = Matrix3::identity();
        let left_uv =
            rectify::undistort_rectify_map(&left, &identity, &left_projection, frame_width, frame_height);
        let right_uv = rectify::undistort_rectify_map(
            &right,
            &identity,
            &right_projection,
            frame_width,
            frame_height,
        );
        let uv_map = rectify::uv_distortion_map(
            &left_uv,
            Some(&right_uv),
            layout,
            texture.width,
            texture.height,
        );
        {
            let mut out = write_lock(distortion_out);
            *out = UvDistortionParameters {
                camera_projection: [
                    embed_projection(&left_projection),
                    embed_projection(&right_projection),
                ],
                rectified_rotation: [Matrix4::identity(); 2],
                uv_map,
                fov_scale,
            };
        }

        let downscale_factor = config.stereo.downscale_factor.max(1);
        let image_width = (frame_width / downscale_factor) as usize;
        let image_height = (frame_height / downscale_factor) as usize;
        if image_width == 0 || image_height == 0 {
            return Err(DepthError::Calibration(
                "downscale factor exceeds the frame size".to_string(),
            ));
        }

        debug!(
            frame_width,
            frame_height, downscale_factor, fov_scale, "Reconstruction pipeline rebuilt"
        );

        Ok(Self {
            layout,
            texture_width: texture.width,
            texture_height: texture.height,
            frame_width,
            frame_height,
            image_width,
            image_height,
            min_disparity: config.stereo.min_disparity,
            max_disparity: config.stereo.max_disparity,
            downscale_factor,
            fov_scale,
            left_map,
            right_map,
            rotation_inv: [
                embed_rotation(&rect.r1.transpose()),
                embed_rotation(&rect.r2.transpose()),
            ],
            disparity_to_depth: rect.q.map(|v| v as f32),
            prev_left: Vec::new(),
            prev_right: Vec::new(),
            last_sequence: 0,
        })
    }
}

fn embed_rotation(r: &Matrix3<f64>) -> Matrix4<f32> {
    let mut m = Matrix4::identity();
    for row in 0..3 {
        for col in 0..3 {
            m[(row, col)] = r[(row, col)] as f32;
        }
    }
    m
}

fn embed_projection(p: &Matrix3x4<f64>) -> Matrix4<f32> {
    let mut m = Matrix4::identity();
    for row in 0..3 {
        for col in 0..4 {
            m[(row, col)] = p[(row, col)] as f32;
        }
    }
    m
}

/// Per-frame data copied out while holding the camera frame read lock.
struct FrameViews {
    left: Array2<u8>,
    right: Array2<u8>,
    camera_to_world: [Matrix4<f32>; 2],
    sequence: u64,
}

enum Extraction {
    Skip,
    /// The camera texture no longer matches the pipeline.
    Stale,
    Views(Box<FrameViews>),
}

fn extract_views(frame: &CameraFrame, pipeline: &Pipeline, frame_skip: u32) -> Extraction {
    if !frame.valid || !frame.payload.has_buffer() || !frame.layout.is_stereo() {
        return Extraction::Skip;
    }
    if frame.width != pipeline.texture_width
        || frame.height != pipeline.texture_height
        || frame.layout != pipeline.layout
    {
        return Extraction::Stale;
    }
    if frame.sequence == pipeline.last_sequence
        || frame.sequence % (frame_skip as u64 + 1) != 0
    {
        return Extraction::Skip;
    }
    let Some(buffer) = frame.payload.buffer() else {
        return Extraction::Skip;
    };

    let eye_gray = |eye: Eye| {
        let offset = frame
            .layout
            .eye_frame_offset(eye, frame.width, frame.height);
        rectify::bgra_to_gray(
            buffer,
            frame.width,
            offset,
            pipeline.frame_width,
            pipeline.frame_height,
        )
    };

    Extraction::Views(Box::new(FrameViews {
        left: eye_gray(Eye::Left),
        right: eye_gray(Eye::Right),
        camera_to_world: frame.camera_to_world,
        sequence: frame.sequence,
    }))
}

fn build_matcher(config: &Config) -> Box<dyn StereoMatcher> {
    let stereo = &config.stereo;
    match stereo.algorithm {
        StereoAlgorithm::BlockMatching => Box::new(BlockMatcher {
            block_size: stereo.block_size.max(1) as usize,
            min_disparity: stereo.min_disparity,
            max_disparity: stereo.max_disparity,
            uniqueness_ratio: stereo.uniqueness_ratio,
        }),
        StereoAlgorithm::SemiGlobal => Box::new(SemiGlobalMatcher {
            block_size: stereo.block_size.max(1) as usize,
            min_disparity: stereo.min_disparity,
            max_disparity: stereo.max_disparity,
            uniqueness_ratio: stereo.uniqueness_ratio,
            penalty_small: stereo.smoothing_penalty_small,
            penalty_large: stereo.smoothing_penalty_large,
        }),
    }
}

fn apply_filters(config: &Config, disparity: &mut DisparityMap, guide: &Array2<u8>) {
    let stereo = &config.stereo;
    if stereo.speckle_window_size > 0 {
        filter::speckle_filter(disparity, stereo.speckle_window_size, stereo.speckle_range);
    }
    match stereo.filter {
        DisparityFilter::None => {}
        DisparityFilter::Smoothing => {
            filter::smooth_disparity(disparity, guide, stereo.wls_lambda, stereo.wls_sigma);
        }
        DisparityFilter::Bilateral => {
            filter::bilateral_smooth(
                disparity,
                guide,
                stereo.fbs_spatial,
                stereo.fbs_luma,
                stereo.fbs_iterations,
            );
        }
        DisparityFilter::Both => {
            filter::smooth_disparity(disparity, guide, stereo.wls_lambda, stereo.wls_sigma);
            filter::bilateral_smooth(
                disparity,
                guide,
                stereo.fbs_spatial,
                stereo.fbs_luma,
                stereo.fbs_iterations,
            );
        }
    }
}

fn process_frame(shared: &ReconShared, pipeline: &mut Pipeline, config: &Config, views: FrameViews) {
    let start = Instant::now();
    let bilinear = config.stereo.rectification_filtering;

    let left_rect = rectify::remap(&views.left, &pipeline.left_map, bilinear);
    let right_rect = rectify::remap(&views.right, &pipeline.right_map, bilinear);
    let left_img = rectify::downscale(&left_rect, pipeline.downscale_factor);
    let right_img = rectify::downscale(&right_rect, pipeline.downscale_factor);

    let matcher = build_matcher(config);
    let mut left_disparity = matcher.compute(&left_img, &right_img);
    let mut right_disparity = if config.stereo.disparity_both_eyes {
        matcher.compute_right(&left_img, &right_img)
    } else {
        left_disparity.clone()
    };

    apply_filters(config, &mut left_disparity, &left_img);
    apply_filters(config, &mut right_disparity, &right_img);

    if config.stereo.temporal_filtering {
        let strength = config.stereo.temporal_filtering_strength;
        let rejection = config.stereo.temporal_rejection_distance;
        filter::temporal_blend(&mut left_disparity, &pipeline.prev_left, strength, rejection);
        filter::temporal_blend(&mut right_disparity, &pipeline.prev_right, strength, rejection);
    }
    pipeline.prev_left = left_disparity.data.clone();
    pipeline.prev_right = right_disparity.data.clone();

    let pixel_count = pipeline.image_width * pipeline.image_height;
    shared.frames.publish_with(|depth| {
        depth.disparity.clear();
        depth.disparity.reserve(pixel_count);
        for (&l, &r) in left_disparity.data.iter().zip(right_disparity.data.iter()) {
            depth
                .disparity
                .push((l as u16 as u32) | ((r as u16 as u32) << 16));
        }
        depth.width = pipeline.image_width as u32;
        depth.height = pipeline.image_height as u32;
        depth.min_disparity = pipeline.min_disparity;
        depth.max_disparity = pipeline.max_disparity;
        depth.downscale_factor = pipeline.downscale_factor;
        depth.disparity_to_depth = pipeline.disparity_to_depth;
        for i in 0..2 {
            depth.disparity_view_to_world[i] =
                views.camera_to_world[i] * pipeline.rotation_inv[i];
        }
        depth.valid = true;
        depth.first_render = true;
        true
    });

    pipeline.last_sequence = views.sequence;
    lock_mutex(&shared.reconstruction_time).push(start.elapsed());
}

fn reconstruction_loop(shared: Arc<ReconShared>) {
    let mut pipeline: Option<Pipeline> = None;
    let mut build_failures = 0u32;

    while shared.run_thread.load(Ordering::Acquire) {
        std::thread::sleep(FRAME_POLL_INTERVAL);
        let config = shared.config.snapshot();

        let needs_rebuild = match &pipeline {
            None => true,
            Some(p) => {
                p.max_disparity != config.stereo.max_disparity
                    || p.min_disparity != config.stereo.min_disparity
                    || p.downscale_factor != config.stereo.downscale_factor.max(1)
                    || p.fov_scale != config.main.field_of_view_scale
            }
        };
        if needs_rebuild {
            if !shared.camera.is_initialized() {
                std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
                continue;
            }
            match Pipeline::build(shared.camera.as_ref(), &config, &shared.distortion) {
                Ok(built) => {
                    pipeline = Some(built);
                    build_failures = 0;
                }
                Err(err) => {
                    if build_failures < MAX_LOGGED_FAILURES {
                        warn!("Failed to build reconstruction pipeline: {err}");
                        build_failures += 1;
                    }
                    pipeline = None;
                    std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
                    continue;
                }
            }
        }

        if config.main.projection_mode != ProjectionMode::StereoReconstruction
            || config.stereo.frozen
        {
            std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
            continue;
        }

        let Some(active) = pipeline.as_mut() else {
            std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
            continue;
        };
        let Some(frame) = shared.camera.get_camera_frame() else {
            std::thread::sleep(POSTFRAME_SLEEP_INTERVAL);
            continue;
        };

        let extraction = {
            let frame = read_lock(&frame);
            extract_views(&frame, active, config.stereo.frame_skip)
        };
        match extraction {
            Extraction::Skip => std::thread::sleep(POSTFRAME_SLEEP_INTERVAL),
            Extraction::Stale => {
                pipeline = None;
            }
            Extraction::Views(views) => process_frame(&shared, active, &config, *views),
        }
    }
}
