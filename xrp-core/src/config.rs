//! Configuration snapshot types shared by the pipeline threads.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::camera::{CalibrationRecord, StereoFrameLayout};
use crate::frame::{read_lock, write_lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectionMode {
    /// Planar projection at a fixed distance.
    #[default]
    RoomView2d,
    /// Per-pixel reprojection from reconstructed depth.
    StereoReconstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StereoAlgorithm {
    #[default]
    BlockMatching,
    SemiGlobal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisparityFilter {
    None,
    #[default]
    Smoothing,
    Bilateral,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainConfig {
    pub projection_mode: ProjectionMode,
    /// Distance of the planar projection surface, meters.
    pub projection_distance_far: f32,
    pub field_of_view_scale: f32,
    /// Multiplier on camera translation, tuned by the user to line up depth.
    pub depth_offset_calibration: f32,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            projection_mode: ProjectionMode::default(),
            projection_distance_far: 10.0,
            field_of_view_scale: 0.9,
            depth_offset_calibration: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Index of the external video device.
    pub device_index: u32,
    /// Sample the pose of a tracked device instead of the head.
    pub use_tracked_device_pose: bool,
    pub tracked_device_serial: String,
    pub request_custom_frame_size: bool,
    pub custom_frame_width: u32,
    pub custom_frame_height: u32,
    pub custom_frame_rate: f32,
    /// Seconds between exposure and delivery, used to sample the pose the
    /// frame was actually captured at.
    pub frame_delay_offset: f32,
    pub auto_exposure: bool,
    pub exposure_value: f32,
    pub use_custom_calibration: bool,
    pub fisheye_lens: bool,
    /// Layout of external camera textures; tracked cameras report their own.
    pub frame_layout: StereoFrameLayout,
    pub camera_left: CalibrationRecord,
    pub camera_right: CalibrationRecord,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            use_tracked_device_pose: false,
            tracked_device_serial: String::new(),
            request_custom_frame_size: false,
            custom_frame_width: 0,
            custom_frame_height: 0,
            custom_frame_rate: 0.0,
            frame_delay_offset: 0.0,
            auto_exposure: true,
            exposure_value: -8.0,
            use_custom_calibration: false,
            fisheye_lens: true,
            frame_layout: StereoFrameLayout::Mono,
            camera_left: CalibrationRecord::default(),
            camera_right: CalibrationRecord::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    /// Process every (n+1)th camera frame.
    pub frame_skip: u32,
    pub downscale_factor: u32,
    /// Compute a separate right-eye disparity instead of mirroring the left.
    pub disparity_both_eyes: bool,
    pub algorithm: StereoAlgorithm,
    /// Half-width of the matching window.
    pub block_size: u32,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub smoothing_penalty_small: i32,
    pub smoothing_penalty_large: i32,
    pub max_disparity_difference: i32,
    pub pre_filter_cap: i32,
    pub uniqueness_ratio: i32,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    pub filter: DisparityFilter,
    pub wls_lambda: f32,
    pub wls_sigma: f32,
    pub fbs_spatial: f32,
    pub fbs_luma: f32,
    pub fbs_chroma: f32,
    pub fbs_lambda: f32,
    pub fbs_iterations: u32,
    pub temporal_filtering: bool,
    pub temporal_filtering_strength: f32,
    /// Disparity delta above which the previous frame is rejected.
    pub temporal_rejection_distance: f32,
    /// Bilinear instead of nearest sampling during rectification.
    pub rectification_filtering: bool,
    /// Keep serving the last reconstructed frame without computing new ones.
    pub frozen: bool,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            frame_skip: 0,
            downscale_factor: 2,
            disparity_both_eyes: true,
            algorithm: StereoAlgorithm::default(),
            block_size: 1,
            min_disparity: 0,
            max_disparity: 96,
            smoothing_penalty_small: 200,
            smoothing_penalty_large: 220,
            max_disparity_difference: 3,
            pre_filter_cap: 4,
            uniqueness_ratio: 4,
            speckle_window_size: 80,
            speckle_range: 1,
            filter: DisparityFilter::default(),
            wls_lambda: 8000.0,
            wls_sigma: 1.8,
            fbs_spatial: 6.0,
            fbs_luma: 8.0,
            fbs_chroma: 8.0,
            fbs_lambda: 128.0,
            fbs_iterations: 11,
            temporal_filtering: true,
            temporal_filtering_strength: 0.9,
            temporal_rejection_distance: 1.0,
            rectification_filtering: false,
            frozen: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub main: MainConfig,
    pub camera: CameraConfig,
    pub stereo: StereoConfig,
}

/// Shared configuration with consistent snapshots.
///
/// Long-running threads read one snapshot per cycle and compare the
/// generation counter to detect mid-session changes.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: RwLock<Config>,
    generation: AtomicU64,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(config),
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Config {
        read_lock(&self.inner).clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn update(&self, apply: impl FnOnce(&mut Config)) {
        let mut config = write_lock(&self.inner);
        apply(&mut config);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
