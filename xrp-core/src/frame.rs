//! Frame data model and the producer/consumer frame exchange.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::camera::StereoFrameLayout;

/// Pixel payload of a camera frame.
#[derive(Debug, Clone, Default)]
pub enum FramePayload {
    #[default]
    Empty,
    /// Shared GPU texture handle owned by the video service.
    Texture(u64),
    /// Raw pixel buffer, BGRA with 8 bits per channel.
    Buffer(Vec<u8>),
}

impl FramePayload {
    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            FramePayload::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn has_buffer(&self) -> bool {
        matches!(self, FramePayload::Buffer(_))
    }
}

/// One camera frame with the matrices the renderer consumes.
///
/// All per-eye arrays are indexed by `Eye::index()`. For mono layouts both
/// entries hold the same values.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub sequence: u64,
    /// Exposure timestamp in runtime clock ticks.
    pub exposure_time_ticks: u64,
    /// Full texture dimensions; for stereo layouts this spans both views.
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub layout: StereoFrameLayout,
    pub payload: FramePayload,

    pub camera_to_world: [Matrix4<f32>; 2],
    pub world_to_camera_clip: [Matrix4<f32>; 2],
    pub camera_clip_to_world: [Matrix4<f32>; 2],
    pub prev_world_to_camera_clip: [Matrix4<f32>; 2],
    pub prev_camera_clip_to_world: [Matrix4<f32>; 2],
    pub world_to_hmd_clip: [Matrix4<f32>; 2],
    pub prev_world_to_hmd_clip: [Matrix4<f32>; 2],
    pub projection_origin_world: [Vector3<f32>; 2],
    /// Frame-quad homography used by the planar projection modes.
    pub frame_uv_homography: [Matrix3<f32>; 2],

    pub valid: bool,
    pub first_render: bool,
    pub has_reversed_depth: bool,
    pub rendering_mirrored: bool,
}

impl Default for CameraFrame {
    fn default() -> Self {
        Self {
            sequence: 0,
            exposure_time_ticks: 0,
            width: 0,
            height: 0,
            bytes_per_pixel: 0,
            layout: StereoFrameLayout::default(),
            payload: FramePayload::Empty,
            camera_to_world: [Matrix4::identity(); 2],
            world_to_camera_clip: [Matrix4::identity(); 2],
            camera_clip_to_world: [Matrix4::identity(); 2],
            prev_world_to_camera_clip: [Matrix4::identity(); 2],
            prev_camera_clip_to_world: [Matrix4::identity(); 2],
            world_to_hmd_clip: [Matrix4::identity(); 2],
            prev_world_to_hmd_clip: [Matrix4::identity(); 2],
            projection_origin_world: [Vector3::zeros(); 2],
            frame_uv_homography: [Matrix3::identity(); 2],
            valid: false,
            first_render: false,
            has_reversed_depth: false,
            rendering_mirrored: false,
        }
    }
}

/// Reconstructed disparity published by the depth pipeline.
///
/// Each pixel packs two 16-bit fixed-point disparities (4 fractional bits):
/// the left eye in the low half and the right eye in the high half.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub disparity: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub downscale_factor: u32,
    pub disparity_to_depth: Matrix4<f32>,
    pub disparity_view_to_world: [Matrix4<f32>; 2],
    pub prev_disparity_view_to_world: [Matrix4<f32>; 2],
    pub prev_world_to_camera_clip: [Matrix4<f32>; 2],
    pub valid: bool,
    pub first_render: bool,
}

impl Default for DepthFrame {
    fn default() -> Self {
        Self {
            disparity: Vec::new(),
            width: 0,
            height: 0,
            min_disparity: 0,
            max_disparity: 0,
            downscale_factor: 1,
            disparity_to_depth: Matrix4::identity(),
            disparity_view_to_world: [Matrix4::identity(); 2],
            prev_disparity_view_to_world: [Matrix4::identity(); 2],
            prev_world_to_camera_clip: [Matrix4::identity(); 2],
            valid: false,
            first_render: false,
        }
    }
}

/// Undistortion parameters handed to the renderer. Rebuilt only when the
/// calibration or the field-of-view scale changes.
#[derive(Debug, Clone)]
pub struct UvDistortionParameters {
    pub camera_projection: [Matrix4<f32>; 2],
    pub rectified_rotation: [Matrix4<f32>; 2],
    /// Two floats per pixel of the full camera texture, normalized source UVs.
    pub uv_map: Vec<f32>,
    pub fov_scale: f32,
}

impl Default for UvDistortionParameters {
    fn default() -> Self {
        Self {
            camera_projection: [Matrix4::identity(); 2],
            rectified_rotation: [Matrix4::identity(); 2],
            uv_map: Vec::new(),
            fov_scale: 1.0,
        }
    }
}

pub fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Slot<T> {
    frame: Arc<RwLock<T>>,
    fresh: bool,
}

/// Three-slot frame exchange between one producer and one consumer.
///
/// The producer fills its private slot while holding only that frame's write
/// lock, then swaps it into the shared slot under a briefly held mutex. The
/// consumer swaps the shared slot into its own slot when the mutex is free
/// and otherwise keeps serving the frame it already holds, so neither side
/// ever blocks on the other's work.
pub struct TripleBuffer<T> {
    shared: Mutex<Slot<T>>,
    write: Mutex<Arc<RwLock<T>>>,
    read: Mutex<Slot<T>>,
}

impl<T: Default> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T> TripleBuffer<T> {
    pub fn new(mut make: impl FnMut() -> T) -> Self {
        Self {
            shared: Mutex::new(Slot {
                frame: Arc::new(RwLock::new(make())),
                fresh: false,
            }),
            write: Mutex::new(Arc::new(RwLock::new(make()))),
            read: Mutex::new(Slot {
                frame: Arc::new(RwLock::new(make())),
                fresh: false,
            }),
        }
    }

    /// Fill the write slot and publish it. Acquiring the write lock waits
    /// until the last consumer of the recycled frame has dropped its guard.
    /// The closure returns false to abandon the frame without publishing.
    pub fn publish_with(&self, fill: impl FnOnce(&mut T) -> bool) {
        let mut write_slot = lock_mutex(&self.write);
        let publish = {
            let mut frame = write_lock(&write_slot);
            fill(&mut frame)
        };
        if publish {
            let mut shared = lock_mutex(&self.shared);
            std::mem::swap(&mut shared.frame, &mut *write_slot);
            shared.fresh = true;
        }
    }

    /// Most recent published frame without blocking on the producer. While a
    /// publication is in flight this returns the previously acquired frame,
    /// and None when nothing has been published yet.
    pub fn acquire(&self) -> Option<Arc<RwLock<T>>> {
        let mut read_slot = lock_mutex(&self.read);
        if let Ok(mut shared) = self.shared.try_lock() {
            if shared.fresh {
                std::mem::swap(&mut shared.frame, &mut read_slot.frame);
                shared.fresh = false;
                read_slot.fresh = true;
            }
        }
        if read_slot.fresh {
            Some(read_slot.frame.clone())
        } else {
            None
        }
    }
}
