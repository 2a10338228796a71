//! Scripted collaborators for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use nalgebra::Matrix4;

use xrp_core::math::transform::{self, FieldOfView};
use xrp_core::{Intrinsics, StereoFrameLayout};

use crate::error::Result;
use crate::runtime::{
    FrameHeader, FrameSize, RuntimeError, StreamHandle, TrackedFrameType, TrackingRuntime,
};
use crate::video::{VideoMode, VideoSource};

/// Tracking service stand-in. Every header query hands out a new frame
/// sequence so acquisition loops never stall.
pub(crate) struct MockRuntime {
    has_camera: bool,
    layout: StereoFrameLayout,
    distorted: Mutex<FrameSize>,
    undistorted: Mutex<FrameSize>,
    poses: Mutex<[Matrix4<f32>; 2]>,
    sequence: AtomicU64,
    acquired: AtomicU32,
    released: AtomicU32,
    fail_headers: AtomicBool,
    header_polls: AtomicU64,
    start: Instant,
}

impl MockRuntime {
    fn new(layout: StereoFrameLayout, width: u32, height: u32) -> Self {
        let size = FrameSize {
            width,
            height,
            buffer_size: width * height * 4,
        };
        Self {
            has_camera: true,
            layout,
            distorted: Mutex::new(size),
            undistorted: Mutex::new(size),
            poses: Mutex::new([Matrix4::identity(); 2]),
            sequence: AtomicU64::new(0),
            acquired: AtomicU32::new(0),
            released: AtomicU32::new(0),
            fail_headers: AtomicBool::new(false),
            header_polls: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub(crate) fn mono_640x480() -> Self {
        Self::new(StereoFrameLayout::Mono, 640, 480)
    }

    pub(crate) fn horizontal_stereo() -> Self {
        Self::new(StereoFrameLayout::StereoHorizontal, 1280, 480)
    }

    pub(crate) fn vertical_stereo() -> Self {
        Self::new(StereoFrameLayout::StereoVertical, 640, 960)
    }

    pub(crate) fn without_camera() -> Self {
        let mut runtime = Self::mono_640x480();
        runtime.has_camera = false;
        runtime
    }

    pub(crate) fn set_frame_size(&self, width: u32, height: u32, buffer_size: u32) {
        *self.distorted.lock().unwrap() = FrameSize {
            width,
            height,
            buffer_size,
        };
    }

    pub(crate) fn set_camera_poses(&self, poses: [Matrix4<f32>; 2]) {
        *self.poses.lock().unwrap() = poses;
    }

    pub(crate) fn streams_acquired(&self) -> u32 {
        self.acquired.load(Ordering::Acquire)
    }

    pub(crate) fn streams_released(&self) -> u32 {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn fail_frame_headers(&self, fail: bool) {
        self.fail_headers.store(fail, Ordering::Release);
    }

    pub(crate) fn header_polls(&self) -> u64 {
        self.header_polls.load(Ordering::Acquire)
    }
}

impl TrackingRuntime for MockRuntime {
    fn hmd_device_id(&self) -> Option<u32> {
        Some(0)
    }

    fn has_camera(&self, _device: u32) -> std::result::Result<bool, RuntimeError> {
        Ok(self.has_camera)
    }

    fn frame_layout(&self, _device: u32) -> std::result::Result<StereoFrameLayout, RuntimeError> {
        Ok(self.layout)
    }

    fn frame_size(
        &self,
        _device: u32,
        frame_type: TrackedFrameType,
    ) -> std::result::Result<FrameSize, RuntimeError> {
        Ok(match frame_type {
            TrackedFrameType::Distorted => *self.distorted.lock().unwrap(),
            TrackedFrameType::MaximumUndistorted => *self.undistorted.lock().unwrap(),
        })
    }

    fn camera_intrinsics(
        &self,
        _device: u32,
        _camera_index: u32,
    ) -> std::result::Result<Intrinsics, RuntimeError> {
        let size = *self.undistorted.lock().unwrap();
        let (width, height) = self.layout.eye_frame_size(size.width, size.height);
        Ok(Intrinsics::new(
            width as f32 / 2.0,
            width as f32 / 2.0,
            width as f32 / 2.0,
            height as f32 / 2.0,
        ))
    }

    fn camera_projection(
        &self,
        device: u32,
        camera_index: u32,
        near_z: f32,
        far_z: f32,
    ) -> std::result::Result<Matrix4<f32>, RuntimeError> {
        let intrinsics = self.camera_intrinsics(device, camera_index)?;
        let size = *self.undistorted.lock().unwrap();
        let (width, height) = self.layout.eye_frame_size(size.width, size.height);

        let fov = FieldOfView {
            angle_left: -1.0,
            angle_right: 1.0,
            angle_up: 1.0,
            angle_down: -1.0,
        };
        let mut projection = transform::projection_fov(&fov, near_z, far_z);
        projection[(0, 0)] = 2.0 * intrinsics.focal.x / width as f32;
        projection[(1, 1)] = 2.0 * intrinsics.focal.y / height as f32;
        projection[(0, 2)] = 1.0 - 2.0 * intrinsics.center.x / width as f32;
        projection[(1, 2)] = 1.0 - 2.0 * intrinsics.center.y / height as f32;
        Ok(projection)
    }

    fn distortion_coefficients(&self, _device: u32) -> std::result::Result<[f64; 16], RuntimeError> {
        Ok([0.0; 16])
    }

    fn camera_to_head_poses(
        &self,
        _device: u32,
    ) -> std::result::Result<[Matrix4<f32>; 2], RuntimeError> {
        Ok(*self.poses.lock().unwrap())
    }

    fn acquire_stream(&self, _device: u32) -> std::result::Result<StreamHandle, RuntimeError> {
        self.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(1)
    }

    fn release_stream(&self, _handle: StreamHandle) -> std::result::Result<(), RuntimeError> {
        self.released.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn frame_header(
        &self,
        _handle: StreamHandle,
        _frame_type: TrackedFrameType,
    ) -> std::result::Result<FrameHeader, RuntimeError> {
        self.header_polls.fetch_add(1, Ordering::AcqRel);
        if self.fail_headers.load(Ordering::Acquire) {
            return Err(RuntimeError::Stream("header read failed".to_string()));
        }
        let size = *self.distorted.lock().unwrap();
        Ok(FrameHeader {
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel) + 1,
            width: size.width,
            height: size.height,
            bytes_per_pixel: 4,
            exposure_time_ticks: self.now_ticks(),
            device_to_tracking: transform::translation(0.0, 1.6, 0.0),
        })
    }

    fn copy_frame_buffer(
        &self,
        _handle: StreamHandle,
        _frame_type: TrackedFrameType,
        out: &mut [u8],
    ) -> std::result::Result<(), RuntimeError> {
        out.fill(0x80);
        Ok(())
    }

    fn acquire_frame_texture(
        &self,
        _handle: StreamHandle,
        _frame_type: TrackedFrameType,
    ) -> std::result::Result<u64, RuntimeError> {
        Ok(0xC0FFEE)
    }

    fn device_pose(
        &self,
        _seconds_from_now: f32,
        _serial: Option<&str>,
    ) -> std::result::Result<Matrix4<f32>, RuntimeError> {
        Ok(transform::translation(0.0, 1.6, 0.0))
    }

    fn seated_to_standing_pose(&self) -> Matrix4<f32> {
        transform::translation(0.0, 1.2, 0.0)
    }

    fn ticks_per_second(&self) -> u64 {
        10_000_000
    }

    fn now_ticks(&self) -> u64 {
        (self.start.elapsed().as_secs_f64() * self.ticks_per_second() as f64) as u64
    }
}

/// Grab/retrieve video source stand-in delivering flat gray frames.
pub(crate) struct MockVideo {
    width: u32,
    height: u32,
    open: AtomicBool,
    fail_grab: AtomicBool,
    grabs: AtomicU64,
}

impl MockVideo {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            open: AtomicBool::new(false),
            fail_grab: AtomicBool::new(false),
            grabs: AtomicU64::new(0),
        }
    }

    pub(crate) fn fail_grabs(&self, fail: bool) {
        self.fail_grab.store(fail, Ordering::Release);
    }
}

impl VideoSource for MockVideo {
    fn open(&mut self, _device_index: u32, _mode: Option<VideoMode>) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn backend_name(&self) -> String {
        "mock".to_string()
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_rate(&self) -> f32 {
        30.0
    }

    fn set_auto_exposure(&mut self, _enabled: bool) {}

    fn set_exposure(&mut self, _value: f32) {}

    fn grab(&mut self) -> bool {
        if self.fail_grab.load(Ordering::Acquire) {
            return false;
        }
        self.grabs.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn retrieve_bgra(&mut self, out: &mut Vec<u8>) -> bool {
        out.resize((self.width * self.height * 4) as usize, 0x80);
        true
    }
}
