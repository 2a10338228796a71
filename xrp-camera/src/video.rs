//! Trait seam over the webcam/video capture backend.

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
}

/// A grab/retrieve style video capture device. `grab` latches the newest
/// frame at the device's own cadence; `retrieve_bgra` converts and copies it.
pub trait VideoSource: Send {
    /// Open the device at `device_index`, optionally requesting a mode.
    /// Without a requested mode the backend should prioritize frame rate.
    fn open(&mut self, device_index: u32, mode: Option<VideoMode>) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn backend_name(&self) -> String;

    /// Dimensions of the delivered frames.
    fn frame_size(&self) -> (u32, u32);

    fn frame_rate(&self) -> f32;

    fn set_auto_exposure(&mut self, enabled: bool);

    fn set_exposure(&mut self, value: f32);

    /// Latch the most recent frame. Returns false on a failed capture.
    fn grab(&mut self) -> bool;

    /// Copy the latched frame into `out` as tightly packed BGRA, resizing
    /// the buffer as needed. Returns false if no frame could be decoded.
    fn retrieve_bgra(&mut self, out: &mut Vec<u8>) -> bool;
}
