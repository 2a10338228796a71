//! Camera acquisition and frame projection.
//!
//! Two providers deliver frames: [`DeviceCamera`] reads the tracked-device
//! camera through the [`runtime::TrackingRuntime`] service, and
//! [`ExternalCamera`] captures from a [`video::VideoSource`]. Both serve
//! frames from a background thread into a triple buffer. [`CameraManager`]
//! sits on top and computes the per-application-frame projection matrices.

pub mod device;
pub mod error;
pub mod external;
pub mod manager;
pub mod projection;
pub mod provider;
pub mod runtime;
pub mod video;

#[cfg(test)]
pub(crate) mod testing;

pub use device::DeviceCamera;
pub use error::{CameraError, Result};
pub use external::ExternalCamera;
pub use manager::CameraManager;
pub use projection::{
    AppProjectionLayer, DepthRange, EyeView, ReferenceSpace, ReferenceSpaceType,
};
pub use provider::{CameraDisplayStats, CameraProvider, NEAR_PROJECTION_DISTANCE};
