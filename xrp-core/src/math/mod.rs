pub mod homography;
pub mod transform;

pub use homography::{apply_homography, quad_to_quad};
pub use transform::FieldOfView;
