//! Stereo rectification: lens models, rectification matrices, pixel remap
//! tables and the undistortion UV map served to the renderer.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3};
use ndarray::Array2;

use xrp_core::{Eye, Intrinsics, StereoFrameLayout};

use crate::error::{DepthError, Result};

/// Lens distortion applied on normalized image coordinates.
#[derive(Debug, Clone)]
pub enum Distortion {
    None,
    /// Equidistant fisheye with coefficients k1..k4.
    Fisheye([f64; 4]),
}

#[derive(Debug, Clone)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
}

impl CameraModel {
    pub fn new(intrinsics: &Intrinsics, distortion: Distortion) -> Self {
        Self {
            fx: intrinsics.focal.x as f64,
            fy: intrinsics.focal.y as f64,
            cx: intrinsics.center.x as f64,
            cy: intrinsics.center.y as f64,
            distortion,
        }
    }

    /// Apply distortion to normalized image coordinates.
    pub fn distort(&self, x_norm: f64, y_norm: f64) -> (f64, f64) {
        match self.distortion {
            Distortion::None => (x_norm, y_norm),
            Distortion::Fisheye([k1, k2, k3, k4]) => {
                let r = (x_norm * x_norm + y_norm * y_norm).sqrt();
                if r < 1e-8 {
                    return (x_norm, y_norm);
                }

                let theta = r.atan();
                let theta2 = theta * theta;
                let theta4 = theta2 * theta2;
                let theta6 = theta4 * theta2;
                let theta8 = theta4 * theta4;

                let theta_d =
                    theta * (1.0 + k1 * theta2 + k2 * theta4 + k3 * theta6 + k4 * theta8);
                let scale = theta_d / r;

                (x_norm * scale, y_norm * scale)
            }
        }
    }

    /// Remove distortion with Newton-Raphson iteration on a finite-difference
    /// Jacobian.
    pub fn undistort(&self, x_dist: f64, y_dist: f64) -> Result<(f64, f64)> {
        if matches!(self.distortion, Distortion::None) {
            return Ok((x_dist, y_dist));
        }

        let mut x = x_dist;
        let mut y = y_dist;

        for _ in 0..10 {
            let (fx, fy) = self.distort(x, y);
            let rx = x_dist - fx;
            let ry = y_dist - fy;

            if rx.abs() < 1e-8 && ry.abs() < 1e-8 {
                return Ok((x, y));
            }

            let eps = 1e-6;
            let (fx_x, fy_x) = self.distort(x + eps, y);
            let (fx_y, fy_y) = self.distort(x, y + eps);

            let j11 = (fx_x - fx) / eps;
            let j21 = (fy_x - fy) / eps;
            let j12 = (fx_y - fx) / eps;
            let j22 = (fy_y - fy) / eps;

            let det = j11 * j22 - j12 * j21;
            if det.abs() < 1e-18 {
                return Err(DepthError::NonConvergent);
            }

            x += (j22 * rx - j12 * ry) / det;
            y += (-j21 * rx + j11 * ry) / det;
        }

        Err(DepthError::NonConvergent)
    }
}

/// Rectification output: per-camera rotations, rectified projections and the
/// disparity-to-depth reprojection matrix.
#[derive(Debug, Clone)]
pub struct StereoRectification {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
}

/// Rectification matrices for a calibrated stereo pair.
///
/// `left_to_right` maps left-camera coordinates onto right-camera
/// coordinates. `fov_scale` divides the rectified focal length, widening the
/// rectified field of view below 1.0.
pub fn stereo_rectify(
    left: &CameraModel,
    right: &CameraModel,
    left_to_right: &Matrix4<f32>,
    fov_scale: f32,
) -> Result<StereoRectification> {
    let r = left_to_right.fixed_view::<3, 3>(0, 0).map(|v| v as f64);
    let t = Vector3::new(
        left_to_right[(0, 3)] as f64,
        left_to_right[(1, 3)] as f64,
        left_to_right[(2, 3)] as f64,
    );

    // Right camera position in left-camera coordinates.
    let center = -(r.transpose() * t);
    let baseline = center.norm();
    if baseline <= 1e-9 {
        return Err(DepthError::Calibration(
            "stereo rectification requires a non-zero baseline".to_string(),
        ));
    }

    // Rectified x axis along the positive baseline direction.
    let mut ex = center / baseline;
    if ex[0] < 0.0 {
        ex = -ex;
    }
    let helper = if ex[2].abs() < 0.9 {
        Vector3::new(0.0, 0.0, 1.0)
    } else {
        Vector3::new(0.0, 1.0, 0.0)
    };
    let ey = helper.cross(&ex).normalize();
    let ez = ex.cross(&ey).normalize();
    let r_rect = Matrix3::from_columns(&[ex, ey, ez]).transpose();

    let r1 = r_rect;
    let r2 = r_rect * r.transpose();

    let scale = 1.0 / fov_scale.max(1e-3) as f64;
    let fx = 0.5 * (left.fx + right.fx) * scale;
    let fy = 0.5 * (left.fy + right.fy) * scale;
    let cx = 0.5 * (left.cx + right.cx);
    let cy = 0.5 * (left.cy + right.cy);
    let tx = -fx * baseline;

    let p1 = Matrix3x4::new(
        fx, 0.0, cx, 0.0, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let p2 = Matrix3x4::new(
        fx, 0.0, cx, tx, //
        0.0, fy, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );

    let mut q = Matrix4::<f64>::zeros();
    q[(0, 0)] = 1.0;
    q[(0, 3)] = -cx;
    q[(1, 1)] = 1.0;
    q[(1, 3)] = -cy;
    q[(2, 3)] = fx;
    q[(3, 2)] = -1.0 / tx;

    Ok(StereoRectification { r1, r2, p1, p2, q })
}

/// Rectified projection for a single camera without the stereo alignment,
/// used by the renderer-facing undistortion map.
pub fn new_camera_projection(
    model: &CameraModel,
    width: u32,
    height: u32,
    fov_scale: f32,
) -> Matrix3x4<f64> {
    let f = 0.5 * (model.fx + model.fy) / fov_scale.max(1e-3) as f64;
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    Matrix3x4::new(
        f, 0.0, cx, 0.0, //
        0.0, f, cy, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Per-pixel source coordinates for rectifying one camera view. Pixels whose
/// ray leaves the valid hemisphere map to -1 and sample the border.
#[derive(Debug, Clone)]
pub struct RectifyMap {
    pub map_x: Array2<f32>,
    pub map_y: Array2<f32>,
}

pub fn undistort_rectify_map(
    model: &CameraModel,
    rotation: &Matrix3<f64>,
    projection: &Matrix3x4<f64>,
    width: u32,
    height: u32,
) -> RectifyMap {
    let shape = (height as usize, width as usize);
    let mut map_x = Array2::<f32>::zeros(shape);
    let mut map_y = Array2::<f32>::zeros(shape);

    let r_inv = rotation.transpose();
    let fx = projection[(0, 0)];
    let fy = projection[(1, 1)];
    let cx = projection[(0, 2)];
    let cy = projection[(1, 2)];

    for v in 0..shape.0 {
        for u in 0..shape.1 {
            let x = (u as f64 - cx) / fx;
            let y = (v as f64 - cy) / fy;
            let ray = r_inv * Vector3::new(x, y, 1.0);
            if ray.z <= 1e-6 {
                map_x[(v, u)] = -1.0;
                map_y[(v, u)] = -1.0;
                continue;
            }

            let (xd, yd) = model.distort(ray.x / ray.z, ray.y / ray.z);
            map_x[(v, u)] = (model.fx * xd + model.cx) as f32;
            map_y[(v, u)] = (model.fy * yd + model.cy) as f32;
        }
    }

    RectifyMap { map_x, map_y }
}

/// Sample `src` through the map. Out-of-bounds sources read as black.
pub fn remap(src: &Array2<u8>, map: &RectifyMap, bilinear: bool) -> Array2<u8> {
    let (height, width) = map.map_x.dim();
    let (src_h, src_w) = src.dim();

    Array2::from_shape_fn((height, width), |(v, u)| {
        let sx = map.map_x[(v, u)];
        let sy = map.map_y[(v, u)];
        if sx < 0.0 || sy < 0.0 {
            return 0;
        }

        if bilinear {
            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            if x0 + 1 >= src_w || y0 + 1 >= src_h {
                return 0;
            }
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;
            let p00 = src[(y0, x0)] as f32;
            let p01 = src[(y0, x0 + 1)] as f32;
            let p10 = src[(y0 + 1, x0)] as f32;
            let p11 = src[(y0 + 1, x0 + 1)] as f32;
            let top = p00 * (1.0 - fx) + p01 * fx;
            let bottom = p10 * (1.0 - fx) + p11 * fx;
            (top * (1.0 - fy) + bottom * fy).round() as u8
        } else {
            let x = sx.round() as usize;
            let y = sy.round() as usize;
            if x >= src_w || y >= src_h {
                return 0;
            }
            src[(y, x)]
        }
    })
}

/// Integer box downscale.
pub fn downscale(src: &Array2<u8>, factor: u32) -> Array2<u8> {
    if factor <= 1 {
        return src.clone();
    }
    let f = factor as usize;
    let (src_h, src_w) = src.dim();
    let (height, width) = (src_h / f, src_w / f);

    Array2::from_shape_fn((height, width), |(v, u)| {
        let mut sum = 0u32;
        for dy in 0..f {
            for dx in 0..f {
                sum += src[(v * f + dy, u * f + dx)] as u32;
            }
        }
        (sum / (f * f) as u32) as u8
    })
}

/// Extract one eye's view of a BGRA texture as a grayscale plane.
pub fn bgra_to_gray(
    buffer: &[u8],
    texture_width: u32,
    offset: (u32, u32),
    width: u32,
    height: u32,
) -> Array2<u8> {
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        let px = (offset.0 + x as u32) as usize;
        let py = (offset.1 + y as u32) as usize;
        let idx = (py * texture_width as usize + px) * 4;
        match buffer.get(idx..idx + 3) {
            Some(bgr) => {
                let (b, g, r) = (bgr[0] as u32, bgr[1] as u32, bgr[2] as u32);
                ((77 * r + 150 * g + 29 * b + 128) >> 8) as u8
            }
            None => 0,
        }
    })
}

/// Renderer-facing undistortion map: two floats per texture pixel giving the
/// normalized UV offset from the rectified position to the source position.
pub fn uv_distortion_map(
    left: &RectifyMap,
    right: Option<&RectifyMap>,
    layout: StereoFrameLayout,
    texture_width: u32,
    texture_height: u32,
) -> Vec<f32> {
    let mut map = vec![0.0f32; (texture_width * texture_height * 2) as usize];
    let (frame_w, frame_h) = layout.eye_frame_size(texture_width, texture_height);

    let mut write_eye = |eye_map: &RectifyMap, eye: Eye| {
        let (ox, oy) = layout.eye_frame_offset(eye, texture_width, texture_height);
        for y in 0..frame_h as usize {
            let row = ((oy as usize + y) * texture_width as usize + ox as usize) * 2;
            for x in 0..frame_w as usize {
                let du = eye_map.map_x[(y, x)] - x as f32;
                let dv = eye_map.map_y[(y, x)] - y as f32;
                map[row + x * 2] = du / texture_width as f32;
                map[row + x * 2 + 1] = dv / texture_height as f32;
            }
        }
    };

    write_eye(left, Eye::Left);
    if let Some(right) = right {
        write_eye(right, Eye::Right);
    }
    map
}
