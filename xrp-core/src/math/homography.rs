use nalgebra::{DMatrix, Matrix3, Vector2};

use crate::error::{MathError, Result};

/// Plane homography mapping four source points onto four destination points.
///
/// Solved by direct linear transform with Hartley normalization of both point
/// sets. The result is scaled so that `h[(2, 2)] == 1`.
pub fn quad_to_quad(src: &[Vector2<f32>; 4], dst: &[Vector2<f32>; 4]) -> Result<Matrix3<f32>> {
    let (t_src, src_n) = normalize_points(src)?;
    let (t_dst, dst_n) = normalize_points(dst)?;

    let mut a = DMatrix::<f64>::zeros(8, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);

        a[(2 * i, 0)] = -x;
        a[(2 * i, 1)] = -y;
        a[(2 * i, 2)] = -1.0;
        a[(2 * i, 6)] = u * x;
        a[(2 * i, 7)] = u * y;
        a[(2 * i, 8)] = u;

        a[(2 * i + 1, 3)] = -x;
        a[(2 * i + 1, 4)] = -y;
        a[(2 * i + 1, 5)] = -1.0;
        a[(2 * i + 1, 6)] = v * x;
        a[(2 * i + 1, 7)] = v * y;
        a[(2 * i + 1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| MathError::DecompositionFailed("SVD produced no V^T".to_string()))?;
    let h_vec = v_t.row(v_t.nrows() - 1);

    let h_n = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], h_vec[3], h_vec[4], h_vec[5], h_vec[6], h_vec[7], h_vec[8],
    );

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or(MathError::SingularMatrix)?;
    let h = t_dst_inv * h_n * t_src;

    // A quad collapsed to a line yields a rank-deficient homography.
    let norm = h.norm();
    if norm < 1e-12 || h.determinant().abs() < 1e-10 * norm.powi(3) {
        return Err(MathError::DegeneratePoints.into());
    }

    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return Err(MathError::DegeneratePoints.into());
    }
    Ok((h / scale).map(|v| v as f32))
}

/// Apply a homography to a 2D point.
pub fn apply_homography(h: &Matrix3<f32>, p: &Vector2<f32>) -> Option<Vector2<f32>> {
    let v = h * nalgebra::Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() <= f32::EPSILON {
        return None;
    }
    Some(Vector2::new(v.x / v.z, v.y / v.z))
}

/// Similarity transform moving the points to centroid zero and mean distance
/// sqrt(2), plus the transformed points.
fn normalize_points(points: &[Vector2<f32>; 4]) -> Result<(Matrix3<f64>, [Vector2<f64>; 4])> {
    let pts: Vec<Vector2<f64>> = points
        .iter()
        .map(|p| Vector2::new(p.x as f64, p.y as f64))
        .collect();

    let centroid = pts.iter().sum::<Vector2<f64>>() / pts.len() as f64;
    let mean_dist = pts.iter().map(|p| (p - centroid).norm()).sum::<f64>() / pts.len() as f64;
    if mean_dist < 1e-12 {
        return Err(MathError::DegeneratePoints.into());
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    );

    let mut out = [Vector2::zeros(); 4];
    for (o, p) in out.iter_mut().zip(pts.iter()) {
        *o = Vector2::new(s * (p.x - centroid.x), s * (p.y - centroid.y));
    }
    Ok((t, out))
}
