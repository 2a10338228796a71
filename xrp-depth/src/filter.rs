//! Post-filters applied to raw disparity maps.

use ndarray::Array2;

use crate::matching::{DISPARITY_FRACTIONAL_BITS, DisparityMap};

/// Invalidate connected disparity regions smaller than `max_speckle_size`.
/// Neighbors belong to the same region when their disparities differ by at
/// most `max_diff` whole disparities.
pub fn speckle_filter(disparity: &mut DisparityMap, max_speckle_size: i32, max_diff: i32) {
    if max_speckle_size <= 0 {
        return;
    }
    let width = disparity.width;
    let height = disparity.height;
    let invalid = disparity.invalid_value();
    let diff_limit = (max_diff.max(0) << DISPARITY_FRACTIONAL_BITS) as i32;

    let mut label = vec![0u32; width * height];
    let mut next_label = 0u32;
    let mut stack: Vec<usize> = Vec::new();
    let mut region: Vec<usize> = Vec::new();

    for start in 0..width * height {
        if label[start] != 0 || disparity.data[start] == invalid {
            continue;
        }
        next_label += 1;
        stack.push(start);
        label[start] = next_label;
        region.clear();

        while let Some(idx) = stack.pop() {
            region.push(idx);
            let x = idx % width;
            let y = idx / width;
            let value = disparity.data[idx] as i32;

            let mut visit = |nx: usize, ny: usize, stack: &mut Vec<usize>| {
                let nidx = ny * width + nx;
                if label[nidx] != 0 {
                    return;
                }
                let neighbor = disparity.data[nidx];
                if neighbor != invalid && (neighbor as i32 - value).abs() <= diff_limit {
                    label[nidx] = next_label;
                    stack.push(nidx);
                }
            };

            if x > 0 {
                visit(x - 1, y, &mut stack);
            }
            if x + 1 < width {
                visit(x + 1, y, &mut stack);
            }
            if y > 0 {
                visit(x, y - 1, &mut stack);
            }
            if y + 1 < height {
                visit(x, y + 1, &mut stack);
            }
        }

        if region.len() <= max_speckle_size as usize {
            for &idx in &region {
                disparity.data[idx] = invalid;
            }
        }
    }
}

/// Edge-aware smoothing guided by the rectified image: neighbors are blended
/// with weights that fall off with the guide intensity difference. `lambda`
/// sets the pass count, `sigma` the intensity falloff.
pub fn smooth_disparity(
    disparity: &mut DisparityMap,
    guide: &Array2<u8>,
    lambda: f32,
    sigma: f32,
) {
    if guide.dim() != (disparity.height, disparity.width) {
        return;
    }
    let passes = ((lambda / 4000.0).ceil() as usize).clamp(1, 4);
    for _ in 0..passes {
        guided_pass(disparity, guide, 1, 1.0, sigma.max(1e-3) * 8.0);
    }
}

/// Bilateral-style smoothing with a spatial falloff in addition to the guide
/// intensity falloff.
pub fn bilateral_smooth(
    disparity: &mut DisparityMap,
    guide: &Array2<u8>,
    spatial: f32,
    luma: f32,
    iterations: u32,
) {
    if guide.dim() != (disparity.height, disparity.width) {
        return;
    }
    let radius = (spatial.round() as usize).clamp(1, 4);
    for _ in 0..iterations.clamp(1, 16) {
        guided_pass(disparity, guide, radius, spatial.max(1e-3), luma.max(1e-3) * 8.0);
    }
}

fn guided_pass(
    disparity: &mut DisparityMap,
    guide: &Array2<u8>,
    radius: usize,
    spatial_sigma: f32,
    intensity_sigma: f32,
) {
    let width = disparity.width;
    let height = disparity.height;
    let invalid = disparity.invalid_value();
    let mut smoothed = disparity.data.clone();

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if disparity.data[idx] == invalid {
                continue;
            }
            let center_guide = guide[(y, x)] as f32;

            let mut weight_sum = 0.0f32;
            let mut value_sum = 0.0f32;
            for dy in y.saturating_sub(radius)..=(y + radius).min(height - 1) {
                for dx in x.saturating_sub(radius)..=(x + radius).min(width - 1) {
                    let nidx = dy * width + dx;
                    let value = disparity.data[nidx];
                    if value == invalid {
                        continue;
                    }
                    let dg = guide[(dy, dx)] as f32 - center_guide;
                    let ds = ((dy as f32 - y as f32).powi(2)
                        + (dx as f32 - x as f32).powi(2))
                        / (2.0 * spatial_sigma * spatial_sigma);
                    let w = (-(dg * dg) / (2.0 * intensity_sigma * intensity_sigma) - ds).exp();
                    weight_sum += w;
                    value_sum += w * value as f32;
                }
            }
            if weight_sum > 0.0 {
                smoothed[idx] = (value_sum / weight_sum).round() as i16;
            }
        }
    }

    disparity.data = smoothed;
}

/// Blend the current disparity with the previous frame's. Within the
/// rejection distance the previous value is weighted by `strength`; a larger
/// jump is taken as real motion and the new value passes through unblended.
pub fn temporal_blend(
    current: &mut DisparityMap,
    previous: &[i16],
    strength: f32,
    rejection_distance: f32,
) {
    if previous.len() != current.data.len() {
        return;
    }
    let invalid = current.invalid_value();
    let strength = strength.clamp(0.0, 1.0);
    let rejection = rejection_distance * (1 << DISPARITY_FRACTIONAL_BITS) as f32;

    for (value, &prev) in current.data.iter_mut().zip(previous.iter()) {
        if *value == invalid || prev == invalid {
            continue;
        }
        let delta = (*value as f32 - prev as f32).abs();
        if delta <= rejection {
            *value = (*value as f32 * (1.0 - strength) + prev as f32 * strength).round() as i16;
        }
    }
}
