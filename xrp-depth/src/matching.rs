//! Disparity matching on rectified grayscale pairs.
//!
//! Disparities are fixed point with four fractional bits; pixels with no
//! reliable match carry `(min_disparity - 1) << 4`.

use ndarray::Array2;
use rayon::prelude::*;

pub const DISPARITY_FRACTIONAL_BITS: u32 = 4;

/// Cost assigned to disparities the image border cannot support.
const COST_UNREACHABLE: i32 = i32::MAX / 4;

#[derive(Debug, Clone)]
pub struct DisparityMap {
    /// Row-major fixed-point disparities.
    pub data: Vec<i16>,
    pub width: usize,
    pub height: usize,
    pub min_disparity: i32,
    pub max_disparity: i32,
}

impl DisparityMap {
    pub fn invalid(min_disparity: i32) -> i16 {
        ((min_disparity - 1) << DISPARITY_FRACTIONAL_BITS) as i16
    }

    pub fn filled_invalid(width: usize, height: usize, min_disparity: i32, max_disparity: i32) -> Self {
        Self {
            data: vec![Self::invalid(min_disparity); width * height],
            width,
            height,
            min_disparity,
            max_disparity,
        }
    }

    pub fn invalid_value(&self) -> i16 {
        Self::invalid(self.min_disparity)
    }

    pub fn is_valid(&self, value: i16) -> bool {
        value != self.invalid_value()
    }
}

pub trait StereoMatcher: Send + Sync {
    /// Disparity of the left view against the right.
    fn compute(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap;

    /// Disparity of the right view against the left, same sign convention.
    fn compute_right(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap;
}

/// Sum of absolute differences between two windows centered on the given
/// columns of the same row span.
fn sad_window(
    base: &Array2<u8>,
    other: &Array2<u8>,
    x_base: usize,
    x_other: usize,
    y: usize,
    half: usize,
) -> i32 {
    let mut cost = 0i32;
    for dy in 0..=half * 2 {
        let row = y + dy - half;
        for dx in 0..=half * 2 {
            let a = base[(row, x_base + dx - half)] as i32;
            let b = other[(row, x_other + dx - half)] as i32;
            cost += (a - b).abs();
        }
    }
    cost
}

/// Winner-take-all over a per-pixel cost curve: uniqueness check against
/// non-adjacent candidates, then parabolic sub-pixel refinement.
fn select_disparity(
    costs: &[i32],
    min_disparity: i32,
    uniqueness_ratio: i32,
) -> Option<i16> {
    let mut best = COST_UNREACHABLE;
    let mut best_idx = 0usize;
    for (idx, &cost) in costs.iter().enumerate() {
        if cost < best {
            best = cost;
            best_idx = idx;
        }
    }
    if best >= COST_UNREACHABLE {
        return None;
    }

    for (idx, &cost) in costs.iter().enumerate() {
        if idx.abs_diff(best_idx) > 1
            && cost < COST_UNREACHABLE
            && cost * 100 <= best * (100 + uniqueness_ratio)
        {
            return None;
        }
    }

    let d = min_disparity + best_idx as i32;
    let mut fixed = d << DISPARITY_FRACTIONAL_BITS;

    if best_idx > 0 && best_idx + 1 < costs.len() {
        let prev = costs[best_idx - 1];
        let next = costs[best_idx + 1];
        if prev < COST_UNREACHABLE && next < COST_UNREACHABLE {
            let denom = prev + next - 2 * best;
            if denom > 0 {
                let delta = (prev - next) as f32 / (2.0 * denom as f32);
                fixed = ((d as f32 + delta) * (1 << DISPARITY_FRACTIONAL_BITS) as f32).round()
                    as i32;
            }
        }
    }
    Some(fixed as i16)
}

/// SAD block matcher with a uniqueness check, row-parallel.
#[derive(Debug, Clone)]
pub struct BlockMatcher {
    /// Half-width of the matching window.
    pub block_size: usize,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub uniqueness_ratio: i32,
}

impl BlockMatcher {
    fn compute_base(
        &self,
        base: &Array2<u8>,
        other: &Array2<u8>,
        base_is_left: bool,
    ) -> DisparityMap {
        let (height, width) = base.dim();
        let range = (self.max_disparity - self.min_disparity).max(1) as usize;
        let half = self.block_size.max(1);
        let mut out =
            DisparityMap::filled_invalid(width, height, self.min_disparity, self.max_disparity);
        let invalid = out.invalid_value();

        out.data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                if y < half || y + half >= height {
                    return;
                }
                let mut costs = vec![COST_UNREACHABLE; range];

                for x in half..width - half {
                    for (idx, cost) in costs.iter_mut().enumerate() {
                        let d = self.min_disparity + idx as i32;
                        // The left view matches to the left in the right
                        // view; the right view matches the other way.
                        let x_other = if base_is_left {
                            x as i32 - d
                        } else {
                            x as i32 + d
                        };
                        *cost = if x_other < half as i32
                            || x_other as usize + half >= width
                        {
                            COST_UNREACHABLE
                        } else {
                            sad_window(base, other, x, x_other as usize, y, half)
                        };
                    }

                    row[x] = select_disparity(&costs, self.min_disparity, self.uniqueness_ratio)
                        .unwrap_or(invalid);
                }
            });
        out
    }
}

impl StereoMatcher for BlockMatcher {
    fn compute(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap {
        self.compute_base(left, right, true)
    }

    fn compute_right(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap {
        self.compute_base(right, left, false)
    }
}

/// Scanline-optimized semi-global matcher: SAD costs aggregated along both
/// horizontal directions with the usual small/large smoothness penalties.
#[derive(Debug, Clone)]
pub struct SemiGlobalMatcher {
    pub block_size: usize,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub uniqueness_ratio: i32,
    /// Penalty for a one-step disparity change between neighbors.
    pub penalty_small: i32,
    /// Penalty for larger disparity jumps.
    pub penalty_large: i32,
}

impl SemiGlobalMatcher {
    fn aggregate_direction(costs: &[Vec<i32>], p1: i32, p2: i32, forward: bool) -> Vec<Vec<i32>> {
        let width = costs.len();
        let range = costs[0].len();
        let mut out = vec![vec![0i32; range]; width];

        let order: Box<dyn Iterator<Item = usize>> = if forward {
            Box::new(0..width)
        } else {
            Box::new((0..width).rev())
        };

        let mut prev: Option<usize> = None;
        for x in order {
            match prev {
                None => out[x].copy_from_slice(&costs[x]),
                Some(px) => {
                    let prev_min = *out[px].iter().min().unwrap_or(&0);
                    for d in 0..range {
                        let stay = out[px][d];
                        let step_down = if d > 0 { out[px][d - 1] + p1 } else { i32::MAX };
                        let step_up = if d + 1 < range {
                            out[px][d + 1] + p1
                        } else {
                            i32::MAX
                        };
                        let jump = prev_min.saturating_add(p2);
                        let best = stay.min(step_down).min(step_up).min(jump);
                        out[x][d] = costs[x][d].saturating_add(best - prev_min);
                    }
                }
            }
            prev = Some(x);
        }
        out
    }

    fn compute_base(
        &self,
        base: &Array2<u8>,
        other: &Array2<u8>,
        base_is_left: bool,
    ) -> DisparityMap {
        let (height, width) = base.dim();
        let range = (self.max_disparity - self.min_disparity).max(1) as usize;
        let half = self.block_size.max(1);
        let mut out =
            DisparityMap::filled_invalid(width, height, self.min_disparity, self.max_disparity);
        let invalid = out.invalid_value();

        out.data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                if y < half || y + half >= height {
                    return;
                }

                let mut costs = vec![vec![COST_UNREACHABLE; range]; width];
                for (x, pixel_costs) in costs.iter_mut().enumerate().take(width - half).skip(half)
                {
                    for (idx, cost) in pixel_costs.iter_mut().enumerate() {
                        let d = self.min_disparity + idx as i32;
                        let x_other = if base_is_left {
                            x as i32 - d
                        } else {
                            x as i32 + d
                        };
                        if x_other >= half as i32 && (x_other as usize) + half < width {
                            *cost = sad_window(base, other, x, x_other as usize, y, half);
                        }
                    }
                }

                let forward =
                    Self::aggregate_direction(&costs, self.penalty_small, self.penalty_large, true);
                let backward = Self::aggregate_direction(
                    &costs,
                    self.penalty_small,
                    self.penalty_large,
                    false,
                );

                let mut summed = vec![0i32; range];
                for x in half..width - half {
                    for d in 0..range {
                        let raw = costs[x][d];
                        summed[d] = if raw >= COST_UNREACHABLE {
                            COST_UNREACHABLE
                        } else {
                            forward[x][d] + backward[x][d] - raw
                        };
                    }
                    row[x] = select_disparity(&summed, self.min_disparity, self.uniqueness_ratio)
                        .unwrap_or(invalid);
                }
            });
        out
    }
}

impl StereoMatcher for SemiGlobalMatcher {
    fn compute(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap {
        self.compute_base(left, right, true)
    }

    fn compute_right(&self, left: &Array2<u8>, right: &Array2<u8>) -> DisparityMap {
        self.compute_base(right, left, false)
    }
}
