use crate::types::{DisparityMap, Grid, DISPARITY_COUNT};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

const REFIT_PASSES: usize = 2;

/// `true` marks a floor pixel.
pub type SegmentationMask = Grid<bool>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloorConfig {
    pub enabled: bool,
    /// Accepted deviation from the expected floor disparity (levels) when
    /// building the mask. Rows support the line fit at half this deviation.
    pub tolerance: f32,
    /// First row used for fitting; `None` starts at the principal point row.
    pub fit_from_row: Option<u32>,
    /// Minimum number of rows agreeing with the fitted line.
    pub min_rows: usize,
    /// Minimum share of sampled rows agreeing with the fitted line.
    pub min_inlier_fraction: f32,
    /// Valid pixels a row needs before it is sampled.
    pub min_row_samples: usize,
    /// Share of a row's valid pixels that must sit at its dominant disparity.
    pub min_mode_fraction: f32,
    /// Smallest disparity increase per row accepted as a ground slope.
    pub min_slope: f32,
}

impl Default for FloorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance: 2.0,
            fit_from_row: None,
            min_rows: 20,
            min_inlier_fraction: 0.5,
            min_row_samples: 10,
            min_mode_fraction: 0.2,
            min_slope: 0.01,
        }
    }
}

/// Expected floor disparity as a linear function of image row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorModel {
    pub slope: f32,
    pub intercept: f32,
    /// Rows supporting the fit.
    pub inliers: usize,
}

impl FloorModel {
    pub fn expected(&self, row: f32) -> f32 {
        self.slope * row + self.intercept
    }

    /// Row where the floor reaches zero disparity.
    pub fn horizon_row(&self) -> f32 {
        -self.intercept / self.slope
    }
}

#[derive(Debug, Clone, Default)]
pub struct FloorSegmenter {
    config: FloorConfig,
}

impl FloorSegmenter {
    pub fn new(config: FloorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FloorConfig {
        &self.config
    }

    /// Fit the ground model and build the floor mask. `None` when the frame
    /// does not hold enough floor evidence; callers treat that as "no floor
    /// removal for this frame".
    pub fn segment(
        &self,
        disp: &DisparityMap,
        default_start_row: u32,
    ) -> Option<(FloorModel, SegmentationMask)> {
        let model = self.fit(disp, default_start_row)?;
        let tol = self.config.tolerance;
        let w = disp.width();
        let mut mask = Grid::filled(w, disp.height(), false);
        let mut marked = 0usize;
        for y in 0..disp.height() {
            let e = model.expected(y as f32);
            // above the horizon
            if e < 0.5 {
                continue;
            }
            for (x, &d) in disp.row(y).iter().enumerate() {
                if d != 0 && (d as f32 - e).abs() <= tol {
                    if let Some(m) = mask.get_mut(x as u32, y) {
                        *m = true;
                        marked += 1;
                    }
                }
            }
        }
        tracing::debug!(
            "floor fit: slope={:.4} intercept={:.2} horizon={:.1} inliers={} marked={}",
            model.slope,
            model.intercept,
            model.horizon_row(),
            model.inliers,
            marked
        );
        Some((model, mask))
    }

    /// Fit `disparity = slope * row + intercept` to the dominant disparity of each row.
    pub fn fit(&self, disp: &DisparityMap, default_start_row: u32) -> Option<FloorModel> {
        let cfg = &self.config;
        let start = cfg.fit_from_row.unwrap_or(default_start_row).min(disp.height());
        let samples: Vec<(f32, f32)> = (start..disp.height())
            .filter_map(|y| row_mode(disp.row(y), cfg).map(|d| (y as f32, d)))
            .collect();
        let needed = cfg.min_rows.max(2);
        if samples.len() < needed {
            tracing::debug!("floor fit: only {} usable rows", samples.len());
            return None;
        }

        // Deterministic consensus over row pairs spread across the sample range.
        let tol = cfg.tolerance / 2.0;
        let n = samples.len();
        let mut best: Option<(usize, f32, f32)> = None;
        for i in 0..n {
            for j in [i + n / 3, i + n / 2, i + 2 * n / 3] {
                if j >= n || j == i {
                    continue;
                }
                let (y0, d0) = samples[i];
                let (y1, d1) = samples[j];
                let slope = (d1 - d0) / (y1 - y0);
                if !(slope.is_finite() && slope >= cfg.min_slope) {
                    continue;
                }
                let intercept = d0 - slope * y0;
                let count = count_inliers(&samples, slope, intercept, tol);
                if best.map_or(true, |(c, _, _)| count > c) {
                    best = Some((count, slope, intercept));
                }
            }
        }
        let (_, mut slope, mut intercept) = best?;

        // Refit on the agreeing rows, then once more with the refined line.
        for _ in 0..REFIT_PASSES {
            let inliers = agreeing_rows(&samples, slope, intercept, tol);
            if inliers.len() < needed || (inliers.len() as f32) < cfg.min_inlier_fraction * n as f32 {
                tracing::debug!(
                    "floor fit: {} of {} rows agree, rejecting",
                    inliers.len(),
                    n
                );
                return None;
            }
            (slope, intercept) = least_squares(&inliers)?;
        }
        if slope < cfg.min_slope {
            return None;
        }
        Some(FloorModel {
            slope,
            intercept,
            inliers: count_inliers(&samples, slope, intercept, tol),
        })
    }
}

/// Mark masked pixels as having no correspondence. Returns the number cleared.
pub fn apply_mask(disp: &mut DisparityMap, mask: &SegmentationMask) -> Result<usize> {
    if !disp.same_dims(mask) {
        return Err(Error::DimensionMismatch {
            expected: disp.len(),
            actual: mask.len(),
        });
    }
    let mut cleared = 0;
    for (d, &m) in disp.data_mut().iter_mut().zip(mask.data()) {
        if m && *d != 0 {
            *d = 0;
            cleared += 1;
        }
    }
    Ok(cleared)
}

/// Mono8 rendering: 255 for floor, 0 otherwise.
pub fn mask_to_mono8(mask: &SegmentationMask) -> Grid<u8> {
    mask.map(|&m| if m { 255 } else { 0 })
}

fn row_mode(row: &[u8], cfg: &FloorConfig) -> Option<f32> {
    let mut hist = [0u32; DISPARITY_COUNT];
    let mut valid = 0u32;
    for &d in row {
        if d != 0 {
            hist[d as usize] += 1;
            valid += 1;
        }
    }
    if (valid as usize) < cfg.min_row_samples {
        return None;
    }
    let window = |d: usize| -> (usize, usize) { (d.saturating_sub(1).max(1), (d + 1).min(DISPARITY_COUNT - 1)) };
    let mut best = (0usize, 0u32);
    for d in 1..DISPARITY_COUNT {
        let (lo, hi) = window(d);
        let support: u32 = hist[lo..=hi].iter().sum();
        if support > best.1 {
            best = (d, support);
        }
    }
    if (best.1 as f32) < cfg.min_mode_fraction * valid as f32 {
        return None;
    }
    let (lo, hi) = window(best.0);
    let weighted: u64 = (lo..=hi).map(|d| d as u64 * hist[d] as u64).sum();
    Some(weighted as f32 / best.1 as f32)
}

fn agreeing_rows(samples: &[(f32, f32)], slope: f32, intercept: f32, tol: f32) -> Vec<(f32, f32)> {
    samples
        .iter()
        .copied()
        .filter(|&(y, d)| (slope * y + intercept - d).abs() <= tol)
        .collect()
}

fn count_inliers(samples: &[(f32, f32)], slope: f32, intercept: f32, tol: f32) -> usize {
    samples
        .iter()
        .filter(|&&(y, d)| (slope * y + intercept - d).abs() <= tol)
        .count()
}

fn least_squares(points: &[(f32, f32)]) -> Option<(f32, f32)> {
    let n = points.len() as f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for &(x, y) in points {
        let (x, y) = (x as f64, y as f64);
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    Some((slope as f32, intercept as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 320;
    const H: u32 = 240;
    const HORIZON: u32 = 120;

    /// Floor rising 0.2 levels per row below the horizon, a far wall at
    /// disparity 5 and a near box at disparity 40.
    fn scene() -> DisparityMap {
        let mut d = Grid::filled(W, H, 0u8);
        for y in 0..H {
            let floor = if y > HORIZON { 0.2 * (y - HORIZON) as f32 } else { 0.0 };
            for x in 0..W {
                let mut v = floor.max(5.0).round() as u8;
                if (140..180).contains(&x) && (150..200).contains(&y) {
                    v = 40;
                }
                *d.get_mut(x, y).unwrap() = v;
            }
        }
        d
    }

    #[test]
    fn test_fit_recovers_ground_slope() {
        let seg = FloorSegmenter::default();
        let model = seg.fit(&scene(), HORIZON).unwrap();
        assert!((model.slope - 0.2).abs() < 0.02, "slope {}", model.slope);
        assert!((model.horizon_row() - HORIZON as f32).abs() < 5.0);
    }

    #[test]
    fn test_wall_plateau_rows_stay_out_of_mask() {
        let seg = FloorSegmenter::default();
        let (model, mask) = seg.segment(&scene(), HORIZON).unwrap();
        // rows just below the horizon see the wall, 3+ levels above the floor line
        for y in HORIZON + 1..=HORIZON + 12 {
            assert_eq!(mask.get(10, y), Some(&false), "row {y}");
        }
        assert!((model.slope - 0.2).abs() < 0.01, "slope {}", model.slope);
        assert!((model.horizon_row() - HORIZON as f32).abs() < 2.0);
    }

    #[test]
    fn test_mask_marks_floor_not_obstacle() {
        let seg = FloorSegmenter::default();
        let (_, mask) = seg.segment(&scene(), HORIZON).unwrap();
        assert_eq!(mask.get(10, 230), Some(&true));
        assert_eq!(mask.get(300, 200), Some(&true));
        assert_eq!(mask.get(160, 170), Some(&false));
        assert_eq!(mask.get(160, 40), Some(&false));
    }

    #[test]
    fn test_insufficient_samples_yield_no_mask() {
        let seg = FloorSegmenter::default();
        let empty = Grid::filled(W, H, 0u8);
        assert!(seg.segment(&empty, HORIZON).is_none());
    }

    #[test]
    fn test_vertical_surface_is_not_floor() {
        let seg = FloorSegmenter::default();
        let wall = Grid::filled(W, H, 12u8);
        assert!(seg.segment(&wall, HORIZON).is_none());
    }

    #[test]
    fn test_removal_is_stable_under_resegmentation() {
        let seg = FloorSegmenter::default();
        let mut d = scene();
        let (_, mask) = seg.segment(&d, HORIZON).unwrap();
        let cleared = apply_mask(&mut d, &mask).unwrap();
        assert!(cleared > 0);
        let again = seg
            .segment(&d, HORIZON)
            .map(|(_, m)| apply_mask(&mut d, &m).unwrap())
            .unwrap_or(0);
        assert_eq!(again, 0);
        // obstacle survives
        assert_eq!(d.get(160, 170), Some(&40));
    }

    #[test]
    fn test_apply_mask_checks_dimensions() {
        let mut d = Grid::filled(4, 4, 1u8);
        let mask = Grid::filled(2, 2, true);
        assert!(apply_mask(&mut d, &mask).is_err());
    }

    #[test]
    fn test_mask_mono8() {
        let mask = Grid::from_vec(2, 1, vec![true, false]).unwrap();
        assert_eq!(mask_to_mono8(&mask).data(), &[255, 0]);
    }
}
