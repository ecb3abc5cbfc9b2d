use crate::types::{Distance, DISPARITY_COUNT, MAX_DISTANCE, NO_DISTANCE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Camera intrinsics of the rectified stereo pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub image_width: u32,
    pub image_height: u32,
    /// Closest measurable distance (mm).
    pub min_distance: u16,
    /// Farthest measurable distance (mm).
    pub max_distance: u16,
    /// Principal point (pixels).
    pub cx: f32,
    pub cy: f32,
    /// Stereo baseline (mm).
    pub baseline_mm: f32,
    /// Focal length (pixels).
    pub focal_px: f32,
    /// Horizontal field of view (degrees).
    pub fov_deg: f32,
}

impl CalibrationParams {
    /// Derive intrinsics from the horizontal field of view: the principal point
    /// sits at the image centre and the measurable range spans disparity 255..1.
    pub fn from_fov(image_width: u32, image_height: u32, fov_deg: f32, baseline_mm: f32) -> Self {
        let half_fov = (fov_deg as f64).to_radians() / 2.0;
        let focal_px = if half_fov.tan() > 0.0 {
            (image_width as f64 / 2.0 / half_fov.tan()) as f32
        } else {
            0.0
        };
        let bf = baseline_mm as f64 * focal_px as f64;
        let min_distance = (bf / (DISPARITY_COUNT - 1) as f64).round().max(1.0);
        let max_distance = bf.round().min(MAX_DISTANCE as f64);
        Self {
            image_width,
            image_height,
            min_distance: min_distance.min(u16::MAX as f64) as u16,
            max_distance: max_distance.max(0.0) as u16,
            cx: image_width as f32 / 2.0,
            cy: image_height as f32 / 2.0,
            baseline_mm,
            focal_px,
            fov_deg,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::Calibration("zero resolution".into()));
        }
        if !(self.baseline_mm.is_finite() && self.baseline_mm > 0.0) {
            return Err(Error::Calibration(format!(
                "baseline must be positive, got {}",
                self.baseline_mm
            )));
        }
        if !(self.focal_px.is_finite() && self.focal_px > 0.0) {
            return Err(Error::Calibration(format!(
                "focal length must be positive, got {}",
                self.focal_px
            )));
        }
        if !(self.fov_deg > 0.0 && self.fov_deg < 180.0) {
            return Err(Error::Calibration(format!(
                "field of view out of range: {}",
                self.fov_deg
            )));
        }
        if self.min_distance == NO_DISTANCE || self.min_distance >= self.max_distance {
            return Err(Error::Calibration(format!(
                "distance range [{}, {}] is empty",
                self.min_distance, self.max_distance
            )));
        }
        Ok(())
    }

    fn baseline_focal(&self) -> f64 {
        self.baseline_mm as f64 * self.focal_px as f64
    }
}

/// Validated intrinsics together with the disparity→distance table built from them.
/// The table can only be obtained through `Calibration::new`, so it always
/// matches the parameters it is stored with.
#[derive(Debug, Clone)]
pub struct Calibration {
    params: CalibrationParams,
    table: [u16; DISPARITY_COUNT],
}

impl Calibration {
    pub fn new(params: CalibrationParams) -> Result<Self> {
        params.validate()?;
        let bf = params.baseline_focal();
        let mut table = [NO_DISTANCE; DISPARITY_COUNT];
        for (d, slot) in table.iter_mut().enumerate().skip(1) {
            let dist = (bf / d as f64).round();
            let clamped = dist.clamp(params.min_distance as f64, params.max_distance as f64);
            *slot = clamped as u16;
        }
        tracing::info!(
            "built distance table: B={}mm f={:.1}px range=[{}, {}]mm",
            params.baseline_mm,
            params.focal_px,
            params.min_distance,
            params.max_distance
        );
        Ok(Self { params, table })
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn table(&self) -> &[u16; DISPARITY_COUNT] {
        &self.table
    }

    pub fn min_distance(&self) -> u16 {
        self.params.min_distance
    }

    pub fn max_distance(&self) -> u16 {
        self.params.max_distance
    }

    /// Raw table lookup; 0 for disparity 0.
    #[inline]
    pub fn lookup(&self, disp: u8) -> u16 {
        self.table[disp as usize]
    }

    pub fn disp_to_dist(&self, disp: u8) -> Distance {
        Distance::from_raw(self.lookup(disp))
    }

    /// Inverse of the table: the disparity level whose distance is closest to `dist`.
    pub fn dist_to_disp(&self, dist: Distance) -> u8 {
        match dist {
            Distance::NoReading => 0,
            Distance::Millimetres(mm) => {
                let d = (self.params.baseline_focal() / mm as f64).round();
                d.clamp(1.0, (DISPARITY_COUNT - 1) as f64) as u8
            }
        }
    }

    /// Back-project a pixel with known depth (pinhole model).
    pub fn back_project(&self, u: f32, v: f32, depth_mm: f32) -> crate::Point3f {
        let p = &self.params;
        crate::Point3f::new(
            (u - p.cx) * depth_mm / p.focal_px,
            (v - p.cy) * depth_mm / p.focal_px,
            depth_mm,
        )
    }

    /// Horizontal angle of an image column relative to the optical axis.
    pub fn column_angle_deg(&self, u: f32) -> f32 {
        ((u - self.params.cx) / self.params.focal_px).atan().to_degrees()
    }
}

pub fn read_yaml(path: impl AsRef<Path>) -> Result<CalibrationParams> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|e| Error::Io(e.to_string()))?;
    serde_yaml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

pub fn write_yaml(params: &CalibrationParams, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::Io(e.to_string()))?;
        }
    }
    let s = serde_yaml::to_string(params).map_err(|e| Error::Config(e.to_string()))?;
    fs::write(path, s).map_err(|e| Error::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> CalibrationParams {
        CalibrationParams::from_fov(640, 480, 60.0, 60.0)
    }

    #[test]
    fn test_from_fov_derives_intrinsics() {
        let p = default_params();
        assert!((p.focal_px - 554.256).abs() < 0.01);
        assert_eq!(p.cx, 320.0);
        assert_eq!(p.cy, 240.0);
        assert_eq!(p.min_distance, 130);
        assert_eq!(p.max_distance, MAX_DISTANCE);
    }

    #[test]
    fn test_table_is_monotonic_with_sentinel() {
        for (fov, baseline) in [(60.0, 60.0), (90.0, 120.0), (45.0, 25.0), (70.0, 200.0)] {
            let cal = Calibration::new(CalibrationParams::from_fov(640, 480, fov, baseline)).unwrap();
            let t = cal.table();
            assert_eq!(t[0], NO_DISTANCE);
            for d in 2..DISPARITY_COUNT {
                assert!(t[d] <= t[d - 1], "table increases at disparity {d}");
            }
            for &v in &t[1..] {
                assert!(v >= cal.min_distance() && v <= cal.max_distance());
            }
        }
    }

    #[test]
    fn test_disp_dist_round_trip_within_one_step() {
        let cal = Calibration::new(default_params()).unwrap();
        let t = cal.table();
        for mm in cal.min_distance()..=cal.max_distance() {
            let k = cal.dist_to_disp(Distance::Millimetres(mm)) as usize;
            let back = t[k];
            let lower_gap = if k < DISPARITY_COUNT - 1 { t[k] - t[k + 1] } else { 0 };
            let upper_gap = if k > 1 { t[k - 1] - t[k] } else { 0 };
            let step = lower_gap.max(upper_gap) + 1;
            assert!(
                back.abs_diff(mm) <= step,
                "{mm}mm -> disp {k} -> {back}mm (step {step})"
            );
        }
    }

    #[test]
    fn test_no_reading_maps_to_zero_disparity() {
        let cal = Calibration::new(default_params()).unwrap();
        assert_eq!(cal.dist_to_disp(Distance::NoReading), 0);
        assert_eq!(cal.disp_to_dist(0), Distance::NoReading);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut p = default_params();
        p.baseline_mm = 0.0;
        assert!(matches!(Calibration::new(p), Err(Error::Calibration(_))));

        let mut p = default_params();
        p.focal_px = 0.0;
        assert!(matches!(Calibration::new(p), Err(Error::Calibration(_))));

        let p = CalibrationParams::from_fov(0, 480, 60.0, 60.0);
        assert!(Calibration::new(p).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib/stereo.yaml");
        let p = default_params();
        write_yaml(&p, &path).unwrap();
        assert_eq!(read_yaml(&path).unwrap(), p);
    }
}
