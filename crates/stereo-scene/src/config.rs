use crate::calib::CalibrationParams;
use crate::disparity::FilterConfig;
use crate::floor::FloorConfig;
use crate::scene::AnalysisConfig;
use crate::types::Rect;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    DepthOnly,
    LeftOnly,
    DepthLeft,
    LeftRight,
}

impl CaptureMode {
    /// Lenient parse; unknown names fall back to depth only.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            tracing::warn!("unknown capture mode '{name}', using depth_only");
            CaptureMode::DepthOnly
        })
    }

    pub fn wants_depth(self) -> bool {
        matches!(self, CaptureMode::DepthOnly | CaptureMode::DepthLeft)
    }

    pub fn wants_left(self) -> bool {
        !matches!(self, CaptureMode::DepthOnly)
    }

    pub fn wants_right(self) -> bool {
        matches!(self, CaptureMode::LeftRight)
    }
}

impl FromStr for CaptureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "depth_only" | "depth" => Ok(CaptureMode::DepthOnly),
            "left_only" | "left" => Ok(CaptureMode::LeftOnly),
            "depth_left" => Ok(CaptureMode::DepthLeft),
            "left_right" | "stereo" => Ok(CaptureMode::LeftRight),
            other => Err(Error::Config(format!("unknown capture mode: {other}"))),
        }
    }
}

/// Everything fixed at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Device index or path passed to the stereo source.
    pub device: String,
    pub capture_mode: CaptureMode,
    pub data_path: String,
    pub color_width: u32,
    pub depth_width: u32,
    pub color_rate: u8,
    pub depth_rate: u8,
    pub compress_color: bool,
    pub compress_depth: bool,
    pub fov_deg: f32,
    pub baseline_mm: f32,
    /// Band size (mm) for the discretized depth; unset disables it.
    pub discrete_depth_step: Option<f32>,
    pub roi: Rect,
    pub filter: FilterConfig,
    pub floor: FloorConfig,
    pub analysis: AnalysisConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            capture_mode: CaptureMode::DepthOnly,
            data_path: "../data".to_string(),
            color_width: 640,
            depth_width: 640,
            color_rate: 15,
            depth_rate: 15,
            compress_color: false,
            compress_depth: false,
            fov_deg: 60.0,
            baseline_mm: 60.0,
            discrete_depth_step: None,
            roi: Rect::default(),
            filter: FilterConfig::default(),
            floor: FloorConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl SensorConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("reading config {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing config {}: {e}", path.display())))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Depth frames are 4:3.
    pub fn depth_height(&self) -> u32 {
        self.depth_width * 3 / 4
    }

    pub fn color_height(&self) -> u32 {
        self.color_width * 3 / 4
    }

    pub fn calibration_params(&self) -> CalibrationParams {
        CalibrationParams::from_fov(
            self.depth_width,
            self.depth_height(),
            self.fov_deg,
            self.baseline_mm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_mode_parsing() {
        assert_eq!("depth_left".parse::<CaptureMode>().unwrap(), CaptureMode::DepthLeft);
        assert_eq!(CaptureMode::from_name("LEFT_RIGHT"), CaptureMode::LeftRight);
        assert_eq!(CaptureMode::from_name("bogus"), CaptureMode::DepthOnly);
        assert!(CaptureMode::DepthLeft.wants_depth());
        assert!(CaptureMode::DepthLeft.wants_left());
        assert!(!CaptureMode::LeftOnly.wants_depth());
        assert!(CaptureMode::LeftRight.wants_right());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let cfg = SensorConfig::from_yaml_str(
            "capture_mode: depth_left\ndepth_width: 320\ndiscrete_depth_step: 250.0\nanalysis:\n  bypass:\n    zone_count: 8\n",
        )
        .unwrap();
        assert_eq!(cfg.capture_mode, CaptureMode::DepthLeft);
        assert_eq!(cfg.depth_height(), 240);
        assert_eq!(cfg.discrete_depth_step, Some(250.0));
        assert_eq!(cfg.analysis.bypass.zone_count, 8);
        assert_eq!(cfg.analysis.bypass.dist_threshold, 3000);
        assert_eq!(cfg.baseline_mm, 60.0);
        assert!(cfg.floor.enabled);
    }

    #[test]
    fn test_yaml_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sensor.yaml");
        let mut cfg = SensorConfig::default();
        cfg.roi = Rect::new(10, 20, 300, 200);
        std::fs::write(&path, cfg.to_yaml()?)?;
        assert_eq!(SensorConfig::from_yaml_file(&path)?, cfg);
        Ok(())
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        assert!(matches!(
            SensorConfig::from_yaml_str("depth_width: [1, 2]"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SensorConfig::from_yaml_file("/nonexistent/sensor.yaml"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_shipped_config_parses() {
        let cfg = SensorConfig::from_yaml_str(include_str!("../../../configs/sensor.yaml")).unwrap();
        assert_eq!(cfg.capture_mode, CaptureMode::DepthLeft);
        assert_eq!(cfg.discrete_depth_step, Some(500.0));
        assert!(cfg.roi.is_empty());
        assert_eq!(cfg.floor.fit_from_row, None);
    }

    #[test]
    fn test_calibration_params_from_config() {
        let cfg = SensorConfig::default();
        let p = cfg.calibration_params();
        assert_eq!((p.image_width, p.image_height), (640, 480));
        assert_eq!(p.baseline_mm, 60.0);

        let cfg = SensorConfig {
            color_width: 1280,
            ..SensorConfig::default()
        };
        assert_eq!(cfg.color_height(), 960);
    }
}
