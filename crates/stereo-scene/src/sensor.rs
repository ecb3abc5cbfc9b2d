//! The sensor facade: owns the calibration, the per-frame buffers and every
//! pipeline stage, and answers scene queries against the current frame.
//!
//! Lifecycle is `stopped -> started -> stopped`. Per frame the caller runs
//! `grab`, `filter_disparity` and optionally `remove_floor` (or just
//! `process_frame`), then issues any number of queries. Queries on a stopped
//! sensor, or before the first frame, return the "no result" value of the
//! query.

use crate::ar::{CameraIntrinsics, CameraSide, Marker};
use crate::calib::Calibration;
use crate::config::SensorConfig;
use crate::depth::{self, PointCloud};
use crate::disparity::DisparityFilter;
use crate::floor::{self, FloorModel, FloorSegmenter, SegmentationMask};
use crate::measure;
use crate::metrics::PipelineMetrics;
use crate::scene::{BypassParams, Human, Obstacle, SceneAnalyzer, SceneInfo, SceneObject, ScenePoint};
use crate::traits::{BiometricsService, MarkerDetector, StereoSource};
use crate::types::{DepthField, DisparityMap, Distance, Direction, Frame, Grid, Point3f, Rect};
use crate::{Error, Result};
use serde::Serialize;
use time::OffsetDateTime;

/// Summary of one `process_frame` pass.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_index: u64,
    pub has_depth: bool,
    pub valid_ratio: f32,
    pub floor: Option<FloorModel>,
    pub dead_zone: bool,
    pub ts: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
enum FloorStage {
    #[default]
    Pending,
    Removed(FloorModel, SegmentationMask),
    Unavailable,
}

/// Buffers of the current frame. Replaced wholesale by `grab`.
#[derive(Debug, Default)]
struct FrameState {
    index: u64,
    ts: Option<OffsetDateTime>,
    left: Option<Frame>,
    right: Option<Frame>,
    raw: Option<DisparityMap>,
    disparity: Option<DisparityMap>,
    depth: Option<DepthField>,
    floor: FloorStage,
    discrete: Option<DepthField>,
    cloud: Option<PointCloud>,
}

impl FrameState {
    fn set_disparity(&mut self, disp: DisparityMap, cal: &Calibration) {
        self.depth = Some(depth::to_depth(&disp, cal));
        self.disparity = Some(disp);
        self.discrete = None;
        self.cloud = None;
    }
}

struct Running<S> {
    source: S,
    config: SensorConfig,
    calibration: Calibration,
    filter: DisparityFilter,
    segmenter: FloorSegmenter,
    analyzer: SceneAnalyzer,
    discrete_step: Option<f32>,
    roi: Rect,
    frame: FrameState,
}

struct ArState {
    detector: Box<dyn MarkerDetector>,
    marker_size_m: f32,
}

pub struct SceneSensor<S: StereoSource> {
    running: Option<Running<S>>,
    metrics: Option<PipelineMetrics>,
    biometrics: Option<Box<dyn BiometricsService>>,
    ar: Option<ArState>,
}

impl<S: StereoSource> Default for SceneSensor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StereoSource> SceneSensor<S> {
    pub fn new() -> Self {
        let metrics = match PipelineMetrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!("pipeline metrics disabled: {e}");
                None
            }
        };
        Self {
            running: None,
            metrics,
            biometrics: None,
            ar: None,
        }
    }

    // ---- lifecycle ----

    /// Open the device named by `config.device` and fix the calibration.
    ///
    /// A running session is stopped before the device is opened, so a failed
    /// restart leaves the sensor stopped.
    pub fn start(&mut self, config: SensorConfig) -> Result<()> {
        // Validate before touching the device.
        let calibration = validate(&config)?;
        self.stop();
        let source = S::open(&config.device).map_err(|e| match e {
            Error::NotFound(msg) => Error::NotFound(msg),
            other => Error::NotFound(format!("{}: {other}", config.device)),
        })?;
        self.start_inner(source, config, calibration)
    }

    /// Start with an already opened source.
    pub fn start_with_source(&mut self, source: S, config: SensorConfig) -> Result<()> {
        let calibration = validate(&config)?;
        self.stop();
        self.start_inner(source, config, calibration)
    }

    fn start_inner(&mut self, mut source: S, config: SensorConfig, calibration: Calibration) -> Result<()> {
        source.configure(
            config.capture_mode,
            config.depth_width,
            config.depth_height(),
            config.depth_rate,
        )?;
        tracing::info!(
            "sensor started: device={} mode={:?} depth={}x{}@{}",
            config.device,
            config.capture_mode,
            config.depth_width,
            config.depth_height(),
            config.depth_rate
        );
        self.running = Some(Running {
            source,
            filter: DisparityFilter::new(config.filter),
            segmenter: FloorSegmenter::new(config.floor),
            analyzer: SceneAnalyzer::new(config.analysis),
            discrete_step: config.discrete_depth_step,
            roi: config.roi,
            calibration,
            config,
            frame: FrameState::default(),
        });
        Ok(())
    }

    /// Release the device and drop every frame buffer.
    pub fn stop(&mut self) {
        if let Some(run) = self.running.take() {
            tracing::info!("sensor stopped after {} frames", run.frame.index);
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    pub fn config(&self) -> Option<&SensorConfig> {
        self.running.as_ref().map(|r| &r.config)
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.running.as_ref().map(|r| &r.calibration)
    }

    pub fn metrics(&self) -> Option<&PipelineMetrics> {
        self.metrics.as_ref()
    }

    // ---- per-frame pipeline ----

    /// Read the next frame from the source and compute unfiltered depth.
    pub fn grab(&mut self) -> Result<()> {
        let run = self.running.as_mut().ok_or(Error::NotStarted)?;
        let captured = run.source.read()?;
        let p = run.calibration.params();
        if let Some(d) = &captured.disparity {
            if d.width() != p.image_width || d.height() != p.image_height {
                return Err(Error::DimensionMismatch {
                    expected: (p.image_width * p.image_height) as usize,
                    actual: d.len(),
                });
            }
        }
        let mut frame = FrameState {
            index: run.frame.index + 1,
            ts: captured.ts,
            left: captured.left,
            right: captured.right,
            ..FrameState::default()
        };
        if let Some(raw) = captured.disparity {
            run.filter.push(&raw);
            frame.set_disparity(raw.clone(), &run.calibration);
            frame.raw = Some(raw);
        }
        run.frame = frame;
        if let Some(m) = &self.metrics {
            m.frames_processed.inc();
        }
        Ok(())
    }

    /// Temporal and speckle filtering of the raw disparity against the
    /// previously grabbed frame; undoes any floor removal. Repeating it on
    /// the same frame gives the same result.
    pub fn filter_disparity(&mut self) -> Result<()> {
        let run = self.running.as_mut().ok_or(Error::NotStarted)?;
        let Some(raw) = run.frame.raw.as_ref() else {
            return Ok(());
        };
        let filtered = run.filter.filter(raw);
        run.frame.set_disparity(filtered, &run.calibration);
        run.frame.floor = FloorStage::Pending;
        Ok(())
    }

    /// Segment the floor and clear it from the working disparity and depth.
    ///
    /// Returns whether a floor mask exists for this frame. The mask is computed
    /// once per frame; later calls reuse it.
    pub fn remove_floor(&mut self) -> Result<bool> {
        let run = self.running.as_mut().ok_or(Error::NotStarted)?;
        match run.frame.floor {
            FloorStage::Removed(..) => return Ok(true),
            FloorStage::Unavailable => return Ok(false),
            FloorStage::Pending => {}
        }
        let Some(disp) = run.frame.disparity.as_ref() else {
            return Ok(false);
        };
        let start_row = run.calibration.params().cy.round().max(0.0) as u32;
        let Some((model, mask)) = run.segmenter.segment(disp, start_row) else {
            tracing::warn!("frame {}: floor model not fitted", run.frame.index);
            if let Some(m) = &self.metrics {
                m.floor_fit_failures.inc();
            }
            run.frame.floor = FloorStage::Unavailable;
            return Ok(false);
        };
        let mut cleared = disp.clone();
        let n = floor::apply_mask(&mut cleared, &mask)?;
        tracing::debug!("frame {}: removed {n} floor pixels", run.frame.index);
        run.frame.set_disparity(cleared, &run.calibration);
        run.frame.floor = FloorStage::Removed(model, mask);
        Ok(true)
    }

    /// grab, filter, floor removal when enabled, dead-zone check.
    pub fn process_frame(&mut self) -> Result<FrameReport> {
        self.grab()?;
        self.filter_disparity()?;
        let floor_enabled = self
            .running
            .as_ref()
            .is_some_and(|r| r.config.floor.enabled);
        if floor_enabled {
            self.remove_floor()?;
        }
        let run = self.running.as_ref().ok_or(Error::NotStarted)?;
        let has_depth = run.frame.depth.is_some();
        let valid_ratio = run
            .frame
            .depth
            .as_ref()
            .map_or(0.0, |d| run.analyzer.valid_ratio(d, run.roi));
        let dead_zone = self.detect_dead_zone();
        if let Some(m) = &self.metrics {
            m.record_valid_ratio(valid_ratio);
            if dead_zone {
                m.dead_zone_frames.inc();
            }
        }
        if dead_zone && has_depth {
            tracing::warn!(
                "frame {}: dead zone ({:.1}% valid)",
                run.frame.index,
                valid_ratio * 100.0
            );
        }
        let floor = match &run.frame.floor {
            FloorStage::Removed(model, _) => Some(*model),
            _ => None,
        };
        tracing::debug!(
            "frame {}: valid={:.3} floor={} dead_zone={dead_zone}",
            run.frame.index,
            valid_ratio,
            floor.is_some()
        );
        Ok(FrameReport {
            frame_index: run.frame.index,
            has_depth,
            valid_ratio,
            floor,
            dead_zone,
            ts: run.frame.ts,
        })
    }

    // ---- settings ----

    pub fn set_discrete_depth_step(&mut self, step: f32) -> Result<()> {
        check_step(step)?;
        let run = self.running.as_mut().ok_or(Error::NotStarted)?;
        run.discrete_step = Some(step);
        run.frame.discrete = None;
        Ok(())
    }

    pub fn set_roi(&mut self, roi: Rect) -> Result<()> {
        let run = self.running.as_mut().ok_or(Error::NotStarted)?;
        run.roi = roi;
        Ok(())
    }

    pub fn roi(&self) -> Rect {
        self.running.as_ref().map(|r| r.roi).unwrap_or_default()
    }

    /// Depth frame rate; 0 when stopped.
    pub fn rate(&self) -> u8 {
        self.running.as_ref().map_or(0, |r| r.config.depth_rate)
    }

    pub fn min_distance(&self) -> Distance {
        self.running
            .as_ref()
            .map_or(Distance::NoReading, |r| Distance::from_raw(r.calibration.min_distance()))
    }

    pub fn max_distance(&self) -> Distance {
        self.running
            .as_ref()
            .map_or(Distance::NoReading, |r| Distance::from_raw(r.calibration.max_distance()))
    }

    // ---- frame artifacts ----

    pub fn left(&self) -> Option<&Frame> {
        self.frame()?.left.as_ref()
    }

    pub fn right(&self) -> Option<&Frame> {
        self.frame()?.right.as_ref()
    }

    /// Working disparity (filtered, floor removed if requested).
    pub fn disp(&self) -> Option<&DisparityMap> {
        self.frame()?.disparity.as_ref()
    }

    pub fn raw_disp(&self) -> Option<&DisparityMap> {
        self.frame()?.raw.as_ref()
    }

    pub fn disp_colored(&self) -> Option<Frame> {
        let frame = self.frame()?;
        let mut out = depth::colorize_disparity(frame.disparity.as_ref()?);
        out.ts = frame.ts;
        Some(out)
    }

    pub fn depth(&self) -> Option<&DepthField> {
        self.frame()?.depth.as_ref()
    }

    pub fn depth8(&self) -> Option<Grid<u8>> {
        let run = self.running.as_ref()?;
        let d = run.frame.depth.as_ref()?;
        Some(depth::to_depth8(
            d,
            run.calibration.min_distance(),
            run.calibration.max_distance(),
        ))
    }

    /// Mono8 bytes of the working disparity.
    pub fn disp_mono8(&self) -> Option<&[u8]> {
        self.disp().map(Grid::as_bytes)
    }

    /// Mono16 little-endian bytes of the depth field (mm).
    pub fn depth_mono16(&self) -> Option<Vec<u8>> {
        self.depth().map(Grid::to_mono16_le)
    }

    /// Depth quantized to the configured step; `None` without a step or depth.
    pub fn discrete_depth(&mut self) -> Option<&DepthField> {
        let run = self.running.as_mut()?;
        if run.frame.discrete.is_none() {
            let step = run.discrete_step?;
            let d = run.frame.depth.as_ref()?;
            match depth::to_discrete_depth(d, step) {
                Ok(q) => run.frame.discrete = Some(q),
                Err(e) => {
                    tracing::warn!("discrete depth: {e}");
                    return None;
                }
            }
        }
        run.frame.discrete.as_ref()
    }

    pub fn discrete_depth8(&mut self) -> Option<Grid<u8>> {
        let (min, max) = {
            let cal = self.calibration()?;
            (cal.min_distance(), cal.max_distance())
        };
        let q = self.discrete_depth()?;
        Some(depth::to_depth8(q, min, max))
    }

    pub fn point_cloud(&mut self) -> Option<&PointCloud> {
        let run = self.running.as_mut()?;
        if run.frame.cloud.is_none() {
            let d = run.frame.depth.as_ref()?;
            run.frame.cloud = Some(depth::to_point_cloud(d, &run.calibration));
        }
        run.frame.cloud.as_ref()
    }

    /// Write the point cloud inside the current ROI as PLY.
    pub fn export_ply(&mut self, path: &str) -> Result<usize> {
        let roi = self.roi();
        let cloud = self.point_cloud().ok_or(Error::NotStarted)?;
        depth::write_ply(cloud, path, roi)
    }

    pub fn segmentation_mask(&self) -> Option<&SegmentationMask> {
        match &self.frame()?.floor {
            FloorStage::Removed(_, mask) => Some(mask),
            _ => None,
        }
    }

    pub fn floor_model(&self) -> Option<FloorModel> {
        match &self.frame()?.floor {
            FloorStage::Removed(model, _) => Some(*model),
            _ => None,
        }
    }

    // ---- measurements ----

    pub fn disparity_at(&self, x: u32, y: u32) -> u8 {
        self.disp().map_or(0, |d| measure::disparity_at(d, x, y))
    }

    pub fn distance_at(&self, x: u32, y: u32) -> Distance {
        self.depth()
            .map_or(Distance::NoReading, |d| measure::distance_at(d, x, y))
    }

    pub fn distance_to_rect(&self, rect: Rect) -> Distance {
        self.depth()
            .map_or(Distance::NoReading, |d| measure::distance_to_rect(d, rect))
    }

    pub fn world_point_at(&self, x: u32, y: u32) -> Option<Point3f> {
        let (d, cal) = self.depth_and_calibration()?;
        measure::world_point_at(d, cal, x, y)
    }

    pub fn world_point_at_m(&self, x: u32, y: u32) -> Option<Point3f> {
        let (d, cal) = self.depth_and_calibration()?;
        measure::world_point_at_m(d, cal, x, y)
    }

    pub fn direction_to_point(&self, x: i32, y: i32) -> Direction {
        self.calibration()
            .map_or(Direction::Undefined, |c| measure::direction_to_point(c, x, y))
    }

    pub fn direction_to_rect(&self, rect: Rect) -> Direction {
        self.calibration()
            .map_or(Direction::Undefined, |c| measure::direction_to_rect(c, rect))
    }

    // ---- scene queries ----

    pub fn nearest_distance(&self) -> Distance {
        match self.query() {
            Some((run, d)) => run.analyzer.nearest_distance(d, run.roi),
            None => Distance::NoReading,
        }
    }

    pub fn nearest_point(&self) -> Option<ScenePoint> {
        let (run, d) = self.query()?;
        run.analyzer.nearest_point(d, &run.calibration, run.roi)
    }

    pub fn nearest_obstacle(&self) -> Option<Obstacle> {
        let (run, d) = self.query()?;
        run.analyzer.nearest_obstacle(d, &run.calibration, run.roi)
    }

    /// Farthest point using the configured band width.
    pub fn farthest_point(&self) -> Option<ScenePoint> {
        let width = self.running.as_ref()?.config.analysis.farthest_band_width;
        self.farthest_point_with_width(width)
    }

    pub fn farthest_point_with_width(&self, band_width: u32) -> Option<ScenePoint> {
        let (run, d) = self.query()?;
        run.analyzer
            .farthest_point(d, &run.calibration, run.roi, band_width)
    }

    /// Bypass heading using the configured thresholds.
    pub fn bypass_direction(&self) -> Direction {
        match self.running.as_ref() {
            Some(run) => self.bypass_direction_with(&run.config.analysis.bypass),
            None => Direction::Undefined,
        }
    }

    pub fn bypass_direction_with(&self, params: &BypassParams) -> Direction {
        match self.query() {
            Some((run, d)) => run
                .analyzer
                .bypass_direction(d, &run.calibration, run.roi, params),
            None => Direction::Undefined,
        }
    }

    /// `true` when the frame holds too little depth to act on; also `true`
    /// when there is no frame at all.
    pub fn detect_dead_zone(&self) -> bool {
        match self.query() {
            Some((run, d)) => run.analyzer.is_dead_zone(d, run.roi),
            None => true,
        }
    }

    pub fn scene_info(&self) -> SceneInfo {
        let Some((run, d)) = self.query() else {
            return SceneInfo::default();
        };
        let Some(disp) = run.frame.disparity.as_ref() else {
            return SceneInfo::default();
        };
        run.analyzer.scene_info(d, disp, &run.calibration, run.roi)
    }

    // ---- humans ----

    pub fn set_biometrics_service(&mut self, service: Box<dyn BiometricsService>) {
        self.biometrics = Some(service);
    }

    /// People found in the left image, located with the current depth.
    pub fn humans(&mut self) -> Result<Vec<Human>> {
        let Some(run) = self.running.as_ref() else {
            return Ok(Vec::new());
        };
        let (Some(service), Some(image)) = (self.biometrics.as_mut(), run.frame.left.as_ref()) else {
            return Ok(Vec::new());
        };
        let rects = service.detect(image)?;
        let cal = &run.calibration;
        let humans = rects
            .into_iter()
            .map(|rect| Human {
                object: match run.frame.depth.as_ref() {
                    Some(d) => measure::locate(d, cal, rect),
                    None => SceneObject {
                        distance: Distance::NoReading,
                        angle: measure::direction_to_rect(cal, rect),
                        bounding_rect: rect,
                        centre: rect.centre(),
                        centre_world: None,
                    },
                },
                biometrics: None,
            })
            .collect::<Vec<_>>();
        tracing::debug!("frame {}: {} humans", run.frame.index, humans.len());
        Ok(humans)
    }

    /// The nearest person, with labels from the biometrics service.
    pub fn nearest_human_biometrics(&mut self) -> Result<Option<Human>> {
        let humans = self.humans()?;
        let Some(mut nearest) = humans
            .into_iter()
            .min_by_key(|h| h.object.distance.mm().unwrap_or(u16::MAX))
        else {
            return Ok(None);
        };
        let image = self.left().cloned();
        if let (Some(service), Some(image)) = (self.biometrics.as_mut(), image) {
            nearest.biometrics = Some(service.estimate(&image, nearest.object.bounding_rect)?);
        }
        Ok(Some(nearest))
    }

    // ---- augmented reality ----

    pub fn init_ar(&mut self, detector: Box<dyn MarkerDetector>, marker_size_m: f32) -> Result<()> {
        if !(marker_size_m.is_finite() && marker_size_m > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "marker size must be positive, got {marker_size_m}"
            )));
        }
        self.ar = Some(ArState {
            detector,
            marker_size_m,
        });
        tracing::info!("marker detection enabled ({marker_size_m} m markers)");
        Ok(())
    }

    pub fn deinit_ar(&mut self) {
        self.ar = None;
    }

    /// Intrinsics handed to the marker detector; both cameras share them.
    pub fn ar_camera_parameters(&self) -> Option<CameraIntrinsics> {
        self.calibration().map(CameraIntrinsics::from_calibration)
    }

    /// Markers visible in the image of camera `camera_num` (0 left, 1 right).
    pub fn markers(&mut self, camera_num: u8) -> Result<Vec<Marker>> {
        let Some(run) = self.running.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(ar) = self.ar.as_mut() else {
            return Ok(Vec::new());
        };
        let image = match CameraSide::from_index(camera_num) {
            CameraSide::Left => run.frame.left.as_ref(),
            CameraSide::Right => run.frame.right.as_ref(),
        };
        let Some(image) = image else {
            return Ok(Vec::new());
        };
        let k = CameraIntrinsics::from_calibration(&run.calibration);
        ar.detector.detect(image, &k, ar.marker_size_m)
    }

    // ---- conversions ----

    pub fn dist2disp(&self, dist: Distance) -> u8 {
        self.calibration().map_or(0, |c| c.dist_to_disp(dist))
    }

    pub fn disp2dist(&self, disp: u8) -> Distance {
        self.calibration()
            .map_or(Distance::NoReading, |c| c.disp_to_dist(disp))
    }

    pub fn dist2rgb(&self, dist: Distance) -> [u8; 3] {
        match self.calibration() {
            Some(c) => depth::dist_to_rgb(dist, c.min_distance(), c.max_distance()),
            None => [0, 0, 0],
        }
    }

    fn frame(&self) -> Option<&FrameState> {
        self.running.as_ref().map(|r| &r.frame)
    }

    fn query(&self) -> Option<(&Running<S>, &DepthField)> {
        let run = self.running.as_ref()?;
        let d = run.frame.depth.as_ref()?;
        Some((run, d))
    }

    fn depth_and_calibration(&self) -> Option<(&DepthField, &Calibration)> {
        let (run, d) = self.query()?;
        Some((d, &run.calibration))
    }
}

fn validate(config: &SensorConfig) -> Result<Calibration> {
    let calibration = Calibration::new(config.calibration_params())?;
    if let Some(step) = config.discrete_depth_step {
        check_step(step)?;
    }
    Ok(calibration)
}

fn check_step(step: f32) -> Result<()> {
    if step.is_finite() && step > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "discrete depth step must be positive, got {step}"
        )))
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::ar::Pose;
    use crate::config::CaptureMode;
    use crate::mock::{MockObstacle, MockScene, MockStereoSource};
    use crate::scene::{Biometrics, Gender};
    use crate::traits::StereoFrame;
    use crate::types::Point2i;

    fn scene(obstacle_mm: u16) -> MockScene {
        MockScene {
            obstacles: vec![MockObstacle {
                rect: Rect::new(280, 180, 80, 200),
                distance_mm: obstacle_mm,
            }],
            jitter: false,
            ..MockScene::default()
        }
    }

    fn config() -> SensorConfig {
        SensorConfig {
            capture_mode: CaptureMode::DepthLeft,
            ..SensorConfig::default()
        }
    }

    fn started(obstacle_mm: u16) -> SceneSensor<MockStereoSource> {
        let mut s = SceneSensor::new();
        s.start_with_source(MockStereoSource::new(scene(obstacle_mm)), config())
            .unwrap();
        s
    }

    struct MissingDevice;

    impl StereoSource for MissingDevice {
        fn open(spec: &str) -> Result<Self> {
            Err(Error::Backend(format!("no device at {spec}")))
        }

        fn read(&mut self) -> Result<StereoFrame> {
            Err(Error::Backend("closed".into()))
        }
    }

    #[test]
    fn test_queries_before_start_return_sentinels() {
        let mut s: SceneSensor<MockStereoSource> = SceneSensor::new();
        assert!(!s.is_started());
        assert_eq!(s.nearest_distance(), Distance::NoReading);
        assert!(s.nearest_point().is_none());
        assert!(s.nearest_obstacle().is_none());
        assert!(s.farthest_point().is_none());
        assert_eq!(s.bypass_direction(), Direction::Undefined);
        assert!(s.detect_dead_zone());
        assert_eq!(s.scene_info(), SceneInfo::default());
        assert_eq!(s.min_distance(), Distance::NoReading);
        assert_eq!(s.rate(), 0);
        assert_eq!(s.dist2disp(Distance::Millimetres(500)), 0);
        assert!(s.humans().unwrap().is_empty());
        assert!(matches!(s.grab(), Err(Error::NotStarted)));
        assert!(matches!(s.remove_floor(), Err(Error::NotStarted)));
    }

    #[test]
    fn test_start_fails_when_device_missing() {
        let mut s: SceneSensor<MissingDevice> = SceneSensor::new();
        let err = s.start(SensorConfig::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!s.is_started());
        assert!(s.calibration().is_none());
    }

    /// Opens only device "0".
    struct OneDevice(MockStereoSource);

    impl StereoSource for OneDevice {
        fn open(spec: &str) -> Result<Self> {
            match spec {
                "0" => Ok(Self(MockStereoSource::new(scene(1200)))),
                other => Err(Error::NotFound(format!("no device at {other}"))),
            }
        }

        fn read(&mut self) -> Result<StereoFrame> {
            self.0.read()
        }
    }

    #[test]
    fn test_failed_restart_leaves_sensor_stopped() {
        let mut s: SceneSensor<OneDevice> = SceneSensor::new();
        s.start(config()).unwrap();
        s.process_frame().unwrap();
        assert!(s.depth().is_some());

        let other = SensorConfig {
            device: "7".to_string(),
            ..config()
        };
        assert!(matches!(s.start(other), Err(Error::NotFound(_))));
        assert!(!s.is_started());
        assert!(s.depth().is_none());

        s.start(config()).unwrap();
        assert_eq!(s.process_frame().unwrap().frame_index, 1);
    }

    #[test]
    fn test_start_rejects_invalid_calibration() {
        let mut s: SceneSensor<MockStereoSource> = SceneSensor::new();
        let cfg = SensorConfig {
            baseline_mm: 0.0,
            ..SensorConfig::default()
        };
        assert!(matches!(s.start(cfg), Err(Error::Calibration(_))));
        assert!(!s.is_started());

        let cfg = SensorConfig {
            discrete_depth_step: Some(-5.0),
            ..SensorConfig::default()
        };
        assert!(matches!(s.start(cfg), Err(Error::InvalidParameter(_))));
        assert!(!s.is_started());
    }

    #[test]
    fn test_stop_clears_frame_state() {
        let mut s = started(1200);
        s.process_frame().unwrap();
        assert!(s.depth().is_some());
        s.stop();
        assert!(s.depth().is_none());
        assert_eq!(s.nearest_distance(), Distance::NoReading);
        assert!(s.detect_dead_zone());
    }

    fn jittery() -> SceneSensor<MockStereoSource> {
        let mut s = SceneSensor::new();
        let scene = MockScene {
            jitter: true,
            ..scene(1200)
        };
        s.start_with_source(MockStereoSource::new(scene), config())
            .unwrap();
        s
    }

    #[test]
    fn test_filter_disparity_twice_is_idempotent() {
        let mut s = jittery();
        s.process_frame().unwrap();
        s.process_frame().unwrap();
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        // (304, 200) flickers 29 -> 28; the filter holds it at 29
        assert_eq!(s.raw_disp().and_then(|d| d.get(304, 200)), Some(&28));
        assert_eq!(s.disparity_at(304, 200), 29);
        let once = s.disp().cloned();
        s.filter_disparity().unwrap();
        assert_eq!(s.disp().cloned(), once);
        assert_eq!(s.disparity_at(304, 200), 29);
    }

    #[test]
    fn test_grabbed_frames_feed_filter_history() {
        let mut s = jittery();
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        // the odd frame is never filtered but is still the predecessor
        s.grab().unwrap();
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        assert_eq!(s.raw_disp().and_then(|d| d.get(304, 200)), Some(&28));
        assert_eq!(s.disparity_at(304, 200), 29);
    }

    #[test]
    fn test_floor_removal_exposes_obstacle() {
        let mut s = started(3000);
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        // the floor in front of the camera is nearer than the obstacle
        assert_eq!(s.nearest_distance(), Distance::Millimetres(1386));

        assert!(s.remove_floor().unwrap());
        assert_eq!(s.nearest_distance(), Distance::Millimetres(3023));
        let mask = s.segmentation_mask().unwrap();
        assert_eq!(mask.get(0, 479), Some(&true));
        assert_eq!(mask.get(300, 200), Some(&false));
        assert_eq!(s.distance_at(0, 479), Distance::NoReading);
    }

    #[test]
    fn test_remove_floor_twice_is_idempotent() {
        let mut s = started(3000);
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        assert!(s.remove_floor().unwrap());
        let mask = s.segmentation_mask().cloned();
        let depth = s.depth().cloned();
        assert!(s.remove_floor().unwrap());
        assert_eq!(s.segmentation_mask().cloned(), mask);
        assert_eq!(s.depth().cloned(), depth);
    }

    #[test]
    fn test_process_frame_report_and_queries() {
        let mut s = started(1200);
        let report = s.process_frame().unwrap();
        assert_eq!(report.frame_index, 1);
        assert!(report.has_depth);
        assert!(report.floor.is_some());
        assert!(!report.dead_zone);
        assert!(report.valid_ratio > 0.5);

        assert_eq!(s.nearest_distance(), Distance::Millimetres(1188));
        let ob = s.nearest_obstacle().unwrap();
        assert_eq!(ob.object.bounding_rect, Rect::new(280, 180, 80, 200));
        assert_eq!(ob.object.centre, Point2i::new(320, 280));
        assert_eq!(s.bypass_direction(), Direction::Degrees(-9.0));

        let info = s.scene_info();
        assert_eq!(info.nearest_disp, 28);
        assert_eq!(info.nearest_point.map(|p| p.image), Some(Point2i::new(280, 180)));

        let text = s.metrics().unwrap().encode_text();
        assert!(text.contains("scene_frames_processed 1"));
    }

    #[test]
    fn test_floor_blocks_every_zone_until_removed() {
        let mut s = started(1200);
        s.grab().unwrap();
        s.filter_disparity().unwrap();
        assert_eq!(s.bypass_direction(), Direction::Undefined);
        s.remove_floor().unwrap();
        assert_eq!(s.bypass_direction(), Direction::Degrees(-9.0));
    }

    #[test]
    fn test_roi_restricts_queries() {
        let mut s = started(1200);
        s.process_frame().unwrap();
        s.set_roi(Rect::new(0, 0, 200, 200)).unwrap();
        assert_eq!(s.nearest_distance(), Distance::Millimetres(4751));
        s.set_roi(Rect::new(2000, 2000, 10, 10)).unwrap();
        assert_eq!(s.nearest_distance(), Distance::NoReading);
        assert!(s.nearest_obstacle().is_none());
        assert!(s.detect_dead_zone());
    }

    #[test]
    fn test_discrete_depth_and_outputs() {
        let mut s = started(1200);
        s.process_frame().unwrap();
        assert!(s.discrete_depth().is_none());
        assert!(matches!(
            s.set_discrete_depth_step(0.0),
            Err(Error::InvalidParameter(_))
        ));
        s.set_discrete_depth_step(500.0).unwrap();
        let q = s.discrete_depth().unwrap();
        assert_eq!(q.get(300, 200), Some(&1000));
        assert_eq!(q.get(0, 479), Some(&0));

        assert_eq!(s.disp_mono8().map(<[u8]>::len), Some(640 * 480));
        assert_eq!(s.depth_mono16().map(|b| b.len()), Some(640 * 480 * 2));
        let colored = s.disp_colored().unwrap();
        assert_eq!(colored.data.len(), 640 * 480 * 3);

        let cloud = s.point_cloud().unwrap();
        assert!(cloud.get(0, 479).unwrap().is_none());
        assert_eq!(cloud.get(300, 200).unwrap().map(|p| p.z), Some(1188.0));

        let q8 = s.discrete_depth8().unwrap();
        assert_eq!(q8.get(300, 200), Some(&23));
        assert_eq!(q8.get(0, 479), Some(&0));
    }

    #[test]
    fn test_floor_model_follows_frame_stage() {
        let mut s = started(1200);
        assert!(s.floor_model().is_none());
        let report = s.process_frame().unwrap();
        let model = s.floor_model().unwrap();
        assert_eq!(report.floor, Some(model));
        assert!(model.slope > 0.0);
        // raw keeps the floor, the working disparity does not
        assert!(s.raw_disp().and_then(|d| d.get(0, 479)).is_some_and(|&v| v > 0));
        assert_eq!(s.disparity_at(0, 479), 0);

        s.filter_disparity().unwrap();
        assert!(s.floor_model().is_none());
        assert!(s.disparity_at(0, 479) > 0);
    }

    #[test]
    fn test_export_ply_writes_roi_points() -> anyhow::Result<()> {
        let mut s = started(1200);
        s.process_frame()?;
        s.set_roi(Rect::new(300, 200, 10, 10))?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cloud.ply");
        let n = s.export_ply(path.to_str().unwrap_or_default())?;
        assert_eq!(n, 100);
        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("element vertex 100"));
        Ok(())
    }

    #[test]
    fn test_capture_mode_without_depth() {
        let mut s = SceneSensor::new();
        let cfg = SensorConfig {
            capture_mode: CaptureMode::LeftOnly,
            ..SensorConfig::default()
        };
        s.start_with_source(MockStereoSource::new(scene(1200)), cfg)
            .unwrap();
        let report = s.process_frame().unwrap();
        assert!(!report.has_depth);
        assert!(report.dead_zone);
        assert!(s.left().is_some());
        assert!(s.depth().is_none());
        assert_eq!(s.nearest_distance(), Distance::NoReading);
    }

    #[test]
    fn test_conversions_follow_calibration() {
        let s = started(1200);
        assert_eq!(s.rate(), 15);
        assert_eq!(s.min_distance(), Distance::Millimetres(130));
        assert_eq!(s.max_distance(), Distance::Millimetres(10000));
        assert_eq!(s.dist2disp(Distance::Millimetres(500)), 67);
        assert_eq!(s.disp2dist(0), Distance::NoReading);
        assert_eq!(s.dist2rgb(Distance::NoReading), [0, 0, 0]);
    }

    struct OnePerson;

    impl BiometricsService for OnePerson {
        fn detect(&mut self, _image: &Frame) -> Result<Vec<Rect>> {
            Ok(vec![Rect::new(0, 0, 40, 40), Rect::new(290, 200, 40, 100)])
        }

        fn estimate(&mut self, _image: &Frame, _region: Rect) -> Result<Biometrics> {
            Ok(Biometrics {
                gender: Some(Gender::Female),
                age: Some(34),
                face: None,
            })
        }
    }

    #[test]
    fn test_nearest_human_gets_biometrics() {
        let mut s = started(1200);
        s.process_frame().unwrap();
        s.set_biometrics_service(Box::new(OnePerson));
        let humans = s.humans().unwrap();
        assert_eq!(humans.len(), 2);
        assert!(humans.iter().all(|h| h.biometrics.is_none()));

        let nearest = s.nearest_human_biometrics().unwrap().unwrap();
        assert_eq!(nearest.object.bounding_rect, Rect::new(290, 200, 40, 100));
        assert_eq!(nearest.object.distance, Distance::Millimetres(1188));
        assert_eq!(nearest.biometrics.and_then(|b| b.age), Some(34));
    }

    struct FixedMarker;

    impl MarkerDetector for FixedMarker {
        fn detect(
            &mut self,
            _image: &Frame,
            intrinsics: &CameraIntrinsics,
            marker_size_m: f32,
        ) -> Result<Vec<Marker>> {
            Ok(vec![Marker {
                id: 7,
                corners: [[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]],
                pose: Some(Pose {
                    r: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                    t: [intrinsics.cx, 0.0, marker_size_m as f64],
                }),
            }])
        }
    }

    #[test]
    fn test_markers_use_requested_camera() {
        let mut s = started(1200);
        s.process_frame().unwrap();
        assert!(s.markers(0).unwrap().is_empty());
        assert!(s.init_ar(Box::new(FixedMarker), 0.0).is_err());
        s.init_ar(Box::new(FixedMarker), 0.1).unwrap();
        let found = s.markers(0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pose.map(|p| p.t[0]), Some(320.0));
        // depth_left produces no right image
        assert!(s.markers(1).unwrap().is_empty());
        s.deinit_ar();
        assert!(s.markers(0).unwrap().is_empty());
        assert_eq!(s.ar_camera_parameters().map(|k| k.cy), Some(240.0));
    }
}
